//! Bounded byte ring connecting two adjacent stages.
//!
//! One producer writes, one consumer reads. Besides bytes the ring carries
//! positioned [`Marker`]s: a marker written after `n` bytes is handed to the
//! consumer exactly when it has read those `n` bytes, never earlier. The
//! reader uses this to delimit tracks, and the decoder to announce a new
//! [`StreamInfo`] ahead of the PCM decoded under it, so the writer always
//! reconfigures between frames.
//!
//! Shutdown is deterministic:
//! - `mark_done()` (producer finished): reads drain what is left, then report `Done`;
//!   further writes report `Closed`.
//! - `abort()` (stop now): every pending and future operation reports `Aborted`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::info::StreamInfo;

/// In-band notice carried alongside the byte stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Marker {
    /// Bytes after this point are PCM in the given format.
    Format(StreamInfo),
    /// Bytes after this point belong to the track fetched from `uri`.
    TrackStart { uri: String },
}

/// What the next `read` would return, without consuming it.
#[derive(Debug, PartialEq, Eq)]
pub enum Readiness {
    Bytes,
    Marker,
    Timeout,
    Done,
    Aborted,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n > 0` bytes were copied (0 only for an empty destination).
    Data(usize),
    Marker(Marker),
    /// Nothing arrived within the timeout.
    Timeout,
    /// Producer finished and everything has been consumed.
    Done,
    Aborted,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A prefix of `n` bytes was accepted.
    Written(usize),
    /// No room freed up within the timeout.
    Timeout,
    /// The ring was marked done; no more data is accepted.
    Closed,
    Aborted,
}

pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<RingInner>,
    cv: Condvar,
}

struct RingInner {
    storage: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    len: usize,
    total_read: u64,
    total_written: u64,
    markers: VecDeque<(u64, Marker)>,
    done: bool,
    aborted: bool,
}

impl RingBuffer {
    /// Create a ring holding at most `capacity` bytes (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(RingInner {
                storage: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
                len: 0,
                total_read: 0,
                total_written: 0,
                markers: VecDeque::new(),
                done: false,
                aborted: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until<'a>(
        &self,
        g: MutexGuard<'a, RingInner>,
        deadline: Instant,
    ) -> Option<MutexGuard<'a, RingInner>> {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let (g, _) = self
            .cv
            .wait_timeout(g, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        Some(g)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffered bytes (best-effort snapshot).
    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes handed to the consumer so far.
    pub fn total_read(&self) -> u64 {
        self.lock().total_read
    }

    /// Read up to `out.len()` bytes, waiting at most `timeout` for data.
    ///
    /// Reads never cross a pending marker: bytes before it are returned first,
    /// then the marker itself on the next call.
    pub fn read(&self, out: &mut [u8], timeout: Duration) -> ReadOutcome {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            if g.aborted {
                return ReadOutcome::Aborted;
            }
            if g.markers.front().is_some_and(|(at, _)| *at == g.total_read) {
                if let Some((_, marker)) = g.markers.pop_front() {
                    drop(g);
                    self.cv.notify_all();
                    return ReadOutcome::Marker(marker);
                }
            }
            if out.is_empty() {
                return ReadOutcome::Data(0);
            }
            if g.len > 0 {
                let until_marker = g
                    .markers
                    .front()
                    .map(|(at, _)| (at - g.total_read) as usize)
                    .unwrap_or(usize::MAX);
                let n = out.len().min(g.len).min(until_marker);
                let inner = &mut *g;
                let first = n.min(self.capacity - inner.read_pos);
                out[..first].copy_from_slice(&inner.storage[inner.read_pos..inner.read_pos + first]);
                out[first..n].copy_from_slice(&inner.storage[..n - first]);
                inner.read_pos = (inner.read_pos + n) % self.capacity;
                inner.len -= n;
                inner.total_read += n as u64;
                drop(g);
                self.cv.notify_all();
                return ReadOutcome::Data(n);
            }
            if g.done {
                return ReadOutcome::Done;
            }
            g = match self.wait_until(g, deadline) {
                Some(g) => g,
                None => return ReadOutcome::Timeout,
            };
        }
    }

    /// Wait until a `read` would not block, without consuming anything.
    pub fn wait_readable(&self, timeout: Duration) -> Readiness {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            if g.aborted {
                return Readiness::Aborted;
            }
            if g.markers.front().is_some_and(|(at, _)| *at == g.total_read) {
                return Readiness::Marker;
            }
            if g.len > 0 {
                return Readiness::Bytes;
            }
            if g.done {
                return Readiness::Done;
            }
            g = match self.wait_until(g, deadline) {
                Some(g) => g,
                None => return Readiness::Timeout,
            };
        }
    }

    /// Write a prefix of `data`, waiting at most `timeout` for room.
    pub fn write(&self, data: &[u8], timeout: Duration) -> WriteOutcome {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            if g.aborted {
                return WriteOutcome::Aborted;
            }
            if g.done {
                return WriteOutcome::Closed;
            }
            if data.is_empty() {
                return WriteOutcome::Written(0);
            }
            if g.len < self.capacity {
                let n = data.len().min(self.capacity - g.len);
                let inner = &mut *g;
                let first = n.min(self.capacity - inner.write_pos);
                inner.storage[inner.write_pos..inner.write_pos + first].copy_from_slice(&data[..first]);
                inner.storage[..n - first].copy_from_slice(&data[first..n]);
                inner.write_pos = (inner.write_pos + n) % self.capacity;
                inner.len += n;
                inner.total_written += n as u64;
                drop(g);
                self.cv.notify_all();
                return WriteOutcome::Written(n);
            }
            g = match self.wait_until(g, deadline) {
                Some(g) => g,
                None => return WriteOutcome::Timeout,
            };
        }
    }

    /// Queue `marker` after every byte written so far.
    ///
    /// Returns `false` when the ring no longer accepts input.
    pub fn push_marker(&self, marker: Marker) -> bool {
        let mut g = self.lock();
        if g.aborted || g.done {
            return false;
        }
        let at = g.total_written;
        g.markers.push_back((at, marker));
        drop(g);
        self.cv.notify_all();
        true
    }

    /// Signal that no more data will be written. Idempotent.
    pub fn mark_done(&self) {
        let mut g = self.lock();
        g.done = true;
        drop(g);
        self.cv.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Fail every pending and future operation and drop buffered data.
    pub fn abort(&self) {
        let mut g = self.lock();
        g.aborted = true;
        g.len = 0;
        g.markers.clear();
        drop(g);
        self.cv.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// `true` once the producer is done and the consumer has taken everything.
    pub fn is_drained(&self) -> bool {
        let g = self.lock();
        g.done && g.len == 0 && g.markers.is_empty()
    }
}
