//! Bounded queue of interleaved `f32` samples between the writer and the
//! cpal callback.
//!
//! The writer side blocks with a timeout; the callback side never blocks.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub struct FrameQueue {
    channels: usize,
    max_samples: usize,
    inner: Mutex<VecDeque<f32>>,
    cv: Condvar,
}

/// Queue capacity in samples for `buffer_seconds` of audio.
///
/// Non-finite or non-positive durations fall back to half a second.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        0.5
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl FrameQueue {
    pub fn new(channels: usize, max_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            max_samples: max_samples.max(channels),
            inner: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<f32>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn len_frames(&self) -> usize {
        self.lock().len() / self.channels
    }

    /// Wait up to `timeout` for the queue to drop below capacity.
    pub fn wait_room(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        while g.len() >= self.max_samples {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            g = self
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Append all of `samples`. May overshoot capacity by one batch.
    pub fn push(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        self.lock().extend(samples.iter().copied());
        self.cv.notify_all();
    }

    /// Take up to `max_frames` whole frames without blocking.
    pub fn pop_nonblocking(&self, max_frames: usize, out: &mut Vec<f32>) -> bool {
        let mut g = self.lock();
        let take = (g.len() / self.channels).min(max_frames) * self.channels;
        if take == 0 {
            return false;
        }
        out.clear();
        out.extend(g.drain(..take));
        drop(g);
        self.cv.notify_all();
        true
    }

    /// Wait up to `timeout` for the callback to consume everything.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        while g.len() >= self.channels {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            g = self
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn clear(&self) {
        self.lock().clear();
        self.cv.notify_all();
    }
}
