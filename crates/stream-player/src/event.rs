//! Bounded event bus from stage workers to the controller.
//!
//! Every stage posts onto one queue; the controller is the single consumer.
//! When the queue is full:
//! - a non-critical event evicts the oldest queued non-critical event (or is
//!   dropped itself when only critical events are queued),
//! - a critical event waits briefly for room and then grows the queue.
//!
//! Errors, stream info and terminal state changes are critical and are never
//! dropped. Events from one stage keep their posting order.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use stream_player_types::ErrorCode;

use crate::error::PipelineError;
use crate::info::StreamInfo;
use crate::stage::{StageRole, StageState};

/// Diagnostic carried by an error event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageFault {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    StateChanged(StageState),
    /// Decoder parsed a header; PCM that follows uses this format.
    MusicInfo(StreamInfo),
    Error(StageFault),
    /// Reader started feeding another track of the playlist.
    TrackChanged { index: usize, uri: String },
}

impl EventKind {
    pub fn is_critical(&self) -> bool {
        match self {
            Self::Error(_) | Self::MusicInfo(_) => true,
            Self::StateChanged(state) => state.is_terminal(),
            Self::TrackChanged { .. } => false,
        }
    }
}

/// A message on the bus, keyed by the posting stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageEvent {
    pub source: String,
    pub role: StageRole,
    pub kind: EventKind,
}

/// How a post was handled.
#[derive(Debug, PartialEq, Eq)]
pub enum PostOutcome {
    Queued,
    /// Queued after evicting an older non-critical event.
    EvictedOldest,
    /// The queue held only critical events; this one was discarded.
    Dropped,
    /// Queued beyond capacity after waiting for room.
    Grew,
    Closed,
}

/// Result of waiting on the bus.
#[derive(Debug, PartialEq, Eq)]
pub enum Listen {
    Event(StageEvent),
    Timeout,
    /// Closed and fully drained.
    Closed,
}

#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

struct Shared {
    capacity: usize,
    critical_wait: Duration,
    state: Mutex<BusState>,
    readable: Condvar,
    writable: Condvar,
}

struct BusState {
    queue: VecDeque<StageEvent>,
    closed: bool,
    dropped: u64,
    attached: usize,
}

impl EventBus {
    pub fn new(capacity: usize, critical_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity: capacity.max(1),
                critical_wait,
                state: Mutex::new(BusState {
                    queue: VecDeque::new(),
                    closed: false,
                    dropped: 0,
                    attached: 0,
                }),
                readable: Condvar::new(),
                writable: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn post(&self, event: StageEvent) -> PostOutcome {
        let shared = &self.shared;
        let mut g = self.lock();
        if g.closed {
            return PostOutcome::Closed;
        }

        let mut outcome = PostOutcome::Queued;
        if g.queue.len() >= shared.capacity {
            if event.kind.is_critical() {
                let deadline = Instant::now() + shared.critical_wait;
                while g.queue.len() >= shared.capacity && !g.closed {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    g = shared
                        .writable
                        .wait_timeout(g, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                if g.closed {
                    return PostOutcome::Closed;
                }
                if g.queue.len() >= shared.capacity {
                    tracing::warn!(
                        source = %event.source,
                        queued = g.queue.len(),
                        "event bus over capacity; keeping critical event"
                    );
                    outcome = PostOutcome::Grew;
                }
            } else if let Some(idx) = g.queue.iter().position(|e| !e.kind.is_critical()) {
                let evicted = g.queue.remove(idx);
                g.dropped += 1;
                tracing::warn!(
                    evicted = ?evicted.map(|e| e.kind),
                    "event bus full; dropped oldest non-critical event"
                );
                outcome = PostOutcome::EvictedOldest;
            } else {
                g.dropped += 1;
                tracing::warn!(kind = ?event.kind, "event bus full; dropped event");
                return PostOutcome::Dropped;
            }
        }

        g.queue.push_back(event);
        drop(g);
        shared.readable.notify_one();
        outcome
    }

    /// Wait up to `timeout` for the next event.
    pub fn listen(&self, timeout: Duration) -> Listen {
        let shared = &self.shared;
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            if let Some(event) = g.queue.pop_front() {
                drop(g);
                shared.writable.notify_all();
                return Listen::Event(event);
            }
            if g.closed {
                return Listen::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Listen::Timeout;
            }
            g = shared
                .readable
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Reject further posts; queued events can still be listened to.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        drop(g);
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Non-critical events discarded so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn attach(&self) {
        self.lock().attached += 1;
    }

    pub(crate) fn detach(&self) {
        let mut g = self.lock();
        g.attached = g.attached.saturating_sub(1);
    }

    /// Pipelines currently using this bus as their listener.
    pub fn attached(&self) -> usize {
        self.lock().attached
    }

    /// Close the bus for good. Fails while any pipeline still listens on it.
    pub fn destroy(self) -> Result<(), PipelineError> {
        let attached = self.attached();
        if attached > 0 {
            return Err(PipelineError::ListenerAttached(attached));
        }
        self.close();
        Ok(())
    }

    pub(crate) fn sender(&self, source: &str, role: StageRole) -> EventSender {
        EventSender {
            bus: self.clone(),
            source: source.to_string(),
            role,
        }
    }
}

/// Posting side bound to one stage.
#[derive(Clone)]
pub struct EventSender {
    bus: EventBus,
    source: String,
    role: StageRole,
}

impl EventSender {
    pub fn post(&self, kind: EventKind) -> PostOutcome {
        self.bus.post(StageEvent {
            source: self.source.clone(),
            role: self.role,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn event(kind: EventKind) -> StageEvent {
        StageEvent {
            source: "decoder".to_string(),
            role: StageRole::Decoder,
            kind,
        }
    }

    fn running() -> StageEvent {
        event(EventKind::StateChanged(StageState::Running))
    }

    fn error(msg: &str) -> StageEvent {
        event(EventKind::Error(StageFault {
            code: ErrorCode::DecodeError,
            message: msg.to_string(),
        }))
    }

    fn drain(bus: &EventBus) -> Vec<StageEvent> {
        let mut out = Vec::new();
        while let Listen::Event(e) = bus.listen(Duration::ZERO) {
            out.push(e);
        }
        out
    }

    #[test]
    fn full_bus_evicts_oldest_non_critical() {
        let bus = EventBus::new(2, Duration::from_millis(1));
        bus.post(running());
        bus.post(error("first"));
        let track = event(EventKind::TrackChanged {
            index: 1,
            uri: "b".to_string(),
        });
        assert_eq!(bus.post(track.clone()), PostOutcome::EvictedOldest);
        assert_eq!(drain(&bus), vec![error("first"), track]);
        assert_eq!(bus.dropped(), 1);
    }

    #[test]
    fn errors_are_never_dropped() {
        let bus = EventBus::new(2, Duration::from_millis(1));
        bus.post(error("a"));
        bus.post(error("b"));
        assert_eq!(bus.post(running()), PostOutcome::Dropped);
        assert_eq!(bus.post(error("c")), PostOutcome::Grew);
        let got = drain(&bus);
        assert_eq!(got, vec![error("a"), error("b"), error("c")]);
    }

    #[test]
    fn critical_post_waits_for_consumer() {
        let bus = EventBus::new(1, Duration::from_secs(2));
        bus.post(running());
        let consumer = bus.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            consumer.listen(Duration::from_secs(1))
        });
        assert_eq!(bus.post(error("late")), PostOutcome::Queued);
        assert_eq!(handle.join().unwrap(), Listen::Event(running()));
        assert_eq!(drain(&bus), vec![error("late")]);
    }

    #[test]
    fn closed_bus_drains_then_reports_closed() {
        let bus = EventBus::new(4, Duration::ZERO);
        bus.post(running());
        bus.close();
        assert_eq!(bus.post(running()), PostOutcome::Closed);
        assert_eq!(bus.listen(Duration::ZERO), Listen::Event(running()));
        assert_eq!(bus.listen(Duration::ZERO), Listen::Closed);
    }

    #[test]
    fn destroy_rejected_while_attached() {
        let bus = EventBus::new(4, Duration::ZERO);
        bus.attach();
        let err = bus.clone().destroy().unwrap_err();
        assert!(matches!(err, PipelineError::ListenerAttached(1)));
        bus.detach();
        bus.destroy().unwrap();
    }

    #[test]
    fn sender_stamps_source_and_role() {
        let bus = EventBus::new(4, Duration::ZERO);
        let tx = bus.sender("i2s", StageRole::Writer);
        tx.post(EventKind::StateChanged(StageState::Finished));
        let Listen::Event(e) = bus.listen(Duration::ZERO) else {
            panic!("expected event");
        };
        assert_eq!(e.source, "i2s");
        assert_eq!(e.role, StageRole::Writer);
        assert!(e.kind.is_critical());
    }
}
