//! Track advance, playlist looping and transient reconnects for the reader.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::ReaderConfig;

/// Something the reader observed about its current resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceEvent {
    /// The current track was read to its end.
    TrackFinished,
    /// The last track of the list was read to its end.
    PlaylistFinished,
    /// The transfer broke after `offset` bytes of the current track.
    ReadFailed {
        offset: u64,
        transient: bool,
        reason: String,
    },
}

/// What the reader should do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Stream the next track without tearing anything down.
    Advance { index: usize, uri: String },
    /// Start over from the first track.
    Restart { uri: String },
    /// Reopen the current track at `offset` after `delay`.
    Resume {
        uri: String,
        offset: u64,
        delay: Duration,
        attempt: u32,
    },
    /// Natural end of stream.
    Finish,
    Fail(String),
}

pub struct ReconnectPolicy {
    tracks: Vec<String>,
    current: usize,
    is_playlist: bool,
    loop_playlist: bool,
    max_attempts: u32,
    backoff: Duration,
    attempts: u32,
    /// Data arrived since the list was last (re)started.
    delivered: bool,
    halted: Arc<AtomicBool>,
}

impl ReconnectPolicy {
    /// Policy for a resolved playlist. `tracks` must not be empty.
    pub fn playlist(tracks: Vec<String>, cfg: &ReaderConfig) -> Self {
        Self::build(tracks, true, cfg)
    }

    /// Policy for a plain URI: its end is the end of the stream.
    pub fn single(uri: String, cfg: &ReaderConfig) -> Self {
        Self::build(vec![uri], false, cfg)
    }

    fn build(tracks: Vec<String>, is_playlist: bool, cfg: &ReaderConfig) -> Self {
        Self {
            tracks,
            current: 0,
            is_playlist,
            loop_playlist: cfg.loop_playlist,
            max_attempts: cfg.reconnect_attempts,
            backoff: cfg.reconnect_backoff,
            attempts: 0,
            delivered: false,
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn current(&self) -> (usize, &str) {
        (self.current, &self.tracks[self.current])
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Flag the controller sets to keep the policy from advancing or looping.
    pub fn halt_handle(&self) -> Arc<AtomicBool> {
        self.halted.clone()
    }

    /// Share a halt flag created before the policy (the reader resolves its
    /// playlist on the worker, after the controller took the flag).
    pub fn halted_by(mut self, flag: Arc<AtomicBool>) -> Self {
        self.halted = flag;
        self
    }

    /// Bytes of the current track arrived; reconnect attempts start over.
    pub fn on_progress(&mut self) {
        self.attempts = 0;
        self.delivered = true;
    }

    pub fn on_event(&mut self, event: ResourceEvent) -> Decision {
        if self.halted.load(Ordering::Acquire) {
            return Decision::Finish;
        }
        match event {
            ResourceEvent::TrackFinished => {
                if !self.is_playlist {
                    return Decision::Finish;
                }
                if self.current + 1 < self.tracks.len() {
                    self.current += 1;
                    self.attempts = 0;
                    return Decision::Advance {
                        index: self.current,
                        uri: self.tracks[self.current].clone(),
                    };
                }
                self.on_event(ResourceEvent::PlaylistFinished)
            }
            ResourceEvent::PlaylistFinished => {
                if !self.is_playlist || !self.loop_playlist {
                    return Decision::Finish;
                }
                if !self.delivered {
                    return Decision::Fail("playlist produced no data".to_string());
                }
                self.current = 0;
                self.attempts = 0;
                self.delivered = false;
                Decision::Restart {
                    uri: self.tracks[0].clone(),
                }
            }
            ResourceEvent::ReadFailed {
                offset,
                transient,
                reason,
            } => {
                if !transient {
                    return Decision::Fail(reason);
                }
                if self.attempts >= self.max_attempts {
                    return Decision::Fail(format!(
                        "{reason} (gave up after {} reconnects)",
                        self.max_attempts
                    ));
                }
                self.attempts += 1;
                Decision::Resume {
                    uri: self.tracks[self.current].clone(),
                    offset,
                    delay: self.backoff * self.attempts,
                    attempt: self.attempts,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ReaderConfig {
        ReaderConfig {
            reconnect_attempts: 2,
            reconnect_backoff: Duration::from_millis(10),
            ..ReaderConfig::default()
        }
    }

    fn tracks() -> Vec<String> {
        vec!["http://h/a.mp3".to_string(), "http://h/b.mp3".to_string()]
    }

    fn broke(offset: u64, transient: bool) -> ResourceEvent {
        ResourceEvent::ReadFailed {
            offset,
            transient,
            reason: "connection reset".to_string(),
        }
    }

    #[test]
    fn track_finished_advances_then_restarts() {
        let mut p = ReconnectPolicy::playlist(tracks(), &cfg());
        p.on_progress();
        assert_eq!(
            p.on_event(ResourceEvent::TrackFinished),
            Decision::Advance {
                index: 1,
                uri: "http://h/b.mp3".to_string()
            }
        );
        assert_eq!(
            p.on_event(ResourceEvent::TrackFinished),
            Decision::Restart {
                uri: "http://h/a.mp3".to_string()
            }
        );
        assert_eq!(p.current().0, 0);
    }

    #[test]
    fn single_uri_finishes_at_end() {
        let mut p = ReconnectPolicy::single("http://h/a.mp3".to_string(), &cfg());
        assert_eq!(p.on_event(ResourceEvent::TrackFinished), Decision::Finish);
        assert_eq!(p.on_event(ResourceEvent::PlaylistFinished), Decision::Finish);
    }

    #[test]
    fn halt_prevents_restart() {
        let mut p = ReconnectPolicy::playlist(tracks(), &cfg());
        p.on_progress();
        p.halt_handle().store(true, Ordering::Release);
        assert_eq!(p.on_event(ResourceEvent::PlaylistFinished), Decision::Finish);
    }

    #[test]
    fn no_loop_when_disabled() {
        let cfg = ReaderConfig {
            loop_playlist: false,
            ..cfg()
        };
        let mut p = ReconnectPolicy::playlist(tracks(), &cfg);
        p.on_progress();
        assert_eq!(p.on_event(ResourceEvent::PlaylistFinished), Decision::Finish);
    }

    #[test]
    fn empty_cycle_fails_instead_of_spinning() {
        let mut p = ReconnectPolicy::playlist(tracks(), &cfg());
        assert!(matches!(
            p.on_event(ResourceEvent::PlaylistFinished),
            Decision::Fail(_)
        ));
    }

    #[test]
    fn transient_failures_resume_with_backoff_until_exhausted() {
        let mut p = ReconnectPolicy::single("http://h/a.mp3".to_string(), &cfg());
        assert_eq!(
            p.on_event(broke(4096, true)),
            Decision::Resume {
                uri: "http://h/a.mp3".to_string(),
                offset: 4096,
                delay: Duration::from_millis(10),
                attempt: 1
            }
        );
        assert!(matches!(
            p.on_event(broke(4096, true)),
            Decision::Resume { attempt: 2, delay, .. } if delay == Duration::from_millis(20)
        ));
        assert!(matches!(p.on_event(broke(4096, true)), Decision::Fail(_)));
    }

    #[test]
    fn progress_resets_attempts() {
        let mut p = ReconnectPolicy::single("u".to_string(), &cfg());
        p.on_event(broke(1, true));
        p.on_event(broke(1, true));
        p.on_progress();
        assert!(matches!(
            p.on_event(broke(2, true)),
            Decision::Resume { attempt: 1, .. }
        ));
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let mut p = ReconnectPolicy::single("u".to_string(), &cfg());
        assert_eq!(
            p.on_event(broke(0, false)),
            Decision::Fail("connection reset".to_string())
        );
    }
}
