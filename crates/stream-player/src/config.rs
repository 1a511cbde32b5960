use std::time::Duration;

/// Sizing and timing shared by every stage of a pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Capacity in bytes of the reader → decoder ring buffer.
    pub stream_buffer_bytes: usize,
    /// Capacity in bytes of the decoder → writer (PCM) ring buffer.
    pub pcm_buffer_bytes: usize,
    /// Slice length of every blocking buffer wait; bounds how long a stage
    /// takes to notice pause/stop requests.
    pub io_timeout: Duration,
    /// Number of queued events before non-critical ones are dropped.
    pub event_capacity: usize,
    /// How long a critical event waits for room before the bus grows.
    pub critical_post_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stream_buffer_bytes: 8 * 1024,
            pcm_buffer_bytes: 32 * 1024,
            io_timeout: Duration::from_millis(50),
            event_capacity: 32,
            critical_post_wait: Duration::from_millis(20),
        }
    }
}

/// Network reader tuning.
#[derive(Clone, Debug)]
pub struct ReaderConfig {
    /// Bytes pulled from the transport per read.
    pub chunk_bytes: usize,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// Resume attempts after a transient mid-track failure.
    pub reconnect_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * reconnect_backoff`.
    pub reconnect_backoff: Duration,
    /// Restart from the first track when a playlist runs out.
    pub loop_playlist: bool,
    /// Largest playlist body accepted.
    pub max_playlist_bytes: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 4 * 1024,
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_millis(250),
            loop_playlist: true,
            max_playlist_bytes: 64 * 1024,
        }
    }
}

/// Controller tuning.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    pub pipeline: PipelineConfig,
    pub reader: ReaderConfig,
    /// Poll interval while `play()` waits for a pre-empted session.
    pub stop_poll_interval: Duration,
    /// Number of polls before `play()` gives up waiting and tears down anyway.
    pub stop_poll_retries: u32,
    /// Bound used by `stop()` when waiting for the pipeline to settle.
    pub stop_timeout: Duration,
    /// Attempts to lease the output before `play()` fails.
    pub board_acquire_retries: u32,
    /// Volume applied when the player is created.
    pub initial_volume: u8,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            reader: ReaderConfig::default(),
            stop_poll_interval: Duration::from_millis(100),
            stop_poll_retries: 20,
            stop_timeout: Duration::from_secs(2),
            board_acquire_retries: 10,
            initial_volume: 60,
        }
    }
}

impl PlayerConfig {
    /// Total time `play()` may spend waiting for a previous session.
    pub fn preempt_budget(&self) -> Duration {
        self.stop_poll_interval * self.stop_poll_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preempt_budget_matches_poll_settings() {
        let cfg = PlayerConfig::default();
        assert_eq!(cfg.preempt_budget(), Duration::from_secs(2));
    }

    #[test]
    fn pcm_link_is_larger_than_stream_link() {
        let cfg = PipelineConfig::default();
        assert!(cfg.pcm_buffer_bytes > cfg.stream_buffer_bytes);
    }
}
