use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Progress counters shared by the reader, the writer and the controller.
///
/// Written from stage workers, read by position/time queries.
#[derive(Debug, Default)]
pub struct SessionCounters {
    opened: AtomicBool,
    failed: AtomicBool,
    /// Bytes consumed from the current resource, including the start offset.
    position_bytes: AtomicU64,
    /// PCM handed to the sink under earlier formats.
    elapsed_base_us: AtomicU64,
    /// Frames handed to the sink under the current format.
    frames: AtomicU64,
    /// Rate of the current format; 0 until the first stream info.
    sample_rate: AtomicU32,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A resource was opened at `offset`.
    pub fn start_resource(&self, offset: u64) {
        self.position_bytes.store(offset, Ordering::Relaxed);
        self.opened.store(true, Ordering::Release);
    }

    pub fn add_bytes(&self, n: u64) {
        self.position_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// The sink was reconfigured for `sample_rate`.
    pub fn set_format(&self, sample_rate: u32) {
        let old_rate = self.sample_rate.load(Ordering::Relaxed);
        let frames = self.frames.swap(0, Ordering::Relaxed);
        if old_rate > 0 {
            self.elapsed_base_us
                .fetch_add(frames_to_us(frames, old_rate), Ordering::Relaxed);
        }
        self.sample_rate.store(sample_rate, Ordering::Release);
    }

    pub fn add_frames(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Bytes consumed from the current resource; `None` before it opened or after a failure.
    pub fn position(&self) -> Option<u64> {
        if self.failed.load(Ordering::Acquire) || !self.opened.load(Ordering::Acquire) {
            return None;
        }
        Some(self.position_bytes.load(Ordering::Relaxed))
    }

    /// Milliseconds of PCM handed to the sink; `None` before the first format or after a failure.
    pub fn elapsed_ms(&self) -> Option<u64> {
        if self.failed.load(Ordering::Acquire) {
            return None;
        }
        let rate = self.sample_rate.load(Ordering::Acquire);
        if rate == 0 {
            return None;
        }
        let current = frames_to_us(self.frames.load(Ordering::Relaxed), rate);
        Some((self.elapsed_base_us.load(Ordering::Relaxed) + current) / 1000)
    }
}

fn frames_to_us(frames: u64, sample_rate: u32) -> u64 {
    frames.saturating_mul(1_000_000) / sample_rate as u64
}
