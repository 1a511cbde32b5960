//! Audio output seam.
//!
//! The writer stage talks to an [`AudioSink`]; the process-wide
//! [`AudioBoard`](crate::board::AudioBoard) hands one out per session through
//! an [`OutputFactory`]. The cpal backend lives in [`cpal_out`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use anyhow::Result;

use crate::info::StreamInfo;

pub mod cpal_out;

/// A PCM consumer (I2S codec, sound card, test recorder).
pub trait AudioSink: Send {
    /// Prepare for `info`. Called before the first PCM and on every format change.
    fn configure(&mut self, info: &StreamInfo) -> Result<()>;

    /// Queue whole frames of PCM. Returns the bytes accepted, which is either
    /// all of `pcm` or 0 when there was no room within `timeout`.
    fn write(&mut self, pcm: &[u8], timeout: Duration) -> Result<usize>;

    /// Wait up to `timeout` for queued PCM to play out. `true` once empty.
    fn drain(&mut self, timeout: Duration) -> Result<bool>;

    /// Output silence without consuming PCM while `paused` is set.
    fn bind_pause(&mut self, _paused: Arc<AtomicBool>) {}

    /// Give up long waits once `abort` is set, checking at least every `slice`.
    fn bind_abort(&mut self, _abort: Arc<AtomicBool>, _slice: Duration) {}
}

pub trait OutputFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioSink>>;

    /// Human-readable name for logs.
    fn describe(&self) -> String;
}

/// Master volume, 0..=100.
pub trait VolumeControl: Send + Sync {
    fn get(&self) -> u8;
    fn set(&self, volume: u8) -> Result<()>;
}

/// Volume applied as a gain in the output callback.
#[derive(Debug)]
pub struct SoftwareVolume {
    level: AtomicU8,
}

impl SoftwareVolume {
    pub fn new(initial: u8) -> Self {
        Self {
            level: AtomicU8::new(initial.min(100)),
        }
    }

    /// Linear gain for the current level.
    pub fn gain(&self) -> f32 {
        let level = self.level.load(Ordering::Relaxed) as f32 / 100.0;
        level * level
    }
}

impl VolumeControl for SoftwareVolume {
    fn get(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }

    fn set(&self, volume: u8) -> Result<()> {
        anyhow::ensure!(volume <= 100, "volume {volume} out of range");
        self.level.store(volume, Ordering::Relaxed);
        Ok(())
    }
}
