//! Process-wide audio hardware: one output, one volume control.
//!
//! A session leases the output for its writer stage; the lease is released
//! when the stage (and with it the sink) is destroyed. Only one lease can be
//! outstanding, so two sessions never write to the hardware at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;

use crate::error::BoardError;
use crate::info::StreamInfo;
use crate::output::cpal_out::{CpalConfig, CpalOutput};
use crate::output::{AudioSink, OutputFactory, SoftwareVolume, VolumeControl};

static BOARD: OnceLock<Arc<AudioBoard>> = OnceLock::new();

pub struct AudioBoard {
    output: Box<dyn OutputFactory>,
    volume: Arc<dyn VolumeControl>,
    leased: Arc<AtomicBool>,
}

impl AudioBoard {
    pub fn new(output: Box<dyn OutputFactory>, volume: Arc<dyn VolumeControl>) -> Self {
        Self {
            output,
            volume,
            leased: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Board driving a cpal device with software volume.
    pub fn cpal(config: CpalConfig, initial_volume: u8) -> Self {
        let volume = Arc::new(SoftwareVolume::new(initial_volume));
        Self::new(Box::new(CpalOutput::new(config, volume.clone())), volume)
    }

    /// Install the process-wide board. Only the first call runs `init`;
    /// every call returns the installed board.
    pub fn init_once(init: impl FnOnce() -> AudioBoard) -> Arc<AudioBoard> {
        BOARD
            .get_or_init(|| {
                let board = init();
                tracing::info!(output = %board.output.describe(), "audio board initialised");
                Arc::new(board)
            })
            .clone()
    }

    /// The installed board, if any.
    pub fn global() -> Option<Arc<AudioBoard>> {
        BOARD.get().cloned()
    }

    pub fn volume(&self) -> &Arc<dyn VolumeControl> {
        &self.volume
    }

    pub fn describe(&self) -> String {
        self.output.describe()
    }

    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    /// Lease the output exclusively.
    pub fn acquire(&self) -> Result<OutputLease, BoardError> {
        if self
            .leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BoardError::Busy);
        }
        match self.output.open() {
            Ok(sink) => Ok(OutputLease {
                sink: Some(sink),
                leased: self.leased.clone(),
            }),
            Err(e) => {
                self.leased.store(false, Ordering::Release);
                Err(BoardError::Output(e))
            }
        }
    }
}

/// Exclusive use of the board's output.
pub struct OutputLease {
    sink: Option<Box<dyn AudioSink>>,
    leased: Arc<AtomicBool>,
}

impl OutputLease {
    fn sink(&mut self) -> Result<&mut Box<dyn AudioSink>> {
        self.sink
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("output lease already released"))
    }
}

impl AudioSink for OutputLease {
    fn configure(&mut self, info: &StreamInfo) -> Result<()> {
        self.sink()?.configure(info)
    }

    fn write(&mut self, pcm: &[u8], timeout: Duration) -> Result<usize> {
        self.sink()?.write(pcm, timeout)
    }

    fn drain(&mut self, timeout: Duration) -> Result<bool> {
        self.sink()?.drain(timeout)
    }

    fn bind_pause(&mut self, paused: Arc<AtomicBool>) {
        if let Some(sink) = self.sink.as_mut() {
            sink.bind_pause(paused);
        }
    }

    fn bind_abort(&mut self, abort: Arc<AtomicBool>, slice: Duration) {
        if let Some(sink) = self.sink.as_mut() {
            sink.bind_abort(abort, slice);
        }
    }
}

impl Drop for OutputLease {
    fn drop(&mut self) {
        // Close the device before the next session may open it.
        self.sink = None;
        self.leased.store(false, Ordering::Release);
    }
}
