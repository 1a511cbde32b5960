//! cpal-backed output.
//!
//! `cpal::Stream` is not `Send` on every host, so each configured format
//! gets its own output thread that builds, plays and finally drops the
//! stream. The writer stage only ever touches the [`FrameQueue`] feeding it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use cpal::traits::StreamTrait;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};

use super::{AudioSink, OutputFactory, SoftwareVolume};
use crate::info::StreamInfo;

pub mod device;
pub mod frame_queue;
pub mod playback;
pub mod resample;

use frame_queue::{FrameQueue, calc_max_buffered_samples};
use playback::{PlaybackConfig, build_output_stream};
use resample::StreamResampler;

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct CpalConfig {
    /// Substring of the output device name; the host default when unset.
    pub device: Option<String>,
    /// Audio buffered ahead of the callback.
    pub buffer_seconds: f32,
    /// Frames pulled from the queue per callback refill.
    pub refill_max_frames: usize,
    /// Resampler input chunk in frames.
    pub chunk_frames: usize,
}

impl Default for CpalConfig {
    fn default() -> Self {
        Self {
            device: None,
            buffer_seconds: 0.5,
            refill_max_frames: 4096,
            chunk_frames: 1024,
        }
    }
}

/// Opens [`CpalSink`]s on the configured device.
pub struct CpalOutput {
    config: CpalConfig,
    volume: Arc<SoftwareVolume>,
}

impl CpalOutput {
    pub fn new(config: CpalConfig, volume: Arc<SoftwareVolume>) -> Self {
        Self { config, volume }
    }
}

impl OutputFactory for CpalOutput {
    fn open(&self) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(CpalSink {
            config: self.config.clone(),
            volume: self.volume.clone(),
            paused: None,
            watch: AbortWatch::default(),
            active: None,
            samples: Vec::new(),
            resampled: Vec::new(),
        }))
    }

    fn describe(&self) -> String {
        match &self.config.device {
            Some(name) => format!("cpal:{name}"),
            None => "cpal:default".to_string(),
        }
    }
}

pub struct CpalSink {
    config: CpalConfig,
    volume: Arc<SoftwareVolume>,
    paused: Option<Arc<AtomicBool>>,
    watch: AbortWatch,
    active: Option<ActiveOutput>,
    samples: Vec<f32>,
    resampled: Vec<f32>,
}

/// Abort flag bound by the writer stage, polled every `slice`.
#[derive(Clone)]
struct AbortWatch {
    flag: Option<Arc<AtomicBool>>,
    slice: Duration,
}

impl Default for AbortWatch {
    fn default() -> Self {
        Self {
            flag: None,
            slice: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Waited<T> {
    Ready(T),
    TimedOut,
    Aborted,
}

impl AbortWatch {
    fn aborted(&self) -> bool {
        self.flag.as_ref().is_some_and(|f| f.load(Ordering::Acquire))
    }

    /// Poll `step` one slice at a time until it yields, `total` elapses or
    /// the stage aborts.
    fn wait<T>(&self, total: Duration, mut step: impl FnMut(Duration) -> Option<T>) -> Waited<T> {
        let deadline = Instant::now() + total;
        let slice = self.slice.max(Duration::from_millis(1));
        loop {
            if self.aborted() {
                return Waited::Aborted;
            }
            let now = Instant::now();
            if now >= deadline {
                return Waited::TimedOut;
            }
            if let Some(v) = step(slice.min(deadline - now)) {
                return Waited::Ready(v);
            }
        }
    }
}

struct ActiveOutput {
    bits: u16,
    queue: Arc<FrameQueue>,
    resampler: Option<StreamResampler>,
    flushed: bool,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ActiveOutput {
    fn start(
        config: &CpalConfig,
        info: &StreamInfo,
        volume: Arc<SoftwareVolume>,
        paused: Option<Arc<AtomicBool>>,
        watch: &AbortWatch,
    ) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<Result<(u32, Arc<FrameQueue>)>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let device_name = config.device.clone();
        let buffer_seconds = config.buffer_seconds;
        let refill_max_frames = config.refill_max_frames;
        let src_rate = info.sample_rate;
        let src_channels = info.channels as usize;

        let thread = thread::Builder::new()
            .name("audio-out".to_string())
            .spawn(move || {
                let built = (|| -> Result<(cpal::Stream, u32, Arc<FrameQueue>)> {
                    let host = cpal::default_host();
                    let device = device::pick_device(&host, device_name.as_deref())?;
                    let supported = device::pick_output_config(&device, src_rate)?;
                    let mut stream_config: cpal::StreamConfig = supported.config();
                    if let Some(size) = device::pick_buffer_size(&supported) {
                        stream_config.buffer_size = size;
                    }
                    let device_rate = stream_config.sample_rate;
                    let queue = Arc::new(FrameQueue::new(
                        src_channels,
                        calc_max_buffered_samples(device_rate, src_channels, buffer_seconds),
                    ));
                    let stream = build_output_stream(
                        &device,
                        &stream_config,
                        supported.sample_format(),
                        &queue,
                        PlaybackConfig {
                            refill_max_frames,
                            paused,
                            volume,
                        },
                    )?;
                    stream.play().context("start output stream")?;
                    tracing::info!(
                        source_rate = src_rate,
                        device_rate,
                        device_channels = stream_config.channels,
                        format = ?supported.sample_format(),
                        "output stream started"
                    );
                    Ok((stream, device_rate, queue))
                })();
                match built {
                    Ok((stream, device_rate, queue)) => {
                        let _ = ready_tx.send(Ok((device_rate, queue)));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .context("spawn output thread")?;

        let opened = watch.wait(OPEN_TIMEOUT, |slice| match ready_rx.recv_timeout(slice) {
            Ok(r) => Some(r),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(anyhow!("output thread exited early"))),
        });
        // Returning early drops `stop_tx`, which closes a late-opening stream.
        let (device_rate, queue) = match opened {
            Waited::Ready(r) => r?,
            Waited::TimedOut => {
                return Err(anyhow!("output device did not open within {OPEN_TIMEOUT:?}"));
            }
            Waited::Aborted => return Err(anyhow!("aborted while opening the output")),
        };

        let resampler = if device_rate != src_rate {
            Some(StreamResampler::new(
                src_rate,
                device_rate,
                src_channels,
                config.chunk_frames,
            )?)
        } else {
            None
        };

        Ok(Self {
            bits: info.bits,
            queue,
            resampler,
            flushed: false,
            shutdown: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

impl Drop for ActiveOutput {
    fn drop(&mut self) {
        self.queue.clear();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl AudioSink for CpalSink {
    fn configure(&mut self, info: &StreamInfo) -> Result<()> {
        if let Some(active) = self.active.as_mut() {
            // Let the previous format play out before its stream goes away.
            if let Some(rs) = active.resampler.as_mut() {
                self.resampled.clear();
                rs.flush(&mut self.resampled)?;
                active.queue.push(&self.resampled);
            }
            let queue = active.queue.clone();
            let drained = self
                .watch
                .wait(DRAIN_TIMEOUT, |slice| queue.wait_empty(slice).then_some(()));
            if drained == Waited::Aborted {
                self.active = None;
                return Err(anyhow!("aborted while draining the previous format"));
            }
        }
        self.active = None;
        self.active = Some(ActiveOutput::start(
            &self.config,
            info,
            self.volume.clone(),
            self.paused.clone(),
            &self.watch,
        )?);
        Ok(())
    }

    fn write(&mut self, pcm: &[u8], timeout: Duration) -> Result<usize> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| anyhow!("write before configure"))?;
        if !active.queue.wait_room(timeout) {
            return Ok(0);
        }
        pcm_to_f32(pcm, active.bits, &mut self.samples)?;
        active.flushed = false;
        match active.resampler.as_mut() {
            Some(rs) => {
                self.resampled.clear();
                rs.process(&self.samples, &mut self.resampled)?;
                active.queue.push(&self.resampled);
            }
            None => active.queue.push(&self.samples),
        }
        Ok(pcm.len())
    }

    fn drain(&mut self, timeout: Duration) -> Result<bool> {
        let Some(active) = self.active.as_mut() else {
            return Ok(true);
        };
        if !active.flushed {
            if let Some(rs) = active.resampler.as_mut() {
                self.resampled.clear();
                rs.flush(&mut self.resampled)?;
                active.queue.push(&self.resampled);
            }
            active.flushed = true;
        }
        Ok(active.queue.wait_empty(timeout))
    }

    fn bind_pause(&mut self, paused: Arc<AtomicBool>) {
        self.paused = Some(paused);
    }

    fn bind_abort(&mut self, abort: Arc<AtomicBool>, slice: Duration) {
        self.watch = AbortWatch {
            flag: Some(abort),
            slice,
        };
    }
}

/// Little-endian PCM (unsigned 8-bit, signed 16/24/32-bit) to `f32`.
fn pcm_to_f32(pcm: &[u8], bits: u16, out: &mut Vec<f32>) -> Result<()> {
    out.clear();
    match bits {
        8 => out.extend(pcm.iter().map(|b| (*b as f32 - 128.0) / 128.0)),
        16 => out.extend(
            pcm.chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32_768.0),
        ),
        24 => out.extend(pcm.chunks_exact(3).map(|c| {
            let v = i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8;
            v as f32 / 8_388_608.0
        })),
        32 => out.extend(
            pcm.chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32 / 2_147_483_648.0),
        ),
        other => return Err(anyhow!("unsupported pcm width: {other} bits")),
    }
    Ok(())
}
