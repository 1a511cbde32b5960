//! cpal output stream and its real-time callback.
//!
//! The callback:
//! - outputs silence without draining the queue while paused
//! - refills a small local buffer from the [`FrameQueue`] without blocking
//! - maps source channels onto the device layout
//! - applies the software volume gain

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use super::frame_queue::FrameQueue;
use crate::output::SoftwareVolume;

#[derive(Clone)]
pub struct PlaybackConfig {
    /// Frames pulled from the queue per refill.
    pub refill_max_frames: usize,
    pub paused: Option<Arc<AtomicBool>>,
    pub volume: Arc<SoftwareVolume>,
}

pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<FrameQueue>,
    cfg: PlaybackConfig,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, cfg),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, cfg),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, cfg),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, cfg),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<FrameQueue>,
    cfg: PlaybackConfig,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let state = Mutex::new(PlaybackState {
        pos: 0,
        src_channels: queue.channels(),
        src: Vec::new(),
    });
    let refill_max_frames = cfg.refill_max_frames.max(1);
    let queue_cb = queue.clone();
    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
            if cfg.paused.as_ref().is_some_and(|p| p.load(Ordering::Relaxed)) {
                data.fill(silence);
                return;
            }

            let gain = cfg.volume.gain();
            let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
            let frames = data.len() / channels_out;
            for frame in 0..frames {
                if st.pos >= st.src.len() {
                    st.pos = 0;
                    let PlaybackState { src, .. } = &mut *st;
                    if !queue_cb.pop_nonblocking(refill_max_frames, src) {
                        src.clear();
                        data[frame * channels_out..].fill(silence);
                        break;
                    }
                }
                for ch in 0..channels_out {
                    let sample = next_sample_mapped(&mut st, channels_out, ch) * gain;
                    data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

struct PlaybackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// One output sample for `dst_ch`; `st.pos` advances after the last channel.
///
/// mono → stereo duplicates, stereo → mono averages, other layouts clamp to
/// the available channels.
fn next_sample_mapped(st: &mut PlaybackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &PlaybackState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, _) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}
