//! Rate conversion from the stream rate to the device rate.
//!
//! Runs inline on the writer stage: PCM is accumulated into fixed input
//! chunks for rubato's sinc resampler, and the remainder is flushed with a
//! partial chunk once the stream ends.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

pub struct StreamResampler {
    resampler: Async<f32>,
    channels: usize,
    chunk_frames: usize,
    pending: Vec<f32>,
    out: Vec<f32>,
    indexing: Indexing,
}

impl StreamResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        if src_rate == 0 || dst_rate == 0 || channels == 0 {
            return Err(anyhow!(
                "cannot resample {src_rate} Hz -> {dst_rate} Hz with {channels} channel(s)"
            ));
        }
        let f_ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let chunk_frames = chunk_frames.max(1);
        let resampler = Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| anyhow!("resampler init error: {e}"))?;

        let out_frames = (chunk_frames as f64 * f_ratio * 1.1).ceil() as usize + 64;
        Ok(Self {
            resampler,
            channels,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * channels),
            out: vec![0.0; out_frames * channels],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Feed interleaved samples, appending whatever full chunks produce to `dst`.
    pub fn process(&mut self, input: &[f32], dst: &mut Vec<f32>) -> Result<()> {
        self.pending.extend_from_slice(input);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_samples {
            let chunk = self.pending[consumed..consumed + chunk_samples].to_vec();
            self.run(&chunk, None, dst)?;
            consumed += chunk_samples;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    /// Resample what is left as a partial chunk.
    pub fn flush(&mut self, dst: &mut Vec<f32>) -> Result<()> {
        let tail_frames = self.pending.len() / self.channels;
        if tail_frames == 0 {
            self.pending.clear();
            return Ok(());
        }
        let mut chunk = vec![0.0; self.chunk_frames * self.channels];
        let tail_samples = tail_frames * self.channels;
        chunk[..tail_samples].copy_from_slice(&self.pending[..tail_samples]);
        self.pending.clear();
        self.run(&chunk, Some(tail_frames), dst)
    }

    fn run(&mut self, chunk: &[f32], partial_len: Option<usize>, dst: &mut Vec<f32>) -> Result<()> {
        let input = InterleavedSlice::new(chunk, self.channels, self.chunk_frames)
            .map_err(|e| anyhow!("interleaved slice (input) error: {e}"))?;
        let out_capacity_frames = self.out.len() / self.channels;
        let mut output = InterleavedSlice::new_mut(&mut self.out, self.channels, out_capacity_frames)
            .map_err(|e| anyhow!("interleaved slice (output) error: {e}"))?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = partial_len;

        let (_nbr_in, nbr_out) = self
            .resampler
            .process_into_buffer(&input, &mut output, Some(&self.indexing))
            .map_err(|e| anyhow!("resampler process error: {e}"))?;
        dst.extend_from_slice(&self.out[..nbr_out * self.channels]);
        Ok(())
    }
}
