//! Symphonia-backed codecs (MP3, AAC, FLAC, Vorbis, WAV).
//!
//! Each track is probed from the decoder's input as it arrives. PCM is
//! emitted as interleaved little-endian `i16`, or `i32` for sources deeper
//! than 16 bits.

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::{Codec, CodecError, CodecFactory, DecodedFrame, StageInput};
use crate::info::StreamInfo;

/// Consecutive undecodable packets tolerated before the track is rejected.
const MAX_BAD_PACKETS: u32 = 16;

#[derive(Clone, Copy, Debug, Default)]
pub struct SymphoniaFactory;

impl CodecFactory for SymphoniaFactory {
    fn formats(&self) -> &'static str {
        "mp3|aac|flac|vorbis|wav"
    }

    fn open(&self, input: StageInput, uri: &str) -> Result<Box<dyn Codec>, CodecError> {
        let hint = hint_for(uri);
        let mss = MediaSourceStream::new(Box::new(input), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| match e {
                SymError::IoError(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                    CodecError::Malformed("stream ended before a decodable header".to_string())
                }
                other => map_symphonia_error(other),
            })?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| CodecError::Unsupported("no default track".to_string()))?;
        let params = track.codec_params.clone();
        let track_id = track.id;
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(map_symphonia_error)?;
        let wide = params.bits_per_sample.is_some_and(|b| b > 16);

        tracing::info!(
            uri = %uri,
            codec = symphonia::default::get_codecs()
                .get_codec(params.codec)
                .map_or("unknown", |d| d.short_name),
            sample_rate = params.sample_rate,
            duration_ms = track_duration_ms(&params),
            "bitstream probed"
        );

        Ok(Box::new(SymphoniaCodec {
            format,
            decoder,
            track_id,
            wide,
            source: uri.to_string(),
            bad_packets: 0,
        }))
    }
}

struct SymphoniaCodec {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    wide: bool,
    source: String,
    bad_packets: u32,
}

impl Codec for SymphoniaCodec {
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, CodecError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymError::ResetRequired) => return Ok(None),
                Err(e) => return Err(map_symphonia_error(e)),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymError::DecodeError(msg)) => {
                    self.bad_packets += 1;
                    tracing::debug!(uri = %self.source, reason = msg, "skipping bad packet");
                    if self.bad_packets > MAX_BAD_PACKETS {
                        return Err(CodecError::Malformed(msg.to_string()));
                    }
                    continue;
                }
                Err(e) => return Err(map_symphonia_error(e)),
            };
            self.bad_packets = 0;
            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let channels = spec.channels.count() as u16;
            let frames = decoded.frames() as u64;
            let (bits, pcm) = if self.wide {
                let mut buf = SampleBuffer::<i32>::new(frames, spec);
                buf.copy_interleaved_ref(decoded);
                (32, buf.samples().iter().flat_map(|s| s.to_le_bytes()).collect())
            } else {
                let mut buf = SampleBuffer::<i16>::new(frames, spec);
                buf.copy_interleaved_ref(decoded);
                (16, buf.samples().iter().flat_map(|s| s.to_le_bytes()).collect())
            };

            return Ok(Some(DecodedFrame {
                info: StreamInfo::new(spec.rate, bits, channels).with_source(&self.source),
                pcm,
            }));
        }
    }
}

fn map_symphonia_error(err: SymError) -> CodecError {
    match err {
        SymError::IoError(e) if e.kind() == std::io::ErrorKind::ConnectionAborted => {
            CodecError::Aborted
        }
        SymError::IoError(e) => CodecError::Io(e),
        SymError::Unsupported(what) => CodecError::Unsupported(what.to_string()),
        SymError::DecodeError(what) => CodecError::Malformed(what.to_string()),
        other => CodecError::Malformed(other.to_string()),
    }
}

/// Probe hint from the extension of the URI's last path segment.
fn hint_for(uri: &str) -> Hint {
    let mut hint = Hint::new();
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let segment = path.rsplit('/').next().unwrap_or(path);
    if let Some((stem, ext)) = segment.rsplit_once('.') {
        if !stem.is_empty() && !ext.is_empty() {
            hint.with_extension(&ext.to_ascii_lowercase());
        }
    }
    hint
}

fn track_duration_ms(params: &CodecParameters) -> Option<u64> {
    let time = params.time_base?.calc_time(params.n_frames?);
    Some(time.seconds.saturating_mul(1000) + (time.frac * 1000.0) as u64)
}
