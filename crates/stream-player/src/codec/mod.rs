//! Compressed → PCM decoding seam used by the decoder stage.

use std::io;

use thiserror::Error;

use crate::error::StageError;
use crate::info::StreamInfo;

pub mod bitstream;
pub mod input;

pub use bitstream::SymphoniaFactory;
pub use input::StageInput;

/// PCM decoded from one packet, in the layout described by `info`.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub info: StreamInfo,
    /// Interleaved little-endian samples.
    pub pcm: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unsupported stream: {0}")]
    Unsupported(String),

    #[error("malformed stream: {0}")]
    Malformed(String),

    /// The input was aborted underneath the codec.
    #[error("input aborted")]
    Aborted,

    #[error("i/o error: {0}")]
    Io(io::Error),
}

impl From<CodecError> for StageError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Aborted => StageError::Aborted,
            CodecError::Io(io) => StageError::Resource(io.to_string()),
            CodecError::Unsupported(_) | CodecError::Malformed(_) => {
                StageError::Decode(e.to_string())
            }
        }
    }
}

/// A decoder bound to one track.
pub trait Codec: Send {
    /// Next decoded packet, or `None` at the end of the track.
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, CodecError>;
}

/// Creates a codec for each track the decoder stage sees.
pub trait CodecFactory: Send + Sync {
    /// Short label of the supported formats, e.g. for `Player::info()`.
    fn formats(&self) -> &'static str;

    /// Probe `input` (positioned at the start of the track fetched from `uri`).
    fn open(&self, input: StageInput, uri: &str) -> Result<Box<dyn Codec>, CodecError>;
}
