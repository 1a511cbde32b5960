//! Error types for the pipeline and the player controller.

use stream_player_types::{ErrorCode, PlaybackStatus};
use thiserror::Error;

/// Terminal failure of a single stage worker.
#[derive(Error, Debug)]
pub enum StageError {
    /// The stage was told to stop now, or a neighbouring buffer was aborted.
    #[error("stage aborted")]
    Aborted,

    /// Unreachable resource or transport failure.
    #[error("resource error: {0}")]
    Resource(String),

    /// Malformed or unsupported bitstream.
    #[error("decode error: {0}")]
    Decode(String),

    /// Hardware output failure.
    #[error("output error: {0}")]
    Output(String),
}

impl StageError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Aborted => ErrorCode::NoError,
            Self::Resource(_) | Self::Output(_) => ErrorCode::ResourceError,
            Self::Decode(_) => ErrorCode::DecodeError,
        }
    }
}

/// Misuse of the pipeline graph or of its lifecycle ordering.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("tag already registered: {0}")]
    DuplicateTag(String),

    #[error("tag not registered: {0}")]
    UnknownTag(String),

    #[error("tag linked more than once: {0}")]
    LinkedTwice(String),

    #[error("registered stage left out of the link order: {0}")]
    Unlinked(String),

    #[error("invalid chain: {0}")]
    InvalidChain(String),

    /// A lifecycle step was called out of order.
    #[error("cannot {op} while pipeline is {phase}")]
    Lifecycle { op: &'static str, phase: &'static str },

    #[error("no event listener set")]
    NoListener,

    #[error("event bus still has {0} attached pipeline(s)")]
    ListenerAttached(usize),

    #[error("failed to spawn stage worker {tag}: {source}")]
    Spawn {
        tag: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to lease the process-wide audio output.
#[derive(Error, Debug)]
pub enum BoardError {
    #[error("audio output already leased")]
    Busy,

    #[error("audio output unavailable: {0:#}")]
    Output(anyhow::Error),
}

/// Result of a player command.
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("timed out with {active} stage(s) still active")]
    Timeout { active: usize },

    #[error("concurrent misuse: {0}")]
    ConcurrencyMisuse(String),

    #[error("command not valid while {0:?}")]
    InvalidState(PlaybackStatus),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Board(#[from] BoardError),
}

impl PlayerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParameter(_) => ErrorCode::InvalidParameter,
            Self::Resource(_) => ErrorCode::ResourceError,
            Self::Decode(_) => ErrorCode::DecodeError,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ConcurrencyMisuse(_) | Self::Board(BoardError::Busy) => {
                ErrorCode::ConcurrencyMisuse
            }
            Self::Board(BoardError::Output(_)) => ErrorCode::ResourceError,
            Self::InvalidState(_) => ErrorCode::InvalidState,
            Self::Pipeline(PipelineError::Lifecycle { .. }) => ErrorCode::ConcurrencyMisuse,
            Self::Pipeline(PipelineError::Spawn { .. }) => ErrorCode::ResourceError,
            Self::Pipeline(_) => ErrorCode::InvalidParameter,
        }
    }

    /// Build the error reported for a session that ended with `code`.
    pub(crate) fn from_session(code: ErrorCode, detail: String) -> Self {
        match code {
            ErrorCode::DecodeError => Self::Decode(detail),
            ErrorCode::Timeout => Self::Timeout { active: 0 },
            _ => Self::Resource(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_map_to_codes() {
        assert_eq!(StageError::Resource("x".into()).code(), ErrorCode::ResourceError);
        assert_eq!(StageError::Output("x".into()).code(), ErrorCode::ResourceError);
        assert_eq!(StageError::Decode("x".into()).code(), ErrorCode::DecodeError);
    }

    #[test]
    fn player_errors_map_to_codes() {
        assert_eq!(
            PlayerError::InvalidParameter("vol".into()).code(),
            ErrorCode::InvalidParameter
        );
        assert_eq!(PlayerError::Timeout { active: 2 }.code(), ErrorCode::Timeout);
        assert_eq!(
            PlayerError::Board(BoardError::Busy).code(),
            ErrorCode::ConcurrencyMisuse
        );
        assert_eq!(
            PlayerError::Pipeline(PipelineError::Lifecycle {
                op: "run",
                phase: "destroyed"
            })
            .code(),
            ErrorCode::ConcurrencyMisuse
        );
    }

    #[test]
    fn lifecycle_error_message_names_step() {
        let err = PipelineError::Lifecycle {
            op: "remove listener",
            phase: "running",
        };
        assert_eq!(err.to_string(), "cannot remove listener while pipeline is running");
    }
}
