use serde::{Deserialize, Serialize};

/// Player-level playback status reported to callers.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    /// No `play()` has been issued yet.
    #[default]
    Unknown,
    /// A session is producing audio.
    Running,
    /// The active session is paused.
    Paused,
    /// Playback was stopped by a command.
    Stopped,
    /// Natural end of stream.
    Finished,
    /// The session failed; see [`PlayerState::error_code`].
    Error,
}

impl PlaybackStatus {
    /// `true` for statuses that end a session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Finished | Self::Error)
    }

    /// `true` while a session owns the pipeline and may still produce audio.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// Result/error codes surfaced by commands and notifications.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    NoError,
    /// Bad volume, empty URI or malformed command arguments.
    InvalidParameter,
    /// Unreachable URI or I/O failure mid-stream.
    ResourceError,
    /// Malformed bitstream.
    DecodeError,
    /// A stop or wait-for-stop exceeded its bound.
    Timeout,
    /// A command raced an in-progress teardown or hardware lease.
    ConcurrencyMisuse,
    /// The command does not apply to the current status.
    InvalidState,
}

/// How a stop request treats buffered data.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TerminationMode {
    /// Abort immediately and discard buffered data.
    #[default]
    Now,
    /// Stop taking new input and drain what is buffered.
    Graceful,
}

/// Snapshot delivered by `get_state()` and by every notification.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerState {
    pub status: PlaybackStatus,
    pub error_code: ErrorCode,
    /// URI of the track currently fed to the pipeline.
    pub media_source: Option<String>,
}

/// Static description of what the player can read and decode.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerInfo {
    pub input: String,
    pub codec: String,
}
