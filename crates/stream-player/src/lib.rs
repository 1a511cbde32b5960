//! Streaming audio player: reader → decoder → writer stages joined by ring
//! buffers, driven by a [`Player`] controller.

pub mod board;
pub mod codec;
pub mod config;
pub mod controller;
pub mod elements;
pub mod error;
pub mod event;
pub mod info;
pub mod notify;
pub mod output;
pub mod pipeline;
pub mod playlist;
pub mod reconnect;
pub mod ring_buffer;
pub mod source;
pub mod stage;
pub mod status;

#[cfg(test)]
mod testing;

pub use board::AudioBoard;
pub use config::{PipelineConfig, PlayerConfig, ReaderConfig};
pub use controller::Player;
pub use error::PlayerError;
pub use notify::Callback;
pub use output::cpal_out::CpalConfig;
pub use stream_player_types::{ErrorCode, PlaybackStatus, PlayerInfo, PlayerState, TerminationMode};
