use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "player", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Audio buffered ahead of the output callback, in seconds
    #[arg(long, default_value_t = 0.5)]
    pub buffer_seconds: f32,

    /// Resampler input chunk size in frames
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Playback callback refill cap (frames)
    #[arg(long, default_value_t = 4096)]
    pub refill_max_frames: usize,

    /// Initial master volume (0-100)
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub volume: u8,

    /// Restart a playlist from its first entry when it runs out
    #[arg(long)]
    pub loop_playlist: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play one URI (http(s), file or playlist) until it ends
    Play {
        uri: String,

        /// Start at this byte offset
        #[arg(long, default_value_t = 0)]
        pos: u64,
    },

    /// Read commands from stdin (the default)
    Shell,
}
