//! `player`: stream audio from http(s), files or playlists to a cpal output.
//!
//! Notifications are printed to stderr as JSON lines; the shell reads
//! commands from stdin.

mod cli;
mod shell;

use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use stream_player::output::cpal_out::device;
use stream_player::{AudioBoard, CpalConfig, Player, PlayerConfig, TerminationMode};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,stream_player=info,player=info")
        }))
        .init();

    if args.list_devices {
        for name in device::list_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    let board = AudioBoard::init_once(|| {
        AudioBoard::cpal(
            CpalConfig {
                device: args.device.clone(),
                buffer_seconds: args.buffer_seconds,
                refill_max_frames: args.refill_max_frames,
                chunk_frames: args.chunk_frames,
            },
            args.volume,
        )
    });
    let mut config = PlayerConfig {
        initial_volume: args.volume,
        ..PlayerConfig::default()
    };
    config.reader.loop_playlist = args.loop_playlist;
    let player = Arc::new(Player::new(config, board).context("create player")?);

    let notifications = player.subscribe();
    thread::Builder::new()
        .name("notify-print".to_string())
        .spawn(move || {
            for state in notifications.iter() {
                eprintln!("{}", shell::json(&state));
            }
        })
        .context("spawn notification printer")?;

    let player_for_signal = player.clone();
    let _ = ctrlc::set_handler(move || {
        if let Err(e) = player_for_signal.stop(TerminationMode::Now) {
            tracing::warn!("stop on interrupt failed: {e}");
        }
        std::process::exit(130);
    });

    match args.cmd.unwrap_or(cli::Command::Shell) {
        cli::Command::Play { uri, pos } => {
            player
                .play(&uri, pos, true)
                .with_context(|| format!("play {uri}"))?;
            tracing::info!(state = ?player.get_state(), "playback ended");
        }
        cli::Command::Shell => shell::run(&player)?,
    }

    player.stop(TerminationMode::Now)?;
    Ok(())
}
