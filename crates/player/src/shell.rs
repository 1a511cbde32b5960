//! Line-oriented control: one command per stdin line.

use std::io::{self, BufRead, Write};

use anyhow::Result;
use stream_player::{Player, PlayerError, TerminationMode};

#[derive(Debug, PartialEq, Eq)]
pub enum ShellCommand {
    Play { uri: String, pos: u64, sync: bool },
    Stop(TerminationMode),
    Pause,
    Resume,
    GetVolume,
    SetVolume(i32),
    State,
    Position,
    Time,
    Info,
    Help,
    Quit,
}

const HELP: &str = "\
play <uri> [pos] [sync]   start playback (pre-empts the current stream)
stop [now|graceful]       stop playback (default: now)
pause | resume
vol [0-100]               show or set the volume
state | pos | time | info
quit";

pub fn parse(line: &str) -> Result<ShellCommand, String> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Err("empty command".to_string());
    };
    let rest: Vec<&str> = words.collect();
    let parsed = match (cmd, rest.as_slice()) {
        ("play", [uri, opts @ ..]) => {
            let mut pos = 0;
            let mut sync = false;
            for opt in opts {
                match *opt {
                    "sync" => sync = true,
                    n => pos = n.parse().map_err(|_| format!("bad position: {n}"))?,
                }
            }
            ShellCommand::Play {
                uri: uri.to_string(),
                pos,
                sync,
            }
        }
        ("play", []) => return Err("play needs a uri".to_string()),
        ("stop", []) | ("stop", ["now"]) => ShellCommand::Stop(TerminationMode::Now),
        ("stop", ["graceful"]) => ShellCommand::Stop(TerminationMode::Graceful),
        ("pause", []) => ShellCommand::Pause,
        ("resume", []) => ShellCommand::Resume,
        ("vol", []) => ShellCommand::GetVolume,
        ("vol", [v]) => ShellCommand::SetVolume(v.parse().map_err(|_| format!("bad volume: {v}"))?),
        ("state", []) => ShellCommand::State,
        ("pos", []) => ShellCommand::Position,
        ("time", []) => ShellCommand::Time,
        ("info", []) => ShellCommand::Info,
        ("help", []) => ShellCommand::Help,
        ("quit" | "exit", []) => ShellCommand::Quit,
        _ => return Err(format!("unknown command: {}", line.trim())),
    };
    Ok(parsed)
}

/// Run commands until `quit` or end of input.
pub fn run(player: &Player) -> Result<()> {
    let stdin = io::stdin();
    let mut out = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let cmd = match parse(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                writeln!(out, "error: {e}")?;
                continue;
            }
        };
        if cmd == ShellCommand::Quit {
            break;
        }
        match execute(player, cmd) {
            Ok(Some(reply)) => writeln!(out, "{reply}")?,
            Ok(None) => writeln!(out, "ok")?,
            Err(e) => writeln!(out, "error ({:?}): {e}", e.code())?,
        }
        out.flush()?;
    }
    Ok(())
}

fn execute(player: &Player, cmd: ShellCommand) -> Result<Option<String>, PlayerError> {
    let reply = match cmd {
        ShellCommand::Play { uri, pos, sync } => {
            player.play(&uri, pos, sync)?;
            None
        }
        ShellCommand::Stop(mode) => {
            player.stop(mode)?;
            None
        }
        ShellCommand::Pause => {
            player.pause()?;
            None
        }
        ShellCommand::Resume => {
            player.resume()?;
            None
        }
        ShellCommand::GetVolume => Some(player.get_volume().to_string()),
        ShellCommand::SetVolume(v) => {
            player.set_volume(v)?;
            None
        }
        ShellCommand::State => Some(json(&player.get_state())),
        ShellCommand::Position => Some(or_unavailable(player.get_position(), "bytes")),
        ShellCommand::Time => Some(or_unavailable(player.get_elapsed_time(), "ms")),
        ShellCommand::Info => Some(json(&player.info())),
        ShellCommand::Help => Some(HELP.to_string()),
        ShellCommand::Quit => None,
    };
    Ok(reply)
}

fn or_unavailable(value: Option<u64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{v} {unit}"),
        None => "unavailable".to_string(),
    }
}

pub fn json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play_with_options() {
        assert_eq!(
            parse("play http://host/a.mp3 1024 sync"),
            Ok(ShellCommand::Play {
                uri: "http://host/a.mp3".to_string(),
                pos: 1024,
                sync: true
            })
        );
        assert_eq!(
            parse("play  file:///tmp/a.flac"),
            Ok(ShellCommand::Play {
                uri: "file:///tmp/a.flac".to_string(),
                pos: 0,
                sync: false
            })
        );
        assert!(parse("play").is_err());
        assert!(parse("play u x").is_err());
    }

    #[test]
    fn parses_stop_modes() {
        assert_eq!(parse("stop"), Ok(ShellCommand::Stop(TerminationMode::Now)));
        assert_eq!(
            parse("stop graceful"),
            Ok(ShellCommand::Stop(TerminationMode::Graceful))
        );
        assert!(parse("stop later").is_err());
    }

    #[test]
    fn volume_is_passed_through_unclamped() {
        assert_eq!(parse("vol"), Ok(ShellCommand::GetVolume));
        assert_eq!(parse("vol 150"), Ok(ShellCommand::SetVolume(150)));
        assert_eq!(parse("vol -3"), Ok(ShellCommand::SetVolume(-3)));
        assert!(parse("vol loud").is_err());
    }

    #[test]
    fn unknown_and_empty_lines_are_rejected() {
        assert!(parse("").is_err());
        assert!(parse("rewind").is_err());
        assert_eq!(parse("exit"), Ok(ShellCommand::Quit));
    }
}
