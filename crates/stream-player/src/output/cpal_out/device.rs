//! Output device discovery and selection.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick the first output device whose name contains `needle`
/// (case-insensitive), or the host default.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let found = host
            .output_devices()
            .context("No output devices")?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            });
        return found.ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the output config closest to the stream's rate.
///
/// Prefers the highest supported rate at or below `target_rate`, then the
/// lowest one above it; ties go to the better sample format.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;

    for range in device.supported_output_configs()? {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let below = rate <= target_rate;
        let format_rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, format_rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, format_rank, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, _, _, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Fixed buffer size when the device advertises a range, capped so latency
/// stays bounded. `None` leaves the device default.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 4_096;
            let chosen = if *max > MAX_FRAMES {
                (*min).max(MAX_FRAMES)
            } else {
                *max
            };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Names of the host's output devices.
pub fn list_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.output_devices().context("No output devices")?;
    let mut out = Vec::new();
    for d in devices {
        out.push(d.description()?.to_string());
    }
    Ok(out)
}

fn pick_rate_for_range(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below
    } else if rate != best_rate {
        // Below the target the higher rate is closer; above it, the lower one.
        if below { rate > best_rate } else { rate < best_rate }
    } else {
        format_rank < best_rank
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", "  "));
    }

    #[test]
    fn pick_rate_for_range_clamps_to_range() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, 48_000), 48_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, 22_050), 44_100);
        assert_eq!(pick_rate_for_range(44_100, 96_000, 192_000), 96_000);
    }

    #[test]
    fn is_better_candidate_prefers_below_target() {
        assert!(is_better_candidate(true, 48_000, 1, false, 48_000, 1));
        assert!(!is_better_candidate(false, 48_000, 1, true, 44_100, 1));
    }

    #[test]
    fn is_better_candidate_prefers_closest_rate() {
        assert!(is_better_candidate(true, 96_000, 2, true, 48_000, 2));
        assert!(is_better_candidate(false, 48_000, 2, false, 96_000, 2));
    }

    #[test]
    fn is_better_candidate_prefers_lower_rank() {
        assert!(is_better_candidate(true, 48_000, 0, true, 48_000, 2));
    }
}
