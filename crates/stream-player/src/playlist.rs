//! M3U / PLS playlist resolution.

use std::path::Path;

use crate::source::SourceError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaylistKind {
    M3u,
    Pls,
}

/// Detect a playlist from the URI extension (query string ignored).
pub fn playlist_kind(uri: &str) -> Option<PlaylistKind> {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let file = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = file.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "m3u" | "m3u8" => Some(PlaylistKind::M3u),
        "pls" => Some(PlaylistKind::Pls),
        _ => None,
    }
}

/// Parse a playlist body into absolute track URIs, in play order.
pub fn parse(kind: PlaylistKind, body: &str, base: &str) -> Result<Vec<String>, SourceError> {
    let entries = match kind {
        PlaylistKind::M3u => parse_m3u(body),
        PlaylistKind::Pls => parse_pls(body),
    };
    let tracks: Vec<String> = entries.iter().map(|e| resolve(base, e)).collect();
    if tracks.is_empty() {
        return Err(SourceError::EmptyPlaylist(base.to_string()));
    }
    Ok(tracks)
}

fn parse_m3u(body: &str) -> Vec<String> {
    body.lines()
        .map(|l| l.trim_start_matches('\u{feff}').trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn parse_pls(body: &str) -> Vec<String> {
    let mut numbered: Vec<(u32, String)> = body
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            let idx = key.trim().to_ascii_lowercase().strip_prefix("file")?.parse().ok()?;
            let value = value.trim();
            (!value.is_empty()).then(|| (idx, value.to_string()))
        })
        .collect();
    numbered.sort_by_key(|(idx, _)| *idx);
    numbered.into_iter().map(|(_, uri)| uri).collect()
}

/// Resolve a playlist entry against the playlist's own URI.
fn resolve(base: &str, entry: &str) -> String {
    if entry.contains("://") {
        return entry.to_string();
    }
    if let Some((scheme, rest)) = base.split_once("://") {
        if scheme != "file" {
            let authority_end = rest.find('/').unwrap_or(rest.len());
            let origin = &base[..scheme.len() + 3 + authority_end];
            if entry.starts_with('/') {
                return format!("{origin}{entry}");
            }
            let path = rest[authority_end..].split(['?', '#']).next().unwrap_or("");
            let dir = match path.rfind('/') {
                Some(i) => &path[..=i],
                None => "/",
            };
            return format!("{origin}{dir}{entry}");
        }
    }
    let base_path = base.strip_prefix("file://").unwrap_or(base);
    if Path::new(entry).is_absolute() {
        return entry.to_string();
    }
    match Path::new(base_path).parent() {
        Some(dir) => dir.join(entry).to_string_lossy().into_owned(),
        None => entry.to_string(),
    }
}
