//! Byte sources feeding the reader stage.
//!
//! A [`SourceOpener`] turns a URI (plus a resume offset) into a blocking
//! reader. The reader stage never calls it on its own worker; see [`fetch`].

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::time::Duration;

use thiserror::Error;

pub mod fetch;
pub mod http;

pub use http::HttpOpener;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("unsupported uri scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("http status {status} for {uri}")]
    Http { status: u16, uri: String },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Connection-level failure (timeouts, refused connections).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("playlist larger than {0} bytes")]
    PlaylistTooLarge(usize),

    #[error("playlist has no entries: {0}")]
    EmptyPlaylist(String),

    #[error("playlist is not valid text: {0}")]
    PlaylistEncoding(String),
}

impl SourceError {
    /// Worth reconnecting for.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// An open resource positioned at the requested offset.
pub struct OpenedSource {
    pub reader: Box<dyn Read + Send>,
    /// Total resource length when the transport reports it.
    pub content_length: Option<u64>,
}

pub trait SourceOpener: Send + Sync {
    fn open(&self, uri: &str, offset: u64) -> Result<OpenedSource, SourceError>;
}

/// `http(s)://` through ureq, `file://` and bare paths through the filesystem.
pub struct DefaultOpener {
    http: HttpOpener,
}

impl DefaultOpener {
    pub fn new(connect_timeout: Duration, response_timeout: Duration) -> Self {
        Self {
            http: HttpOpener::new(connect_timeout, response_timeout),
        }
    }
}

impl SourceOpener for DefaultOpener {
    fn open(&self, uri: &str, offset: u64) -> Result<OpenedSource, SourceError> {
        match uri.split_once("://") {
            Some(("http" | "https", _)) => self.http.open(uri, offset),
            Some(("file", path)) => open_file(path, offset),
            Some((scheme, _)) => Err(SourceError::UnsupportedScheme(scheme.to_string())),
            None => open_file(uri, offset),
        }
    }
}

fn open_file(path: &str, offset: u64) -> Result<OpenedSource, SourceError> {
    let mut file = File::open(path)?;
    let len = file.metadata().ok().map(|m| m.len());
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))?;
    }
    Ok(OpenedSource {
        reader: Box::new(file),
        content_length: len,
    })
}

/// Read a whole (small) resource, e.g. a playlist body.
pub fn read_capped(opener: &dyn SourceOpener, uri: &str, cap: usize) -> Result<String, SourceError> {
    let opened = opener.open(uri, 0)?;
    let mut body = Vec::new();
    opened
        .reader
        .take(cap as u64 + 1)
        .read_to_end(&mut body)?;
    if body.len() > cap {
        return Err(SourceError::PlaylistTooLarge(cap));
    }
    String::from_utf8(body).map_err(|e| SourceError::PlaylistEncoding(e.to_string()))
}
