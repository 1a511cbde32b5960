//! HTTP(S) sources over ureq, resumable through `Range` requests.

use std::io::{self, Read};
use std::time::Duration;

use super::{OpenedSource, SourceError};

pub struct HttpOpener {
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl HttpOpener {
    pub fn new(connect_timeout: Duration, response_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            response_timeout,
        }
    }

    /// Issue a GET, asking for `bytes=offset-` when resuming.
    pub fn open(&self, uri: &str, offset: u64) -> Result<OpenedSource, SourceError> {
        let started = std::time::Instant::now();
        let mut req = ureq::get(uri)
            .config()
            .timeout_connect(Some(self.connect_timeout))
            .timeout_recv_response(Some(self.response_timeout))
            .http_status_as_error(false)
            .build();
        if offset > 0 {
            let range = format!("bytes={offset}-");
            req = req.header("Range", &range);
        }
        let resp = req.call().map_err(|e| map_ureq_error(uri, e))?;

        let status = resp.status();
        if status.as_u16() >= 400 {
            return Err(SourceError::Http {
                status: status.as_u16(),
                uri: uri.to_string(),
            });
        }
        let content_range = resp
            .headers()
            .get("Content-Range")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_length = resp
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        tracing::debug!(
            uri = %uri,
            offset,
            status = status.as_u16(),
            took_ms = started.elapsed().as_millis() as u64,
            "http source opened"
        );

        let (_, body) = resp.into_parts();
        let mut reader = body.into_reader();
        let total = match status {
            ureq::http::StatusCode::PARTIAL_CONTENT => content_range
                .as_deref()
                .and_then(parse_content_range_total)
                .or(content_length.map(|len| len + offset)),
            _ => {
                if offset > 0 {
                    tracing::warn!(uri = %uri, offset, "server ignored range; skipping ahead");
                    io::copy(&mut (&mut reader).take(offset), &mut io::sink())?;
                }
                content_length
            }
        };

        Ok(OpenedSource {
            reader: Box::new(reader),
            content_length: total,
        })
    }
}

fn map_ureq_error(uri: &str, err: ureq::Error) -> SourceError {
    match err {
        ureq::Error::StatusCode(status) => SourceError::Http {
            status,
            uri: uri.to_string(),
        },
        ureq::Error::Io(e) => SourceError::Io(e),
        ureq::Error::HostNotFound => SourceError::HostNotFound(uri.to_string()),
        ureq::Error::BadUri(msg) => SourceError::InvalidUri(msg),
        other => SourceError::Transport(other.to_string()),
    }
}

/// Extract the total length from a Content-Range header.
fn parse_content_range_total(header: &str) -> Option<u64> {
    // Format: "bytes start-end/total"
    let (_, total) = header.split_once('/')?;
    total.parse::<u64>().ok()
}
