//! Reader stage: pulls bytes from the source into the stream ring.
//!
//! Resolves playlists up front, then streams track after track. Every
//! track is preceded by a `TrackStart` marker so the decoder can re-probe.
//! Transfers run on fetch threads; this worker only moves their chunks.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::config::ReaderConfig;
use crate::error::StageError;
use crate::event::EventKind;
use crate::playlist::{self, playlist_kind};
use crate::reconnect::{Decision, ReconnectPolicy, ResourceEvent};
use crate::ring_buffer::Marker;
use crate::source::fetch::{Fetch, FetchMsg, fetch_text};
use crate::source::{SourceError, SourceOpener};
use crate::stage::{Element, Flow, Recv, StageContext, StageRole};
use crate::status::SessionCounters;

pub struct ReaderElement {
    opener: Arc<dyn SourceOpener>,
    uri: String,
    start_offset: u64,
    config: ReaderConfig,
    counters: Arc<SessionCounters>,
    halt: Arc<AtomicBool>,
    policy: Option<ReconnectPolicy>,
    fetch: Option<Fetch>,
    /// Bytes of the current track delivered downstream, including the start offset.
    offset: u64,
}

impl ReaderElement {
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        uri: impl Into<String>,
        start_offset: u64,
        config: ReaderConfig,
        counters: Arc<SessionCounters>,
    ) -> Self {
        Self {
            opener,
            uri: uri.into(),
            start_offset,
            config,
            counters,
            halt: Arc::new(AtomicBool::new(false)),
            policy: None,
            fetch: None,
            offset: 0,
        }
    }

    /// Set to keep the reader from advancing past the current track.
    pub fn halt_handle(&self) -> Arc<AtomicBool> {
        self.halt.clone()
    }

    fn resolve(&self, ctx: &StageContext) -> Result<ReconnectPolicy, StageError> {
        let Some(kind) = playlist_kind(&self.uri) else {
            return Ok(ReconnectPolicy::single(self.uri.clone(), &self.config));
        };
        let rx = fetch_text(
            self.opener.clone(),
            self.uri.clone(),
            self.config.max_playlist_bytes,
        )
        .map_err(resource)?;
        let body = loop {
            match ctx.recv(&rx)? {
                Recv::Msg(body) => break body.map_err(resource)?,
                Recv::Idle => {}
                Recv::Disconnected => {
                    return Err(StageError::Resource(format!(
                        "playlist transfer ended without a body: {}",
                        self.uri
                    )));
                }
            }
        };
        let tracks = playlist::parse(kind, &body, &self.uri).map_err(resource)?;
        tracing::info!(uri = %self.uri, tracks = tracks.len(), "playlist resolved");
        Ok(ReconnectPolicy::playlist(tracks, &self.config))
    }

    fn begin_track(
        &mut self,
        ctx: &StageContext,
        index: usize,
        uri: String,
        offset: u64,
    ) -> Result<(), StageError> {
        tracing::info!(tag = %ctx.tag(), index, uri = %uri, offset, "track start");
        ctx.write_marker(Marker::TrackStart { uri: uri.clone() })?;
        ctx.post(EventKind::TrackChanged {
            index,
            uri: uri.clone(),
        });
        self.open_at(uri, offset)
    }

    fn open_at(&mut self, uri: String, offset: u64) -> Result<(), StageError> {
        self.fetch = None;
        self.offset = offset;
        let fetch = Fetch::start(self.opener.clone(), uri, offset, self.config.chunk_bytes)
            .map_err(resource)?;
        self.fetch = Some(fetch);
        Ok(())
    }

    fn apply(&mut self, ctx: &StageContext, decision: Decision) -> Result<Flow, StageError> {
        match decision {
            Decision::Advance { index, uri } => {
                self.begin_track(ctx, index, uri, 0)?;
                Ok(Flow::Continue)
            }
            Decision::Restart { uri } => {
                tracing::info!(tag = %ctx.tag(), "playlist restart");
                self.begin_track(ctx, 0, uri, 0)?;
                Ok(Flow::Continue)
            }
            Decision::Resume {
                uri,
                offset,
                delay,
                attempt,
            } => {
                tracing::warn!(
                    tag = %ctx.tag(),
                    uri = %uri,
                    offset,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting"
                );
                self.fetch = None;
                ctx.sleep(delay)?;
                if ctx.stop_requested() {
                    return Ok(Flow::Finished);
                }
                self.open_at(uri, offset)?;
                Ok(Flow::Continue)
            }
            Decision::Finish => {
                self.fetch = None;
                Ok(Flow::Finished)
            }
            Decision::Fail(reason) => Err(StageError::Resource(reason)),
        }
    }
}

impl Element for ReaderElement {
    fn role(&self) -> StageRole {
        StageRole::Reader
    }

    fn open(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        let policy = self.resolve(ctx)?.halted_by(self.halt.clone());
        let (index, uri) = policy.current();
        let uri = uri.to_string();
        self.policy = Some(policy);
        self.begin_track(ctx, index, uri, self.start_offset)
    }

    fn process(&mut self, ctx: &StageContext) -> Result<Flow, StageError> {
        let msg = {
            let Some(fetch) = self.fetch.as_ref() else {
                return Ok(Flow::Finished);
            };
            match ctx.recv(fetch.receiver())? {
                Recv::Msg(msg) => msg,
                Recv::Idle => return Ok(Flow::Continue),
                Recv::Disconnected => {
                    FetchMsg::Failed(SourceError::Transport("transfer thread exited".to_string()))
                }
            }
        };
        let Some(policy) = self.policy.as_mut() else {
            return Ok(Flow::Finished);
        };

        let decision = match msg {
            FetchMsg::Opened { content_length } => {
                tracing::debug!(tag = %ctx.tag(), offset = self.offset, content_length, "resource opened");
                self.counters.start_resource(self.offset);
                return Ok(Flow::Continue);
            }
            FetchMsg::Data(bytes) => {
                ctx.write_all(&bytes)?;
                self.offset += bytes.len() as u64;
                self.counters.add_bytes(bytes.len() as u64);
                policy.on_progress();
                return Ok(Flow::Continue);
            }
            FetchMsg::Eof => policy.on_event(ResourceEvent::TrackFinished),
            FetchMsg::Failed(e) => {
                tracing::warn!(tag = %ctx.tag(), offset = self.offset, error = %e, "transfer failed");
                policy.on_event(ResourceEvent::ReadFailed {
                    offset: self.offset,
                    transient: e.is_transient(),
                    reason: e.to_string(),
                })
            }
        };
        self.apply(ctx, decision)
    }

    fn close(&mut self) {
        self.fetch = None;
    }
}

fn resource(e: SourceError) -> StageError {
    StageError::Resource(e.to_string())
}
