//! Decoder stage: compressed bytes in, PCM out.
//!
//! A codec is opened lazily when bytes follow a track marker and dropped at
//! the end of its track. Whenever the PCM layout (or the track) changes, the
//! new [`StreamInfo`](crate::info::StreamInfo) is announced ahead of the first
//! PCM bytes decoded under it.

use std::sync::Arc;

use crate::codec::{Codec, CodecFactory, StageInput};
use crate::error::StageError;
use crate::info::StreamInfo;
use crate::ring_buffer::Marker;
use crate::stage::{Element, Flow, Input, Pending, StageContext, StageRole};

pub struct DecoderElement {
    factory: Arc<dyn CodecFactory>,
    codec: Option<Box<dyn Codec>>,
    track_uri: String,
    announced: Option<StreamInfo>,
}

impl DecoderElement {
    pub fn new(factory: Arc<dyn CodecFactory>) -> Self {
        Self {
            factory,
            codec: None,
            track_uri: String::new(),
            announced: None,
        }
    }

    /// No codec yet: consume markers until the next track's bytes show up.
    fn next_track(&mut self, ctx: &StageContext) -> Result<Flow, StageError> {
        match ctx.wait_input()? {
            Pending::End => Ok(Flow::Finished),
            Pending::Marker => {
                if let Input::Marker(marker) = ctx.read(&mut [])? {
                    match marker {
                        Marker::TrackStart { uri } => self.track_uri = uri,
                        Marker::Format(info) => {
                            tracing::debug!(tag = %ctx.tag(), ?info, "ignoring format marker on compressed input");
                        }
                    }
                }
                Ok(Flow::Continue)
            }
            Pending::Bytes => {
                let input = StageInput::new(ctx.input_port()?);
                let codec = self.factory.open(input, &self.track_uri)?;
                tracing::debug!(tag = %ctx.tag(), uri = %self.track_uri, "codec opened");
                self.codec = Some(codec);
                Ok(Flow::Continue)
            }
        }
    }
}

impl Element for DecoderElement {
    fn role(&self) -> StageRole {
        StageRole::Decoder
    }

    fn process(&mut self, ctx: &StageContext) -> Result<Flow, StageError> {
        let Some(codec) = self.codec.as_mut() else {
            return self.next_track(ctx);
        };
        match codec.next_frame()? {
            Some(frame) => {
                if self.announced.as_ref() != Some(&frame.info) {
                    if !frame.info.is_playable() {
                        return Err(StageError::Decode(format!(
                            "unplayable stream format {:?}",
                            frame.info
                        )));
                    }
                    tracing::debug!(
                        tag = %ctx.tag(),
                        sample_rate = frame.info.sample_rate,
                        bits = frame.info.bits,
                        channels = frame.info.channels,
                        "music info"
                    );
                    ctx.announce(frame.info.clone())?;
                    self.announced = Some(frame.info);
                }
                ctx.write_all(&frame.pcm)?;
                Ok(Flow::Continue)
            }
            None => {
                self.codec = None;
                let skipped = ctx.input_port()?.skip_to_marker()?;
                if skipped > 0 {
                    tracing::debug!(tag = %ctx.tag(), skipped, "discarded trailing track bytes");
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn close(&mut self) {
        self.codec = None;
    }
}
