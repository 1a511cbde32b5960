//! Writer stage: PCM from the decoder into the audio sink.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::error::StageError;
use crate::info::StreamInfo;
use crate::output::AudioSink;
use crate::ring_buffer::Marker;
use crate::stage::{Element, Flow, Input, StageContext, StageRole};
use crate::status::SessionCounters;

const READ_CHUNK: usize = 4096;

pub struct WriterElement {
    sink: Box<dyn AudioSink>,
    counters: Arc<SessionCounters>,
    info: Option<StreamInfo>,
    buf: Vec<u8>,
    /// Bytes short of a whole frame, carried to the next read.
    pending: Vec<u8>,
}

impl WriterElement {
    pub fn new(sink: Box<dyn AudioSink>, counters: Arc<SessionCounters>) -> Self {
        Self {
            sink,
            counters,
            info: None,
            buf: vec![0u8; READ_CHUNK],
            pending: Vec::new(),
        }
    }

    fn apply_format(&mut self, ctx: &StageContext, info: StreamInfo) -> Result<(), StageError> {
        if !self.pending.is_empty() {
            tracing::warn!(tag = %ctx.tag(), bytes = self.pending.len(), "dropping partial frame");
            self.pending.clear();
        }
        let unchanged = self.info.as_ref().is_some_and(|cur| cur.same_format(&info));
        if !unchanged {
            if let Err(e) = self.sink.configure(&info) {
                if ctx.abort_flag().load(Ordering::Acquire) {
                    return Err(StageError::Aborted);
                }
                return Err(StageError::Output(format!("{e:#}")));
            }
            self.counters.set_format(info.sample_rate);
            tracing::info!(
                tag = %ctx.tag(),
                sample_rate = info.sample_rate,
                bits = info.bits,
                channels = info.channels,
                "output configured"
            );
        }
        self.info = Some(info);
        Ok(())
    }

    /// Hand every whole frame in `pending` to the sink.
    fn flush_frames(&mut self, ctx: &StageContext, frame_bytes: usize) -> Result<(), StageError> {
        let whole = self.pending.len() / frame_bytes * frame_bytes;
        let mut offset = 0;
        while offset < whole {
            ctx.checkpoint()?;
            let n = self
                .sink
                .write(&self.pending[offset..whole], ctx.io_timeout())
                .map_err(|e| StageError::Output(format!("{e:#}")))?;
            offset += n;
            self.counters.add_frames((n / frame_bytes) as u64);
        }
        self.pending.drain(..whole);
        Ok(())
    }

    fn drain(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        loop {
            ctx.checkpoint()?;
            let empty = self
                .sink
                .drain(ctx.io_timeout())
                .map_err(|e| StageError::Output(format!("{e:#}")))?;
            if empty {
                return Ok(());
            }
        }
    }
}

impl Element for WriterElement {
    fn role(&self) -> StageRole {
        StageRole::Writer
    }

    fn open(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        self.sink.bind_pause(ctx.paused_flag());
        self.sink.bind_abort(ctx.abort_flag(), ctx.io_timeout());
        Ok(())
    }

    fn process(&mut self, ctx: &StageContext) -> Result<Flow, StageError> {
        let n = match ctx.read(&mut self.buf)? {
            Input::Data(n) => n,
            Input::Marker(Marker::Format(info)) => {
                self.apply_format(ctx, info)?;
                return Ok(Flow::Continue);
            }
            Input::Marker(Marker::TrackStart { .. }) => return Ok(Flow::Continue),
            Input::End => {
                if self.info.is_some() {
                    self.drain(ctx)?;
                }
                return Ok(Flow::Finished);
            }
        };
        let Some(frame_bytes) = self.info.as_ref().map(StreamInfo::frame_bytes) else {
            return Err(StageError::Decode(
                "pcm arrived before any stream info".to_string(),
            ));
        };
        self.pending.extend_from_slice(&self.buf[..n]);
        self.flush_frames(ctx, frame_bytes)?;
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBus, EventKind, Listen};
    use crate::pipeline::{Pipeline, WaitStatus};
    use crate::stage::{Stage, StageConfig, StageState};
    use crate::testing::{Feeder, RecordingSink, Seen, SinkCall};
    use std::time::Duration;

    fn run(feed: Vec<Seen>, sink: RecordingSink) -> (Pipeline, Arc<SessionCounters>) {
        let counters = Arc::new(SessionCounters::new());
        let bus = EventBus::new(64, Duration::from_millis(10));
        let mut p = Pipeline::new();
        p.register(Stage::configure("src", StageConfig::default(), Box::new(Feeder::new(feed))))
            .unwrap();
        p.register(Stage::configure(
            "i2s",
            StageConfig::default(),
            Box::new(WriterElement::new(Box::new(sink), counters.clone())),
        ))
        .unwrap();
        p.link(&["src", "i2s"]).unwrap();
        p.set_listener(&bus).unwrap();
        p.run().unwrap();
        assert_eq!(p.wait_for_stop(Duration::from_secs(5)), WaitStatus::AllStopped);
        (p, counters)
    }

    fn format(rate: u32, channels: u16) -> Seen {
        Seen::Marker(Marker::Format(StreamInfo::new(rate, 16, channels)))
    }

    #[test]
    fn configures_before_writing_and_counts_frames() {
        let sink = RecordingSink::new();
        let calls = sink.calls();
        let (p, counters) = run(vec![format(1_000, 2), Seen::Bytes(vec![0; 400])], sink);
        assert_eq!(p.stage_state("i2s"), Some(StageState::Finished));

        let calls = calls.take();
        assert!(matches!(calls.first(), Some(SinkCall::Configure(info)) if info.sample_rate == 1_000));
        assert_eq!(SinkCall::written(&calls), 400);
        assert_eq!(calls.last(), Some(&SinkCall::Drain));
        // 400 bytes of 16-bit stereo at 1 kHz.
        assert_eq!(counters.elapsed_ms(), Some(100));
    }

    #[test]
    fn partial_frames_wait_for_the_rest() {
        let sink = RecordingSink::new();
        let calls = sink.calls();
        let (_, _) = run(
            vec![format(1_000, 2), Seen::Bytes(vec![0; 3]), Seen::Bytes(vec![0; 5])],
            sink,
        );
        let calls = calls.take();
        for call in &calls {
            if let SinkCall::Write(n) = call {
                assert_eq!(n % 4, 0);
            }
        }
        assert_eq!(SinkCall::written(&calls), 8);
    }

    #[test]
    fn same_format_does_not_reconfigure() {
        let sink = RecordingSink::new();
        let calls = sink.calls();
        let (_, _) = run(
            vec![
                format(1_000, 1),
                Seen::Bytes(vec![0; 2]),
                format(1_000, 1),
                Seen::Bytes(vec![0; 2]),
                format(2_000, 1),
            ],
            sink,
        );
        let configures = calls
            .take()
            .iter()
            .filter(|c| matches!(c, SinkCall::Configure(_)))
            .count();
        assert_eq!(configures, 2);
    }

    #[test]
    fn pcm_without_format_is_rejected() {
        let (p, counters) = run(vec![Seen::Bytes(vec![0; 4])], RecordingSink::new());
        assert_eq!(p.stage_state("i2s"), Some(StageState::Error));
        assert_eq!(counters.elapsed_ms(), None);
    }

    /// Blocks in `configure` until the stage aborts, like a device that is slow to open.
    #[derive(Default)]
    struct SlowOpenSink {
        abort: Option<Arc<std::sync::atomic::AtomicBool>>,
    }

    impl AudioSink for SlowOpenSink {
        fn configure(&mut self, _info: &StreamInfo) -> anyhow::Result<()> {
            let abort = self.abort.clone().ok_or_else(|| anyhow::anyhow!("abort not bound"))?;
            while !abort.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            anyhow::bail!("aborted while opening")
        }

        fn write(&mut self, pcm: &[u8], _timeout: Duration) -> anyhow::Result<usize> {
            Ok(pcm.len())
        }

        fn drain(&mut self, _timeout: Duration) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn bind_abort(&mut self, abort: Arc<std::sync::atomic::AtomicBool>, _slice: Duration) {
            self.abort = Some(abort);
        }
    }

    #[test]
    fn stop_now_during_configure_stops_without_error() {
        let bus = EventBus::new(64, Duration::from_millis(10));
        let mut p = Pipeline::new();
        p.register(Stage::configure(
            "src",
            StageConfig::default(),
            Box::new(Feeder::new(vec![format(1_000, 1)])),
        ))
        .unwrap();
        p.register(Stage::configure(
            "i2s",
            StageConfig::default(),
            Box::new(WriterElement::new(
                Box::new(SlowOpenSink::default()),
                Arc::new(SessionCounters::new()),
            )),
        ))
        .unwrap();
        p.link(&["src", "i2s"]).unwrap();
        p.set_listener(&bus).unwrap();
        p.run().unwrap();
        std::thread::sleep(Duration::from_millis(30));

        p.stop_now();
        assert_eq!(p.wait_for_stop(Duration::from_secs(1)), WaitStatus::AllStopped);
        assert_eq!(p.stage_state("i2s"), Some(StageState::Stopped));
        while let Listen::Event(ev) = bus.listen(Duration::from_millis(10)) {
            assert!(!matches!(ev.kind, EventKind::Error(_)), "unexpected {ev:?}");
        }
    }

    #[test]
    fn sink_configure_failure_is_an_output_error() {
        let (p, _) = run(vec![format(1_000, 1)], RecordingSink::new().failing_configure());
        assert_eq!(p.stage_state("i2s"), Some(StageState::Error));
    }
}
