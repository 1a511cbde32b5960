//! Pipeline graph and lifecycle.
//!
//! Lifecycle, in the only order accepted:
//! `register` → `link` → `set_listener` → `run` → `stop` → `wait_for_stop`
//! → `terminate` → `unregister` (each stage) → `remove_listener` → `destroy`
//! → destroy each stage.
//!
//! Out-of-order calls return [`PipelineError::Lifecycle`]. [`Pipeline::teardown`]
//! runs the whole sequence, and dropping a pipeline that was not destroyed
//! terminates its workers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stream_player_types::TerminationMode;

use crate::error::PipelineError;
use crate::event::EventBus;
use crate::ring_buffer::RingBuffer;
use crate::stage::{Stage, StageControl, StageRole, StageState};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Building,
    Linked,
    Running,
    Terminated,
    Destroyed,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Linked => "linked",
            Self::Running => "running",
            Self::Terminated => "terminated",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Outcome of [`Pipeline::wait_for_stop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    AllStopped,
    TimedOut { active: usize },
}

#[derive(Default)]
pub struct Pipeline {
    /// Registration order until linked, chain order afterwards.
    stages: Vec<Stage>,
    links: Vec<Arc<RingBuffer>>,
    listener: Option<EventBus>,
    phase: Phase,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn misuse(&self, op: &'static str) -> PipelineError {
        PipelineError::Lifecycle {
            op,
            phase: self.phase.as_str(),
        }
    }

    fn expect_phase(&self, op: &'static str, allowed: &[Phase]) -> Result<(), PipelineError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(self.misuse(op))
        }
    }

    pub fn register(&mut self, stage: Stage) -> Result<(), PipelineError> {
        self.expect_phase("register", &[Phase::Building])?;
        if self.stages.iter().any(|s| s.tag() == stage.tag()) {
            return Err(PipelineError::DuplicateTag(stage.tag().to_string()));
        }
        self.stages.push(stage);
        Ok(())
    }

    /// Wire registered stages into a single reader → … → writer chain.
    pub fn link(&mut self, order: &[&str]) -> Result<(), PipelineError> {
        self.expect_phase("link", &[Phase::Building])?;

        let mut seen = HashSet::new();
        for tag in order {
            if !self.stages.iter().any(|s| s.tag() == *tag) {
                return Err(PipelineError::UnknownTag(tag.to_string()));
            }
            if !seen.insert(*tag) {
                return Err(PipelineError::LinkedTwice(tag.to_string()));
            }
        }
        if let Some(left_out) = self.stages.iter().find(|s| !seen.contains(s.tag())) {
            return Err(PipelineError::Unlinked(left_out.tag().to_string()));
        }
        if order.len() < 2 {
            return Err(PipelineError::InvalidChain(
                "a chain needs at least a reader and a writer".to_string(),
            ));
        }

        let mut chain = Vec::with_capacity(order.len());
        for tag in order {
            if let Some(idx) = self.stages.iter().position(|s| s.tag() == *tag) {
                chain.push(self.stages.remove(idx));
            }
        }
        let last = chain.len() - 1;
        for (idx, stage) in chain.iter().enumerate() {
            let expected_ok = match stage.role() {
                StageRole::Reader => idx == 0,
                StageRole::Writer => idx == last,
                StageRole::Decoder => idx != 0 && idx != last,
            };
            if !expected_ok {
                let err = PipelineError::InvalidChain(format!(
                    "{} stage {} cannot sit at position {idx}",
                    stage.role(),
                    stage.tag()
                ));
                self.stages = chain;
                return Err(err);
            }
        }

        let links: Vec<Arc<RingBuffer>> = chain[..last]
            .iter()
            .map(|producer| Arc::new(RingBuffer::new(producer.config().out_buffer_bytes)))
            .collect();
        for (idx, stage) in chain.iter_mut().enumerate() {
            let input = idx.checked_sub(1).map(|i| links[i].clone());
            let output = links.get(idx).cloned();
            stage.attach(input, output);
        }

        tracing::debug!(order = ?order, "pipeline linked");
        self.stages = chain;
        self.links = links;
        self.phase = Phase::Linked;
        Ok(())
    }

    pub fn set_listener(&mut self, bus: &EventBus) -> Result<(), PipelineError> {
        self.expect_phase("set listener", &[Phase::Building, Phase::Linked])?;
        if self.listener.is_some() {
            return Err(PipelineError::Lifecycle {
                op: "set listener",
                phase: "already listening",
            });
        }
        bus.attach();
        self.listener = Some(bus.clone());
        Ok(())
    }

    /// Start every worker in reverse link order: writer first, reader last.
    pub fn run(&mut self) -> Result<(), PipelineError> {
        self.expect_phase("run", &[Phase::Linked])?;
        let Some(bus) = self.listener.clone() else {
            return Err(PipelineError::NoListener);
        };

        self.phase = Phase::Running;
        for idx in (0..self.stages.len()).rev() {
            let stage = &mut self.stages[idx];
            let sender = bus.sender(stage.tag(), stage.role());
            if let Err(e) = stage.start(sender) {
                tracing::error!(error = %e, "pipeline start failed");
                self.terminate_stages();
                return Err(e);
            }
        }
        tracing::debug!(stages = self.stages.len(), "pipeline running");
        Ok(())
    }

    pub fn pause(&self) -> Result<(), PipelineError> {
        self.expect_phase("pause", &[Phase::Running])?;
        self.stages.iter().for_each(Stage::pause);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), PipelineError> {
        self.expect_phase("resume", &[Phase::Running])?;
        self.stages.iter().for_each(Stage::resume);
        Ok(())
    }

    /// Stop taking new input; buffered data drains through the chain.
    pub fn stop(&self) -> Result<(), PipelineError> {
        self.expect_phase("stop", &[Phase::Running])?;
        for stage in &self.stages {
            stage.resume();
        }
        if let Some(head) = self.stages.first() {
            head.stop(TerminationMode::Graceful);
        }
        Ok(())
    }

    /// Abort every stage, discarding buffered data.
    pub fn stop_now(&self) {
        for stage in &self.stages {
            stage.stop(TerminationMode::Now);
        }
    }

    /// Wait until every started stage reached stopped, finished or error.
    pub fn wait_for_stop(&self, timeout: Duration) -> WaitStatus {
        let controls: Vec<_> = self.stages.iter().map(Stage::control).collect();
        wait_settled(&controls, timeout)
    }

    /// Force every stage down and join the workers.
    pub fn terminate(&mut self) -> Result<(), PipelineError> {
        self.expect_phase(
            "terminate",
            &[Phase::Building, Phase::Linked, Phase::Running, Phase::Terminated],
        )?;
        self.terminate_stages();
        Ok(())
    }

    fn terminate_stages(&mut self) {
        for stage in &mut self.stages {
            stage.terminate();
        }
        self.phase = Phase::Terminated;
    }

    /// Remove a stage from the pipeline, handing it back for destruction.
    pub fn unregister(&mut self, tag: &str) -> Result<Stage, PipelineError> {
        self.expect_phase("unregister", &[Phase::Building, Phase::Terminated])?;
        let idx = self
            .stages
            .iter()
            .position(|s| s.tag() == tag)
            .ok_or_else(|| PipelineError::UnknownTag(tag.to_string()))?;
        Ok(self.stages.remove(idx))
    }

    pub fn remove_listener(&mut self) -> Result<(), PipelineError> {
        if !self.stages.is_empty() {
            return Err(PipelineError::Lifecycle {
                op: "remove listener",
                phase: "holding stages",
            });
        }
        let bus = self.listener.take().ok_or(PipelineError::NoListener)?;
        bus.detach();
        Ok(())
    }

    /// Release the links. Requires every stage unregistered and the listener removed.
    pub fn destroy(&mut self) -> Result<(), PipelineError> {
        if self.phase == Phase::Destroyed {
            return Err(self.misuse("destroy"));
        }
        if !self.stages.is_empty() {
            return Err(PipelineError::Lifecycle {
                op: "destroy",
                phase: "holding stages",
            });
        }
        if self.listener.is_some() {
            return Err(PipelineError::Lifecycle {
                op: "destroy",
                phase: "still listening",
            });
        }
        self.links.clear();
        self.phase = Phase::Destroyed;
        Ok(())
    }

    /// Run the full teardown sequence. Stop is graceful; callers wanting an
    /// abort call [`Pipeline::stop_now`] first.
    pub fn teardown(mut self, timeout: Duration) -> WaitStatus {
        if self.phase == Phase::Running {
            if let Err(e) = self.stop() {
                tracing::warn!(error = %e, "teardown: stop failed");
            }
        }
        let wait = self.wait_for_stop(timeout);
        if let WaitStatus::TimedOut { active } = wait {
            tracing::warn!(active, "pipeline did not settle; terminating");
        }
        self.terminate_stages();

        let tags: Vec<String> = self.stages.iter().map(|s| s.tag().to_string()).collect();
        let mut released = Vec::with_capacity(tags.len());
        for tag in &tags {
            match self.unregister(tag) {
                Ok(stage) => released.push(stage),
                Err(e) => tracing::warn!(stage = %tag, error = %e, "teardown: unregister failed"),
            }
        }
        if self.listener.is_some() {
            if let Err(e) = self.remove_listener() {
                tracing::warn!(error = %e, "teardown: remove_listener failed");
            }
        }
        if let Err(e) = self.destroy() {
            tracing::warn!(error = %e, "teardown: destroy failed");
        }
        for stage in released {
            stage.destroy();
        }
        tracing::debug!(wait = ?wait, "pipeline torn down");
        wait
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            controls: Arc::new(self.stages.iter().map(Stage::control).collect()),
        }
    }

    pub fn stage_state(&self, tag: &str) -> Option<StageState> {
        self.stages.iter().find(|s| s.tag() == tag).map(Stage::state)
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.phase == Phase::Destroyed {
            return;
        }
        if self.stages.iter().any(Stage::is_started) {
            tracing::debug!("pipeline dropped before teardown; terminating stages");
        }
        self.terminate_stages();
        if let Some(bus) = self.listener.take() {
            bus.detach();
        }
    }
}

fn wait_settled(controls: &[Arc<StageControl>], timeout: Duration) -> WaitStatus {
    let deadline = Instant::now() + timeout;
    for control in controls {
        control.wait_settled(deadline);
    }
    let active = controls.iter().filter(|c| c.is_active()).count();
    if active == 0 {
        WaitStatus::AllStopped
    } else {
        WaitStatus::TimedOut { active }
    }
}

/// Control access to a running pipeline from another thread.
#[derive(Clone)]
pub struct PipelineHandle {
    controls: Arc<Vec<Arc<StageControl>>>,
}

impl PipelineHandle {
    pub fn stop_now(&self) {
        for control in self.controls.iter() {
            control.stop(TerminationMode::Now);
        }
    }

    pub fn wait_for_stop(&self, timeout: Duration) -> WaitStatus {
        wait_settled(&self.controls, timeout)
    }

    pub fn active(&self) -> usize {
        self.controls.iter().filter(|c| c.is_active()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::event::{EventKind, Listen};
    use crate::stage::{Element, Flow, Input, StageConfig, StageContext};
    use std::sync::Mutex;
    use std::thread;

    const IO: Duration = Duration::from_millis(5);

    /// Emits `remaining` bytes, or blocks forever when `stall` is set.
    struct Source {
        remaining: usize,
        stall: bool,
    }

    impl Element for Source {
        fn role(&self) -> StageRole {
            StageRole::Reader
        }

        fn process(&mut self, ctx: &StageContext) -> Result<Flow, StageError> {
            if self.stall {
                ctx.sleep(Duration::from_secs(3600))?;
                return Ok(Flow::Continue);
            }
            if self.remaining == 0 {
                return Ok(Flow::Finished);
            }
            let n = self.remaining.min(8);
            ctx.write_all(&vec![0xAB; n])?;
            self.remaining -= n;
            Ok(Flow::Continue)
        }
    }

    struct Relay;

    impl Element for Relay {
        fn role(&self) -> StageRole {
            StageRole::Decoder
        }

        fn process(&mut self, ctx: &StageContext) -> Result<Flow, StageError> {
            let mut buf = [0u8; 8];
            match ctx.read(&mut buf)? {
                Input::Data(n) => ctx.write_all(&buf[..n])?,
                Input::Marker(m) => ctx.write_marker(m)?,
                Input::End => return Ok(Flow::Finished),
            }
            Ok(Flow::Continue)
        }
    }

    struct Drain {
        total: Arc<Mutex<usize>>,
    }

    impl Element for Drain {
        fn role(&self) -> StageRole {
            StageRole::Writer
        }

        fn process(&mut self, ctx: &StageContext) -> Result<Flow, StageError> {
            let mut buf = [0u8; 8];
            match ctx.read(&mut buf)? {
                Input::Data(n) => *self.total.lock().unwrap() += n,
                Input::Marker(_) => {}
                Input::End => return Ok(Flow::Finished),
            }
            Ok(Flow::Continue)
        }
    }

    fn cfg() -> StageConfig {
        StageConfig {
            out_buffer_bytes: 16,
            io_timeout: IO,
            core: None,
        }
    }

    fn chain(source: Source) -> (Pipeline, Arc<Mutex<usize>>) {
        let total = Arc::new(Mutex::new(0));
        let mut p = Pipeline::new();
        p.register(Stage::configure("http", cfg(), Box::new(source)))
            .unwrap();
        p.register(Stage::configure("mp3", cfg(), Box::new(Relay))).unwrap();
        p.register(Stage::configure(
            "i2s",
            cfg(),
            Box::new(Drain {
                total: total.clone(),
            }),
        ))
        .unwrap();
        (p, total)
    }

    fn bus() -> EventBus {
        EventBus::new(64, Duration::from_millis(5))
    }

    #[test]
    fn register_rejects_duplicate_tag() {
        let mut p = Pipeline::new();
        p.register(Stage::configure("mp3", cfg(), Box::new(Relay))).unwrap();
        let err = p
            .register(Stage::configure("mp3", cfg(), Box::new(Relay)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateTag(t) if t == "mp3"));
    }

    #[test]
    fn link_rejects_unknown_repeated_and_missing_tags() {
        let (mut p, _) = chain(Source {
            remaining: 0,
            stall: false,
        });
        assert!(matches!(
            p.link(&["http", "flac", "i2s"]),
            Err(PipelineError::UnknownTag(t)) if t == "flac"
        ));
        assert!(matches!(
            p.link(&["http", "mp3", "mp3", "i2s"]),
            Err(PipelineError::LinkedTwice(t)) if t == "mp3"
        ));
        assert!(matches!(
            p.link(&["http", "i2s"]),
            Err(PipelineError::Unlinked(t)) if t == "mp3"
        ));
        assert!(matches!(
            p.link(&["mp3", "http", "i2s"]),
            Err(PipelineError::InvalidChain(_))
        ));
        p.link(&["http", "mp3", "i2s"]).unwrap();
    }

    #[test]
    fn run_requires_link_and_listener() {
        let (mut p, _) = chain(Source {
            remaining: 0,
            stall: false,
        });
        assert!(matches!(p.run(), Err(PipelineError::Lifecycle { op: "run", .. })));
        p.link(&["http", "mp3", "i2s"]).unwrap();
        assert!(matches!(p.run(), Err(PipelineError::NoListener)));
    }

    #[test]
    fn data_reaches_writer_and_pipeline_finishes() {
        let (mut p, total) = chain(Source {
            remaining: 100,
            stall: false,
        });
        let bus = bus();
        p.link(&["http", "mp3", "i2s"]).unwrap();
        p.set_listener(&bus).unwrap();
        p.run().unwrap();

        assert_eq!(p.wait_for_stop(Duration::from_secs(2)), WaitStatus::AllStopped);
        assert_eq!(*total.lock().unwrap(), 100);
        assert_eq!(p.stage_state("i2s"), Some(StageState::Finished));
        assert_eq!(p.teardown(Duration::from_millis(100)), WaitStatus::AllStopped);
        assert_eq!(bus.attached(), 0);
        bus.destroy().unwrap();
    }

    #[test]
    fn stop_now_settles_even_with_a_stalled_reader() {
        let (mut p, _) = chain(Source {
            remaining: 0,
            stall: true,
        });
        let bus = bus();
        p.link(&["http", "mp3", "i2s"]).unwrap();
        p.set_listener(&bus).unwrap();
        p.run().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            p.wait_for_stop(Duration::from_millis(10)),
            WaitStatus::TimedOut { active: 3 }
        );

        let started = Instant::now();
        p.stop_now();
        assert_eq!(p.wait_for_stop(Duration::from_millis(500)), WaitStatus::AllStopped);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(p.stage_state("http"), Some(StageState::Stopped));
    }

    #[test]
    fn graceful_stop_drains_and_finishes_downstream() {
        let (mut p, total) = chain(Source {
            remaining: usize::MAX,
            stall: false,
        });
        let bus = bus();
        p.link(&["http", "mp3", "i2s"]).unwrap();
        p.set_listener(&bus).unwrap();
        p.run().unwrap();
        thread::sleep(Duration::from_millis(20));
        p.stop().unwrap();

        assert_eq!(p.wait_for_stop(Duration::from_secs(2)), WaitStatus::AllStopped);
        assert_eq!(p.stage_state("i2s"), Some(StageState::Finished));
        assert!(*total.lock().unwrap() > 0);
        let mut writer_states = Vec::new();
        while let Listen::Event(e) = bus.listen(Duration::ZERO) {
            if let (StageRole::Writer, EventKind::StateChanged(s)) = (e.role, e.kind) {
                writer_states.push(s);
            }
        }
        assert_eq!(writer_states.last(), Some(&StageState::Finished));
        assert!(!writer_states.contains(&StageState::Error));
    }

    #[test]
    fn teardown_steps_are_enforced_in_order() {
        let (mut p, _) = chain(Source {
            remaining: 10,
            stall: false,
        });
        let bus = bus();
        p.link(&["http", "mp3", "i2s"]).unwrap();
        p.set_listener(&bus).unwrap();
        p.run().unwrap();

        assert!(matches!(
            p.unregister("mp3"),
            Err(PipelineError::Lifecycle { op: "unregister", phase: "running" })
        ));
        assert!(matches!(
            p.remove_listener(),
            Err(PipelineError::Lifecycle { op: "remove listener", .. })
        ));
        assert!(matches!(
            bus.clone().destroy(),
            Err(PipelineError::ListenerAttached(1))
        ));
        assert!(matches!(p.destroy(), Err(PipelineError::Lifecycle { op: "destroy", .. })));

        p.wait_for_stop(Duration::from_secs(2));
        p.terminate().unwrap();
        let stages: Vec<Stage> = ["http", "mp3", "i2s"]
            .iter()
            .map(|t| p.unregister(t).unwrap())
            .collect();
        assert!(matches!(p.destroy(), Err(PipelineError::Lifecycle { .. })));
        p.remove_listener().unwrap();
        p.destroy().unwrap();
        for stage in stages {
            stage.destroy();
        }
        assert!(matches!(p.run(), Err(PipelineError::Lifecycle { phase: "destroyed", .. })));
        bus.destroy().unwrap();
    }

    #[test]
    fn dropping_a_running_pipeline_releases_its_listener() {
        let (mut p, _) = chain(Source {
            remaining: 0,
            stall: true,
        });
        let bus = bus();
        p.link(&["http", "mp3", "i2s"]).unwrap();
        p.set_listener(&bus).unwrap();
        p.run().unwrap();
        let handle = p.handle();
        drop(p);
        assert_eq!(handle.active(), 0);
        assert_eq!(bus.attached(), 0);
    }
}
