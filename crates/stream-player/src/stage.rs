//! Pipeline stages.
//!
//! A [`Stage`] wraps an [`Element`] (the per-role transform) with a worker
//! thread, a small state machine and the ring buffers shared with its
//! neighbours. Elements never touch the rings directly; they go through a
//! [`StageContext`], whose blocking operations wait in `io_timeout` slices so
//! pause and stop requests are noticed within one slice.
//!
//! Terminal outcomes of the worker:
//! - element finished: output marked done, state `Finished`
//! - stop now (or a neighbour aborted): both rings aborted, state `Stopped`
//! - element error: `Error` event posted, both rings aborted, state `Error`

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use stream_player_types::TerminationMode;

use crate::error::{PipelineError, StageError};
use crate::event::{EventKind, EventSender, StageFault};
use crate::info::StreamInfo;
use crate::ring_buffer::{Marker, ReadOutcome, Readiness, RingBuffer, WriteOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageRole {
    Reader,
    Decoder,
    Writer,
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reader => "reader",
            Self::Decoder => "decoder",
            Self::Writer => "writer",
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StageState {
    #[default]
    Idle,
    /// Linked into a pipeline, worker not started.
    Ready,
    Running,
    Paused,
    /// A stop was requested; the worker has not settled yet.
    Stopping,
    Stopped,
    Finished,
    Error,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Finished | Self::Error)
    }
}

/// What the worker should do after a `process` call.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished,
}

/// The transform run by a stage worker.
pub trait Element: Send + 'static {
    fn role(&self) -> StageRole;

    /// Called once on the worker before the first `process`.
    fn open(&mut self, _ctx: &StageContext) -> Result<(), StageError> {
        Ok(())
    }

    /// Do one bounded unit of work.
    fn process(&mut self, ctx: &StageContext) -> Result<Flow, StageError>;

    /// Called once on the worker after the last `process`, whatever the outcome.
    fn close(&mut self) {}
}

#[derive(Clone, Debug)]
pub struct StageConfig {
    /// Capacity of the ring this stage produces into.
    pub out_buffer_bytes: usize,
    /// Slice length of every blocking wait.
    pub io_timeout: Duration,
    /// Preferred CPU core. Only recorded in the worker name.
    pub core: Option<usize>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            out_buffer_bytes: 8 * 1024,
            io_timeout: Duration::from_millis(50),
            core: None,
        }
    }
}

/// State and request flags shared by a stage, its worker and pipeline handles.
pub(crate) struct StageControl {
    tag: String,
    state: Mutex<StageState>,
    changed: Condvar,
    paused: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    graceful: AtomicBool,
    started: AtomicBool,
    rings: Mutex<Vec<Arc<RingBuffer>>>,
}

impl StageControl {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            state: Mutex::new(StageState::Idle),
            changed: Condvar::new(),
            paused: Arc::new(AtomicBool::new(false)),
            abort: Arc::new(AtomicBool::new(false)),
            graceful: AtomicBool::new(false),
            started: AtomicBool::new(false),
            rings: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn state(&self) -> StageState {
        *self.lock()
    }

    /// Move to `next`. Terminal states are final. Returns `true` on change.
    fn set_state(&self, next: StageState) -> bool {
        let mut g = self.lock();
        if g.is_terminal() || *g == next {
            return false;
        }
        *g = next;
        drop(g);
        self.changed.notify_all();
        true
    }

    fn replace_if(&self, from: StageState, to: StageState) -> bool {
        let mut g = self.lock();
        if *g != from {
            return false;
        }
        *g = to;
        drop(g);
        self.changed.notify_all();
        true
    }

    /// Started and not yet settled in a terminal state.
    pub(crate) fn is_active(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.state().is_terminal()
    }

    /// Wait until the stage is no longer active. Returns `false` on timeout.
    pub(crate) fn wait_settled(&self, deadline: Instant) -> bool {
        let mut g = self.lock();
        loop {
            if !self.started.load(Ordering::Acquire) || g.is_terminal() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            g = self
                .changed
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn wake(&self) {
        let _g = self.lock();
        self.changed.notify_all();
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.wake();
    }

    fn mark_stopping(&self) {
        let mut g = self.lock();
        if self.started.load(Ordering::Acquire) && !g.is_terminal() {
            *g = StageState::Stopping;
        }
        drop(g);
        self.changed.notify_all();
    }

    pub(crate) fn stop(&self, mode: TerminationMode) {
        match mode {
            TerminationMode::Now => {
                self.abort.store(true, Ordering::Release);
                for ring in self.rings().iter() {
                    ring.abort();
                }
            }
            TerminationMode::Graceful => {
                self.graceful.store(true, Ordering::Release);
            }
        }
        self.paused.store(false, Ordering::Release);
        self.mark_stopping();
    }

    fn rings(&self) -> MutexGuard<'_, Vec<Arc<RingBuffer>>> {
        self.rings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Park while paused, waking at least every `slice`.
    fn park(&self, slice: Duration) {
        let g = self.lock();
        if self.paused.load(Ordering::Acquire) && !self.aborted() {
            let _ = self
                .changed
                .wait_timeout(g, slice)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Control checks shared by every blocking operation of a worker.
#[derive(Clone)]
pub(crate) struct Gate {
    control: Arc<StageControl>,
    events: EventSender,
    io_timeout: Duration,
}

impl Gate {
    fn enter(&self, state: StageState) {
        if self.control.set_state(state) {
            tracing::debug!(tag = %self.control.tag, state = ?state, "stage state");
            self.events.post(EventKind::StateChanged(state));
        }
    }

    /// Fail on abort; park while paused, reporting `Paused` then `Running`.
    pub(crate) fn checkpoint(&self) -> Result<(), StageError> {
        let control = &self.control;
        if control.aborted() {
            return Err(StageError::Aborted);
        }
        if !control.paused.load(Ordering::Acquire) {
            return Ok(());
        }
        if control.replace_if(StageState::Running, StageState::Paused) {
            tracing::debug!(tag = %control.tag, "stage paused");
            self.events.post(EventKind::StateChanged(StageState::Paused));
        }
        while control.paused.load(Ordering::Acquire) && !control.aborted() {
            control.park(self.io_timeout);
        }
        if control.aborted() {
            return Err(StageError::Aborted);
        }
        if control.replace_if(StageState::Paused, StageState::Running) {
            tracing::debug!(tag = %control.tag, "stage resumed");
            self.events.post(EventKind::StateChanged(StageState::Running));
        }
        Ok(())
    }

    pub(crate) fn io_timeout(&self) -> Duration {
        self.io_timeout
    }
}

/// Result of reading from the input ring.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Data(usize),
    Marker(Marker),
    /// Upstream finished and everything was consumed.
    End,
}

/// What is waiting in the input ring.
#[derive(Debug, PartialEq, Eq)]
pub enum Pending {
    Bytes,
    Marker,
    End,
}

/// Result of waiting on a crossbeam channel from a worker.
#[derive(Debug)]
pub enum Recv<T> {
    Msg(T),
    Idle,
    Disconnected,
}

/// Reading end of a stage's input ring, usable away from the context
/// (the decoder hands one to the codec as its byte source).
#[derive(Clone)]
pub struct InputPort {
    ring: Arc<RingBuffer>,
    gate: Gate,
}

impl InputPort {
    pub fn read(&self, buf: &mut [u8]) -> Result<Input, StageError> {
        loop {
            self.gate.checkpoint()?;
            match self.ring.read(buf, self.gate.io_timeout) {
                ReadOutcome::Data(n) => return Ok(Input::Data(n)),
                ReadOutcome::Marker(m) => return Ok(Input::Marker(m)),
                ReadOutcome::Done => return Ok(Input::End),
                ReadOutcome::Aborted => return Err(StageError::Aborted),
                ReadOutcome::Timeout => {}
            }
        }
    }

    /// Read bytes only. Returns 0 when the next item is a marker or the end,
    /// leaving it in place.
    pub fn read_bytes(&self, buf: &mut [u8]) -> Result<usize, StageError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.wait()? {
                Pending::Marker | Pending::End => return Ok(0),
                Pending::Bytes => match self.ring.read(buf, Duration::ZERO) {
                    ReadOutcome::Data(n) => return Ok(n),
                    ReadOutcome::Aborted => return Err(StageError::Aborted),
                    _ => {}
                },
            }
        }
    }

    /// Block until something is readable.
    pub fn wait(&self) -> Result<Pending, StageError> {
        loop {
            self.gate.checkpoint()?;
            match self.ring.wait_readable(self.gate.io_timeout) {
                Readiness::Bytes => return Ok(Pending::Bytes),
                Readiness::Marker => return Ok(Pending::Marker),
                Readiness::Done => return Ok(Pending::End),
                Readiness::Aborted => return Err(StageError::Aborted),
                Readiness::Timeout => {}
            }
        }
    }

    /// Discard bytes up to the next marker or the end of input.
    pub fn skip_to_marker(&self) -> Result<u64, StageError> {
        let mut scratch = [0u8; 1024];
        let mut skipped = 0u64;
        loop {
            let n = self.read_bytes(&mut scratch)?;
            if n == 0 {
                return Ok(skipped);
            }
            skipped += n as u64;
        }
    }
}

/// Everything an element may do from its worker.
pub struct StageContext {
    gate: Gate,
    input: Option<InputPort>,
    output: Option<Arc<RingBuffer>>,
}

impl StageContext {
    pub fn tag(&self) -> &str {
        self.gate.control.tag()
    }

    pub fn io_timeout(&self) -> Duration {
        self.gate.io_timeout
    }

    pub fn checkpoint(&self) -> Result<(), StageError> {
        self.gate.checkpoint()
    }

    /// A graceful stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.gate.control.graceful.load(Ordering::Acquire)
    }

    /// Flag that is `true` while the stage is asked to pause.
    pub fn paused_flag(&self) -> Arc<AtomicBool> {
        self.gate.control.paused.clone()
    }

    /// Flag set once the stage is told to stop now.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.gate.control.abort.clone()
    }

    pub fn post(&self, kind: EventKind) {
        self.gate.events.post(kind);
    }

    fn input(&self) -> Result<&InputPort, StageError> {
        self.input
            .as_ref()
            .ok_or_else(|| StageError::Resource(format!("{} has no input buffer", self.tag())))
    }

    fn output(&self) -> Result<&Arc<RingBuffer>, StageError> {
        self.output
            .as_ref()
            .ok_or_else(|| StageError::Resource(format!("{} has no output buffer", self.tag())))
    }

    pub fn input_port(&self) -> Result<InputPort, StageError> {
        self.input().cloned()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<Input, StageError> {
        self.input()?.read(buf)
    }

    pub fn wait_input(&self) -> Result<Pending, StageError> {
        self.input()?.wait()
    }

    /// Write all of `data`, waiting for room as needed.
    pub fn write_all(&self, data: &[u8]) -> Result<(), StageError> {
        let out = self.output()?;
        let mut offset = 0;
        while offset < data.len() {
            self.gate.checkpoint()?;
            match out.write(&data[offset..], self.gate.io_timeout) {
                WriteOutcome::Written(n) => offset += n,
                WriteOutcome::Timeout => {}
                WriteOutcome::Closed | WriteOutcome::Aborted => return Err(StageError::Aborted),
            }
        }
        Ok(())
    }

    pub fn write_marker(&self, marker: Marker) -> Result<(), StageError> {
        if self.output()?.push_marker(marker) {
            Ok(())
        } else {
            Err(StageError::Aborted)
        }
    }

    /// Report a new PCM format: post the event, then place the marker ahead
    /// of any PCM decoded under it.
    pub fn announce(&self, info: StreamInfo) -> Result<(), StageError> {
        self.post(EventKind::MusicInfo(info.clone()));
        self.write_marker(Marker::Format(info))
    }

    /// Wait one slice for a message on `rx`.
    pub fn recv<T>(&self, rx: &Receiver<T>) -> Result<Recv<T>, StageError> {
        self.gate.checkpoint()?;
        match rx.recv_timeout(self.gate.io_timeout) {
            Ok(msg) => Ok(Recv::Msg(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(Recv::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(Recv::Disconnected),
        }
    }

    /// Sleep for `duration`, still honouring pause and stop requests.
    pub fn sleep(&self, duration: Duration) -> Result<(), StageError> {
        let deadline = Instant::now() + duration;
        loop {
            self.gate.checkpoint()?;
            let now = Instant::now();
            if now >= deadline || self.stop_requested() {
                return Ok(());
            }
            thread::sleep((deadline - now).min(self.gate.io_timeout));
        }
    }
}

/// One unit of the pipeline: an element, its worker and its links.
pub struct Stage {
    tag: String,
    role: StageRole,
    config: StageConfig,
    control: Arc<StageControl>,
    element: Option<Box<dyn Element>>,
    input: Option<Arc<RingBuffer>>,
    output: Option<Arc<RingBuffer>>,
    worker: Option<JoinHandle<Box<dyn Element>>>,
}

impl Stage {
    pub fn configure(tag: impl Into<String>, config: StageConfig, element: Box<dyn Element>) -> Self {
        let tag = tag.into();
        Self {
            role: element.role(),
            control: Arc::new(StageControl::new(&tag)),
            tag,
            config,
            element: Some(element),
            input: None,
            output: None,
            worker: None,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn role(&self) -> StageRole {
        self.role
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn state(&self) -> StageState {
        self.control.state()
    }

    pub fn is_active(&self) -> bool {
        self.control.is_active()
    }

    pub(crate) fn control(&self) -> Arc<StageControl> {
        self.control.clone()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.control.started.load(Ordering::Acquire)
    }

    /// Connect the rings shared with the neighbouring stages.
    pub fn attach(&mut self, input: Option<Arc<RingBuffer>>, output: Option<Arc<RingBuffer>>) {
        let mut rings = self.control.rings();
        rings.clear();
        rings.extend(input.iter().cloned());
        rings.extend(output.iter().cloned());
        drop(rings);
        self.input = input;
        self.output = output;
        self.control.set_state(StageState::Ready);
    }

    pub(crate) fn start(&mut self, events: EventSender) -> Result<(), PipelineError> {
        let Some(element) = self.element.take() else {
            return Err(PipelineError::Lifecycle {
                op: "start stage",
                phase: "already started",
            });
        };
        let gate = Gate {
            control: self.control.clone(),
            events,
            io_timeout: self.config.io_timeout,
        };
        let ctx = StageContext {
            input: self.input.clone().map(|ring| InputPort {
                ring,
                gate: gate.clone(),
            }),
            output: self.output.clone(),
            gate,
        };
        let name = match self.config.core {
            Some(core) => format!("{}@{core}", self.tag),
            None => self.tag.clone(),
        };
        self.control.started.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || run_worker(element, ctx));
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.control.started.store(false, Ordering::Release);
                Err(PipelineError::Spawn {
                    tag: self.tag.clone(),
                    source,
                })
            }
        }
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    /// Request termination. A graceful stop on a stage with an input stops
    /// taking new data and drains what is already buffered.
    pub fn stop(&self, mode: TerminationMode) {
        if mode == TerminationMode::Graceful {
            if let Some(input) = &self.input {
                input.mark_done();
            }
        }
        self.control.stop(mode);
    }

    /// Join the worker, keeping the element until the stage is destroyed.
    pub(crate) fn join(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        match handle.join() {
            Ok(element) => self.element = Some(element),
            Err(_) => {
                tracing::error!(tag = %self.tag, "stage worker panicked");
                self.control.set_state(StageState::Error);
            }
        }
    }

    /// Stop now and wait for the worker.
    pub(crate) fn terminate(&mut self) {
        if self.worker.is_some() {
            self.control.stop(TerminationMode::Now);
        }
        self.join();
    }

    /// Release the element (and whatever hardware it holds).
    pub fn destroy(mut self) {
        self.terminate();
        self.element = None;
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn run_worker(mut element: Box<dyn Element>, ctx: StageContext) -> Box<dyn Element> {
    let gate = ctx.gate.clone();
    gate.enter(StageState::Running);

    let result = element.open(&ctx).and_then(|()| {
        loop {
            gate.checkpoint()?;
            if ctx.input.is_none() && ctx.stop_requested() {
                return Ok(());
            }
            if element.process(&ctx)? == Flow::Finished {
                return Ok(());
            }
        }
    });
    element.close();

    let abort_links = || {
        if let Some(input) = &ctx.input {
            input.ring.abort();
        }
        if let Some(output) = &ctx.output {
            output.abort();
        }
    };

    match result {
        Ok(()) => {
            if let Some(output) = &ctx.output {
                output.mark_done();
            }
            gate.enter(StageState::Finished);
        }
        Err(StageError::Aborted) => {
            abort_links();
            gate.enter(StageState::Stopped);
        }
        Err(e) => {
            tracing::warn!(tag = %ctx.tag(), error = %e, "stage failed");
            gate.events.post(EventKind::Error(StageFault {
                code: e.code(),
                message: e.to_string(),
            }));
            abort_links();
            gate.enter(StageState::Error);
        }
    }
    element
}
