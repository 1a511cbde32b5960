//! Player controller: one pipeline per `play()`, commands serialized.
//!
//! Command methods take the command lock for their whole duration. A new
//! `play()` pre-empts the running session and releases its audio output
//! before the next session leases it. Stage events are consumed on a
//! per-session thread and folded into the [`PlayerState`]; notifications go
//! out through the [`Notifier`] dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use stream_player_types::{
    ErrorCode, PlaybackStatus, PlayerInfo, PlayerState, TerminationMode,
};

use crate::board::{AudioBoard, OutputLease};
use crate::codec::{CodecFactory, SymphoniaFactory};
use crate::config::PlayerConfig;
use crate::elements::{DecoderElement, ReaderElement, WriterElement};
use crate::error::{BoardError, PlayerError};
use crate::event::{EventBus, EventKind, Listen, StageEvent};
use crate::notify::{Callback, Notifier};
use crate::pipeline::{Pipeline, PipelineHandle, WaitStatus};
use crate::source::{DefaultOpener, SourceOpener};
use crate::stage::{Stage, StageConfig, StageRole, StageState};
use crate::status::SessionCounters;

const READER_TAG: &str = "http";
const DECODER_TAG: &str = "mp3";
const WRITER_TAG: &str = "i2s";

const INPUTS: &str = "http|https|file";

/// Slice used by the event consumer while waiting on the bus.
const LISTEN_SLICE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Tracked {
    state: PlayerState,
    /// Session whose events may still change `state`.
    session: u64,
    counters: Option<Arc<SessionCounters>>,
    error_detail: Option<String>,
}

struct Inner {
    tracked: Mutex<Tracked>,
    settled: Condvar,
    notifier: Notifier,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` if `id` is still the current session; notify on change.
    fn update(&self, id: u64, f: impl FnOnce(&mut Tracked) -> bool) -> bool {
        let mut g = self.lock();
        if g.session != id {
            return false;
        }
        let changed = f(&mut g);
        if changed {
            tracing::debug!(session = id, state = ?g.state, "player state");
            self.notifier.post(g.state.clone());
        }
        drop(g);
        self.settled.notify_all();
        changed
    }

    /// Move an active session to `Stopped`.
    fn settle_stopped(&self, id: u64) {
        self.update(id, |t| {
            if !t.state.status.is_active() {
                return false;
            }
            t.state.status = PlaybackStatus::Stopped;
            true
        });
    }

    fn on_event(&self, session: &SessionLink, event: StageEvent) {
        let id = session.id;
        match event.kind {
            EventKind::Error(fault) => {
                tracing::warn!(
                    session = id,
                    stage = %event.source,
                    code = ?fault.code,
                    "{}",
                    fault.message
                );
                self.update(id, |t| {
                    if let Some(counters) = &t.counters {
                        counters.mark_failed();
                    }
                    if t.state.status == PlaybackStatus::Error {
                        return false;
                    }
                    t.state.status = PlaybackStatus::Error;
                    t.state.error_code = fault.code;
                    t.error_detail = Some(fault.message);
                    true
                });
                session.handle.stop_now();
            }
            EventKind::StateChanged(state) if event.role == StageRole::Writer => {
                let next = match state {
                    StageState::Finished if session.stop_requested.load(Ordering::Acquire) => {
                        PlaybackStatus::Stopped
                    }
                    StageState::Finished => PlaybackStatus::Finished,
                    StageState::Stopped => PlaybackStatus::Stopped,
                    _ => return,
                };
                self.update(id, |t| {
                    if !t.state.status.is_active() {
                        return false;
                    }
                    t.state.status = next;
                    true
                });
            }
            EventKind::StateChanged(_) => {}
            EventKind::TrackChanged { index, uri } => {
                tracing::info!(session = id, index, %uri, "track changed");
                self.update(id, |t| {
                    if t.state.media_source.as_deref() == Some(uri.as_str()) {
                        return false;
                    }
                    t.state.media_source = Some(uri);
                    true
                });
            }
            EventKind::MusicInfo(info) => {
                tracing::info!(
                    session = id,
                    sample_rate = info.sample_rate,
                    bits = info.bits,
                    channels = info.channels,
                    source = info.source.as_deref().unwrap_or(""),
                    "music info"
                );
            }
        }
    }
}

/// What the event consumer needs to know about its session.
#[derive(Clone)]
struct SessionLink {
    id: u64,
    handle: PipelineHandle,
    stop_requested: Arc<AtomicBool>,
}

/// One `play()`: its pipeline, bus and event consumer.
struct Session {
    link: SessionLink,
    pipeline: Pipeline,
    bus: EventBus,
    halt: Arc<AtomicBool>,
    consumer: Option<JoinHandle<()>>,
}

impl Session {
    fn id(&self) -> u64 {
        self.link.id
    }

    /// Tear the pipeline down, then drain and close the bus.
    fn close(self, timeout: Duration) -> WaitStatus {
        let Session {
            link,
            pipeline,
            bus,
            consumer,
            ..
        } = self;
        let wait = pipeline.teardown(timeout);
        bus.close();
        if let Some(consumer) = consumer {
            if consumer.join().is_err() {
                tracing::error!(session = link.id, "event consumer panicked");
            }
        }
        if let Err(e) = bus.destroy() {
            tracing::warn!(session = link.id, error = %e, "event bus still attached");
        }
        wait
    }
}

pub struct Player {
    config: PlayerConfig,
    board: Arc<AudioBoard>,
    opener: Arc<dyn SourceOpener>,
    codecs: Arc<dyn CodecFactory>,
    command: Mutex<Option<Session>>,
    inner: Arc<Inner>,
}

impl Player {
    /// Player reading http(s)/file sources and decoding with symphonia.
    pub fn new(config: PlayerConfig, board: Arc<AudioBoard>) -> Result<Self, PlayerError> {
        let opener = Arc::new(DefaultOpener::new(
            config.reader.connect_timeout,
            config.reader.response_timeout,
        ));
        Self::with_collaborators(config, board, opener, Arc::new(SymphoniaFactory))
    }

    pub fn with_collaborators(
        config: PlayerConfig,
        board: Arc<AudioBoard>,
        opener: Arc<dyn SourceOpener>,
        codecs: Arc<dyn CodecFactory>,
    ) -> Result<Self, PlayerError> {
        let notifier = Notifier::start()
            .map_err(|e| PlayerError::Resource(format!("spawn notifier: {e}")))?;
        board
            .volume()
            .set(config.initial_volume.min(100))
            .map_err(|e| PlayerError::InvalidParameter(e.to_string()))?;
        tracing::info!(output = %board.describe(), volume = config.initial_volume, "player created");
        Ok(Self {
            config,
            board,
            opener,
            codecs,
            command: Mutex::new(None),
            inner: Arc::new(Inner {
                tracked: Mutex::new(Tracked::default()),
                settled: Condvar::new(),
                notifier,
            }),
        })
    }

    fn command_lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.command.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start playing `uri` from byte offset `pos`, pre-empting any session.
    ///
    /// With `sync` set, returns once the new session has ended; a failed
    /// session is reported as the error.
    pub fn play(&self, uri: &str, pos: u64, sync: bool) -> Result<(), PlayerError> {
        if uri.trim().is_empty() {
            return Err(PlayerError::InvalidParameter("empty uri".to_string()));
        }
        let mut guard = self.command_lock();
        if let Some(old) = guard.take() {
            self.preempt(old);
        }

        let counters = Arc::new(SessionCounters::new());
        let id = {
            let mut g = self.inner.lock();
            g.session += 1;
            g.state.error_code = ErrorCode::NoError;
            g.state.media_source = Some(uri.to_string());
            g.counters = Some(counters.clone());
            g.error_detail = None;
            g.session
        };
        tracing::info!(session = id, %uri, pos, "play");

        let session = match self.start_session(id, uri, pos, counters) {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(session = id, error = %e, "play failed");
                let code = e.code();
                self.inner.update(id, |t| {
                    t.state.status = PlaybackStatus::Error;
                    t.state.error_code = code;
                    true
                });
                return Err(e);
            }
        };
        *guard = Some(session);
        drop(guard);

        if sync { self.wait_session(id) } else { Ok(()) }
    }

    /// Stop `old` now and wait (bounded) for it to release the output.
    fn preempt(&self, old: Session) {
        let id = old.id();
        old.link.stop_requested.store(true, Ordering::Release);
        old.pipeline.stop_now();
        let deadline = Instant::now() + self.config.preempt_budget();
        let mut attempt = 0u32;
        let settled = loop {
            if old.link.handle.wait_for_stop(self.config.stop_poll_interval) == WaitStatus::AllStopped {
                break true;
            }
            attempt += 1;
            if Instant::now() >= deadline {
                break false;
            }
            tracing::debug!(session = id, attempt, "waiting for previous session");
        };
        if !settled {
            tracing::warn!(session = id, "previous session did not stop in time; terminating");
        }
        old.close(Duration::ZERO);
        self.inner.settle_stopped(id);
    }

    fn start_session(
        &self,
        id: u64,
        uri: &str,
        pos: u64,
        counters: Arc<SessionCounters>,
    ) -> Result<Session, PlayerError> {
        let lease = self.acquire_output()?;
        let pc = &self.config.pipeline;
        let stage_config = |out_buffer_bytes: usize, core: usize| StageConfig {
            out_buffer_bytes,
            io_timeout: pc.io_timeout,
            core: Some(core),
        };

        let reader = ReaderElement::new(
            self.opener.clone(),
            uri,
            pos,
            self.config.reader.clone(),
            counters.clone(),
        );
        let halt = reader.halt_handle();

        let mut pipeline = Pipeline::new();
        pipeline.register(Stage::configure(
            READER_TAG,
            stage_config(pc.stream_buffer_bytes, 0),
            Box::new(reader),
        ))?;
        pipeline.register(Stage::configure(
            DECODER_TAG,
            stage_config(pc.pcm_buffer_bytes, 1),
            Box::new(DecoderElement::new(self.codecs.clone())),
        ))?;
        pipeline.register(Stage::configure(
            WRITER_TAG,
            stage_config(0, 1),
            Box::new(WriterElement::new(Box::new(lease), counters)),
        ))?;
        pipeline.link(&[READER_TAG, DECODER_TAG, WRITER_TAG])?;

        let bus = EventBus::new(pc.event_capacity, pc.critical_post_wait);
        pipeline.set_listener(&bus)?;
        let link = SessionLink {
            id,
            handle: pipeline.handle(),
            stop_requested: Arc::new(AtomicBool::new(false)),
        };
        pipeline.run()?;
        self.inner.update(id, |t| {
            t.state.status = PlaybackStatus::Running;
            true
        });

        let consumer = {
            let inner = self.inner.clone();
            let bus = bus.clone();
            let link = link.clone();
            thread::Builder::new()
                .name("player-events".to_string())
                .spawn(move || consume_events(&inner, &bus, &link))
        };
        let mut session = Session {
            link,
            pipeline,
            bus,
            halt,
            consumer: None,
        };
        match consumer {
            Ok(handle) => {
                session.consumer = Some(handle);
                Ok(session)
            }
            Err(e) => {
                session.pipeline.stop_now();
                session.close(Duration::ZERO);
                Err(PlayerError::Resource(format!("spawn event consumer: {e}")))
            }
        }
    }

    /// Lease the output, retrying while a released session lets go of it.
    fn acquire_output(&self) -> Result<OutputLease, PlayerError> {
        let mut attempt = 0;
        loop {
            match self.board.acquire() {
                Ok(lease) => return Ok(lease),
                Err(BoardError::Busy) if attempt < self.config.board_acquire_retries => {
                    attempt += 1;
                    thread::sleep(self.config.stop_poll_interval);
                }
                Err(BoardError::Busy) => {
                    return Err(PlayerError::ConcurrencyMisuse(
                        "audio output is still leased".to_string(),
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Block until session `id` ends, then release it if still current.
    fn wait_session(&self, id: u64) -> Result<(), PlayerError> {
        let (status, code, detail) = {
            let mut g = self.inner.lock();
            while g.session == id && !g.state.status.is_terminal() {
                g = self
                    .inner
                    .settled
                    .wait(g)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if g.session != id {
                // Pre-empted by another play().
                return Ok(());
            }
            (g.state.status, g.state.error_code, g.error_detail.clone())
        };

        let mut guard = self.command_lock();
        if guard.as_ref().is_some_and(|s| s.id() == id) {
            if let Some(session) = guard.take() {
                session.close(self.config.stop_timeout);
            }
        }
        drop(guard);

        if status == PlaybackStatus::Error {
            return Err(PlayerError::from_session(
                code,
                detail.unwrap_or_else(|| "playback failed".to_string()),
            ));
        }
        Ok(())
    }

    /// Stop the current session. `Now` discards buffered audio, `Graceful`
    /// plays it out first. Stopping an idle player succeeds.
    pub fn stop(&self, mode: TerminationMode) -> Result<(), PlayerError> {
        let mut guard = self.command_lock();
        let Some(session) = guard.as_ref() else {
            return Ok(());
        };
        let id = session.id();
        tracing::info!(session = id, ?mode, "stop");
        session.link.stop_requested.store(true, Ordering::Release);
        match mode {
            TerminationMode::Now => session.pipeline.stop_now(),
            TerminationMode::Graceful => {
                session.halt.store(true, Ordering::Release);
                session.pipeline.stop()?;
            }
        }
        if let WaitStatus::TimedOut { active } =
            session.link.handle.wait_for_stop(self.config.stop_timeout)
        {
            tracing::warn!(session = id, active, "stop timed out");
            return Err(PlayerError::Timeout { active });
        }
        if let Some(session) = guard.take() {
            session.close(self.config.stop_timeout);
        }
        self.inner.settle_stopped(id);
        Ok(())
    }

    pub fn pause(&self) -> Result<(), PlayerError> {
        self.switch(PlaybackStatus::Running, PlaybackStatus::Paused)
    }

    pub fn resume(&self) -> Result<(), PlayerError> {
        self.switch(PlaybackStatus::Paused, PlaybackStatus::Running)
    }

    fn switch(&self, from: PlaybackStatus, to: PlaybackStatus) -> Result<(), PlayerError> {
        let guard = self.command_lock();
        let status = self.inner.lock().state.status;
        let session = match guard.as_ref() {
            Some(session) if status == from => session,
            _ => return Err(PlayerError::InvalidState(status)),
        };
        match to {
            PlaybackStatus::Paused => session.pipeline.pause()?,
            _ => session.pipeline.resume()?,
        }
        tracing::info!(session = session.id(), status = ?to, "playback switched");
        self.inner.update(session.id(), |t| {
            if t.state.status != from {
                return false;
            }
            t.state.status = to;
            true
        });
        Ok(())
    }

    /// Set the master volume. Values outside 0..=100 are rejected, not clamped.
    pub fn set_volume(&self, volume: i32) -> Result<(), PlayerError> {
        let level = u8::try_from(volume)
            .ok()
            .filter(|v| *v <= 100)
            .ok_or_else(|| PlayerError::InvalidParameter(format!("volume {volume} not in 0..=100")))?;
        self.board
            .volume()
            .set(level)
            .map_err(|e| PlayerError::InvalidParameter(e.to_string()))?;
        tracing::debug!(volume = level, "volume set");
        Ok(())
    }

    pub fn get_volume(&self) -> u8 {
        self.board.volume().get()
    }

    pub fn get_state(&self) -> PlayerState {
        self.inner.lock().state.clone()
    }

    /// Bytes consumed from the current resource.
    pub fn get_position(&self) -> Option<u64> {
        self.inner.lock().counters.as_ref().and_then(|c| c.position())
    }

    /// Milliseconds of audio handed to the output.
    pub fn get_elapsed_time(&self) -> Option<u64> {
        self.inner.lock().counters.as_ref().and_then(|c| c.elapsed_ms())
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            input: INPUTS.to_string(),
            codec: self.codecs.formats().to_string(),
        }
    }

    /// Called on the notification thread after every state change.
    pub fn set_callback(&self, callback: Option<Callback>) {
        self.inner.notifier.set_callback(callback);
    }

    /// Channel receiving a copy of every state notification.
    pub fn subscribe(&self) -> Receiver<PlayerState> {
        self.inner.notifier.subscribe()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let session = self
            .command
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.link.stop_requested.store(true, Ordering::Release);
            session.pipeline.stop_now();
            let id = session.id();
            session.close(self.config.stop_timeout);
            self.inner.settle_stopped(id);
        }
    }
}

fn consume_events(inner: &Inner, bus: &EventBus, link: &SessionLink) {
    loop {
        match bus.listen(LISTEN_SLICE) {
            Listen::Event(event) => inner.on_event(link, event),
            Listen::Timeout => {}
            Listen::Closed => break,
        }
    }
    tracing::debug!(session = link.id, dropped = bus.dropped(), "event consumer done");
}
