//! Playback coordinator: decoding sessions, gapless hand-over and crossfades.
//!
//! Each file plays in a session that owns a decoder and one stream. The
//! coordinator feeds every live session from [`PlaybackCoordinator::tick`],
//! prepares the next item ahead of time and starts it so the two streams
//! overlap by the configured crossfade (or meet exactly when it is zero).
//!
//! [`CoordinatorHandle`] runs the same coordinator on a worker thread driven
//! by commands, the way the player binary uses it.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use crate::decode::Decoder;
use crate::engine::OutputEngine;
use crate::stream::{AudioStream, StreamOptions};
use cadence_core::{Error, Result};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Fade used for pause, resume and stop.
pub const SOFT_FADE: Duration = Duration::from_millis(80);

/// Upper bound on decoder blocks pushed into one stream per tick.
const MAX_BLOCKS_PER_TICK: usize = 64;

/// Opens a decoder for a queued path.
pub type DecoderFactory = Box<dyn FnMut(&Path) -> Result<Box<dyn Decoder>> + Send>;

/// Supplies the item after the current one.
pub trait QueueProvider: Send {
    fn next_item(&mut self) -> Option<PathBuf>;
}

impl QueueProvider for VecDeque<PathBuf> {
    fn next_item(&mut self) -> Option<PathBuf> {
        self.pop_front()
    }
}

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Decoder open, waiting for its turn.
    Queued,
    /// Pre-buffering into a paused stream.
    Preparing,
    /// Audible.
    Playing,
    /// Decoder exhausted, stream draining.
    Finishing,
    Closed,
}

/// Overall player state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Events emitted by the coordinator.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    StateChanged(PlayerState),
    TrackStarted { id: Uuid, path: PathBuf },
    TrackFinished { id: Uuid, path: PathBuf },
    /// The queue had nothing to follow the current item.
    QueueExhausted,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Overlap between consecutive items; zero plays them back to back.
    pub crossfade: Duration,
    /// Options for every session stream. `paused` is ignored.
    pub stream_options: StreamOptions,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            crossfade: Duration::ZERO,
            stream_options: StreamOptions::default(),
        }
    }
}

/// Snapshot of a session for callers.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub path: PathBuf,
    pub state: SessionState,
    pub frames_sent: u64,
    pub total_frames: Option<u64>,
}

struct Session {
    id: Uuid,
    path: PathBuf,
    state: SessionState,
    decoder: Box<dyn Decoder>,
    stream: Arc<AudioStream>,
    sample_rate: u32,
    frame_size: usize,
    total_frames: Option<u64>,
    /// Overlap with the neighbouring items, at most half the item's length.
    crossfade: Duration,
    /// Input frames accepted by the stream, counted from the start of the file.
    frames_sent: u64,
    prepare_at_frame: Option<u64>,
    play_next_at_frame: Option<u64>,
    prepare_triggered: bool,
    play_next_triggered: bool,
    fade_out_triggered: bool,
    eof: bool,
    stopping: bool,
    /// Block the stream refused last time.
    pending: Vec<u8>,
}

impl Session {
    fn frames_for(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * f64::from(self.sample_rate)).round() as u64
    }

    fn crossfade_frames(&self) -> u64 {
        self.frames_for(self.crossfade)
    }

    fn clamp_crossfade(&mut self, length: u64, crossfade: Duration) {
        let half = length as f64 / 2.0 / f64::from(self.sample_rate.max(1));
        self.crossfade = crossfade.min(Duration::from_secs_f64(half));
    }

    fn set_thresholds(&mut self, total: u64, crossfade: Duration) {
        self.clamp_crossfade(total, crossfade);
        let at = total.saturating_sub(self.crossfade_frames());
        self.prepare_at_frame = Some(at);
        self.play_next_at_frame = Some(at);
    }

    /// Frames that have left the stream towards the mixer.
    fn mixed_frames(&self) -> u64 {
        let buffered = (self.stream.cache_time() * f64::from(self.sample_rate)).round() as u64;
        self.frames_sent.saturating_sub(buffered)
    }

    const fn is_audible(&self) -> bool {
        matches!(self.state, SessionState::Playing | SessionState::Finishing)
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            path: self.path.clone(),
            state: self.state,
            frames_sent: self.frames_sent,
            total_frames: self.total_frames,
        }
    }

    fn on_eof(&mut self, crossfade: Duration) {
        self.eof = true;
        let end = self.frames_sent;
        self.clamp_crossfade(end, crossfade);
        let at = end.saturating_sub(self.crossfade_frames());
        self.prepare_at_frame = Some(self.prepare_at_frame.map_or(at, |p| p.min(at)));
        self.play_next_at_frame = Some(self.play_next_at_frame.map_or(at, |p| p.min(at)));
        debug!("Decoder finished after {end} frames: {}", self.path.display());
    }

    /// Push decoded audio until the stream pushes back.
    fn feed(&mut self, crossfade: Duration, events: &Sender<CoordinatorEvent>) {
        let frame_size = self.frame_size;
        for _ in 0..MAX_BLOCKS_PER_TICK {
            if !self.pending.is_empty() {
                if self.stream.add_data(&self.pending) == 0 {
                    return;
                }
                self.frames_sent += (self.pending.len() / frame_size) as u64;
                self.pending.clear();
                continue;
            }
            if self.eof {
                return;
            }

            match self.decoder.decode() {
                Ok(Some(block)) => {
                    if block.len() < frame_size {
                        continue;
                    }
                    if self.stream.add_data(block) == 0 {
                        self.pending.extend_from_slice(block);
                        return;
                    }
                    self.frames_sent += (block.len() / frame_size) as u64;
                }
                Ok(None) => self.on_eof(crossfade),
                Err(e) => {
                    error!("Decode error in {}: {e}", self.path.display());
                    let _ = events.send(CoordinatorEvent::Error(e.to_string()));
                    self.on_eof(crossfade);
                }
            }
        }
    }
}

/// Runs sessions against an [`OutputEngine`].
pub struct PlaybackCoordinator {
    engine: Arc<OutputEngine>,
    config: CoordinatorConfig,
    open_decoder: DecoderFactory,
    queue: Option<Box<dyn QueueProvider>>,
    sessions: Vec<Session>,
    event_tx: Sender<CoordinatorEvent>,
    event_rx: Receiver<CoordinatorEvent>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    volume: f32,
    paused: bool,
    pause_pending: bool,
    state: PlayerState,
}

impl PlaybackCoordinator {
    pub fn new(
        engine: Arc<OutputEngine>,
        config: CoordinatorConfig,
        open_decoder: DecoderFactory,
    ) -> Self {
        let (event_tx, event_rx) = unbounded();
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            engine,
            config,
            open_decoder,
            queue: None,
            sessions: Vec::new(),
            event_tx,
            event_rx,
            wake_tx,
            wake_rx,
            volume: 1.0,
            paused: false,
            pause_pending: false,
            state: PlayerState::Stopped,
        }
    }

    /// Source for the next item once the current one nears its end.
    pub fn set_queue(&mut self, queue: Box<dyn QueueProvider>) {
        self.queue = Some(queue);
    }

    pub fn events(&self) -> Receiver<CoordinatorEvent> {
        self.event_rx.clone()
    }

    /// Signalled by streams that want more data.
    pub fn wake_receiver(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.event_tx.send(event);
    }

    fn open_session(&mut self, path: &Path) -> Result<Session> {
        let decoder = (self.open_decoder)(path)?;
        let format = decoder.format();
        let options = StreamOptions {
            paused: true,
            ..self.config.stream_options
        };
        let stream = self.engine.make_stream(format.clone(), options)?;
        stream.set_volume(self.volume);
        if let Some(gain) = decoder.replay_gain() {
            stream.set_replay_gain(gain);
        }

        let wake = self.wake_tx.clone();
        stream.set_data_callback(Box::new(move |_, _| {
            let _ = wake.try_send(());
        }));
        let wake = self.wake_tx.clone();
        stream.set_drain_callback(Box::new(move |_| {
            let _ = wake.try_send(());
        }));

        let mut session = Session {
            id: Uuid::new_v4(),
            path: path.to_path_buf(),
            state: SessionState::Queued,
            total_frames: decoder.total_frames(),
            crossfade: self.config.crossfade,
            decoder,
            frame_size: stream.input_frame_size(),
            stream,
            sample_rate: format.sample_rate,
            frames_sent: 0,
            prepare_at_frame: None,
            play_next_at_frame: None,
            prepare_triggered: false,
            play_next_triggered: false,
            fade_out_triggered: false,
            eof: false,
            stopping: false,
            pending: Vec::new(),
        };
        if let Some(total) = session.total_frames {
            session.set_thresholds(total, self.config.crossfade);
        }
        debug!(
            "Session {} opened: {} ({})",
            session.id,
            path.display(),
            format
        );
        Ok(session)
    }

    /// Stop everything and play `path`.
    pub fn open_file(&mut self, path: &Path) -> Result<Uuid> {
        self.close_all_streams(false);
        if self.paused {
            self.resume();
        }
        self.queue_next_file(path)
    }

    /// Queue `path`; it starts at once when nothing is playing.
    pub fn queue_next_file(&mut self, path: &Path) -> Result<Uuid> {
        let session = self.open_session(path)?;
        let id = session.id;
        self.sessions.push(session);

        if !self.sessions.iter().any(Session::is_audible) {
            let index = self.sessions.len() - 1;
            self.start_session(index, Duration::ZERO);
        }
        self.update_state();
        Ok(id)
    }

    fn start_session(&mut self, index: usize, fade_in: Duration) {
        let paused = self.paused;
        let session = &mut self.sessions[index];
        session.state = SessionState::Playing;
        if !fade_in.is_zero() {
            session.stream.fade_volume(0.0, 1.0, fade_in);
        }
        if !paused {
            session.stream.resume();
        }
        info!("Playing {}", session.path.display());
        let event = CoordinatorEvent::TrackStarted {
            id: session.id,
            path: session.path.clone(),
        };
        self.emit(event);
    }

    /// Get the item after the current one ready, once.
    fn prepare_next(&mut self) {
        if let Some(queued) = self
            .sessions
            .iter_mut()
            .find(|s| s.state == SessionState::Queued)
        {
            queued.state = SessionState::Preparing;
            return;
        }
        if self
            .sessions
            .iter()
            .any(|s| s.state == SessionState::Preparing)
        {
            return;
        }

        loop {
            let Some(path) = self.queue.as_mut().and_then(|q| q.next_item()) else {
                debug!("Queue exhausted");
                self.emit(CoordinatorEvent::QueueExhausted);
                return;
            };
            match self.open_session(&path) {
                Ok(mut session) => {
                    session.state = SessionState::Preparing;
                    self.sessions.push(session);
                    return;
                }
                Err(e) => {
                    warn!("Skipping {}: {e}", path.display());
                    self.emit(CoordinatorEvent::Error(format!(
                        "{}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }

    fn next_waiting(&self) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| {
                !s.stopping && matches!(s.state, SessionState::Queued | SessionState::Preparing)
            })
    }

    /// Fire the prepare and play-next points of an audible session.
    ///
    /// Play-next waits while another session is still fading out, so no more
    /// than two sessions overlap. The hand-over uses the shorter crossfade of
    /// the two items and starts that far from the end of the current one.
    fn check_triggers(&mut self, index: usize) {
        let overlapping = self
            .sessions
            .iter()
            .enumerate()
            .any(|(i, s)| i != index && s.is_audible() && s.fade_out_triggered);
        let session = &mut self.sessions[index];

        let prepare = !session.prepare_triggered
            && session
                .prepare_at_frame
                .is_some_and(|at| session.frames_sent >= at);
        if prepare {
            session.prepare_triggered = true;
        }
        let mixed = session.mixed_frames();
        let due = !session.play_next_triggered
            && !overlapping
            && session.play_next_at_frame.is_some_and(|at| mixed >= at);

        if prepare {
            debug!("Preparing next item at frame {}", self.sessions[index].frames_sent);
            self.prepare_next();
        }
        if !due {
            return;
        }
        let Some(next) = self.next_waiting() else {
            self.sessions[index].play_next_triggered = true;
            return;
        };

        let session = &self.sessions[index];
        let fade = session.crossfade.min(self.sessions[next].crossfade);
        let lead = session
            .crossfade_frames()
            .saturating_sub(session.frames_for(fade));
        if session
            .play_next_at_frame
            .is_some_and(|at| mixed < at.saturating_add(lead))
        {
            return;
        }

        self.sessions[index].play_next_triggered = true;
        self.start_session(next, fade);

        let session = &mut self.sessions[index];
        if !fade.is_zero() && !session.fade_out_triggered {
            let level = session.stream.fade_level();
            session.stream.fade_volume(level, 0.0, fade);
            session.fade_out_triggered = true;
        }
    }

    /// One scheduling step: feed, trigger, drain and retire sessions.
    pub fn tick(&mut self) {
        let crossfade = self.config.crossfade;
        let events = &self.event_tx;
        for session in &mut self.sessions {
            if matches!(
                session.state,
                SessionState::Preparing | SessionState::Playing
            ) && !session.stopping
            {
                session.feed(crossfade, events);
            }
        }

        for index in 0..self.sessions.len() {
            if self.sessions[index].is_audible() && !self.sessions[index].stopping {
                self.check_triggers(index);
            }
        }

        for session in &mut self.sessions {
            if session.state == SessionState::Playing && session.eof && session.pending.is_empty()
            {
                session.stream.drain();
                session.state = SessionState::Finishing;
            }
        }

        if self.pause_pending
            && self
                .sessions
                .iter()
                .filter(|s| s.is_audible())
                .all(|s| !s.stream.is_fading())
        {
            for session in self.sessions.iter().filter(|s| s.is_audible()) {
                session.stream.pause();
            }
            self.engine.cork(true);
            self.pause_pending = false;
        }

        self.close_finished();

        // Items queued after the hand-over point start once the last one ends.
        if !self.sessions.iter().any(Session::is_audible) {
            if let Some(next) = self.next_waiting() {
                self.start_session(next, Duration::ZERO);
            }
        }
        self.update_state();
    }

    fn close_finished(&mut self) {
        let mut index = 0;
        while index < self.sessions.len() {
            let session = &self.sessions[index];
            let stream = &session.stream;
            let finished = session.state == SessionState::Finishing
                && (stream.is_destroyed() || (stream.is_drained() && !stream.is_busy()));
            let stopped = session.stopping && (!stream.is_fading() || stream.is_paused());
            let lost = !finished && !session.stopping && stream.is_destroyed();

            if finished || stopped || lost {
                let session = self.sessions.remove(index);
                if lost {
                    self.emit(CoordinatorEvent::Error(format!(
                        "Stream lost for {}",
                        session.path.display()
                    )));
                }
                self.close_session(session, finished);
            } else {
                index += 1;
            }
        }
    }

    fn close_session(&self, mut session: Session, finished: bool) {
        session.stream.disable_callbacks(true);
        self.engine.free_stream(&session.stream);
        session.state = SessionState::Closed;
        debug!("Session {} {:?}", session.id, session.state);
        if finished {
            self.emit(CoordinatorEvent::TrackFinished {
                id: session.id,
                path: session.path,
            });
        }
    }

    fn update_state(&mut self) {
        let state = if self.sessions.iter().any(Session::is_audible) {
            if self.paused {
                PlayerState::Paused
            } else {
                PlayerState::Playing
            }
        } else {
            PlayerState::Stopped
        };
        if state != self.state {
            debug!("State changed: {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(CoordinatorEvent::StateChanged(state));
        }
    }

    /// Fade out and suspend output.
    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.pause_pending = true;
        for session in self.sessions.iter().filter(|s| s.is_audible()) {
            let level = session.stream.fade_level();
            session.stream.fade_volume(level, 0.0, SOFT_FADE);
        }
        self.update_state();
    }

    /// Resume output and fade back in.
    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        self.pause_pending = false;
        self.engine.cork(false);
        for session in self.sessions.iter().filter(|s| s.is_audible()) {
            if session.fade_out_triggered {
                session.stream.fade_volume(0.0, 0.0, Duration::ZERO);
            } else {
                session.stream.fade_volume(0.0, 1.0, SOFT_FADE);
            }
            session.stream.resume();
        }
        self.update_state();
    }

    fn current_index(&self) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.is_audible() && !s.play_next_triggered && !s.stopping)
            .or_else(|| self.sessions.iter().position(Session::is_audible))
    }

    /// Jump within the current item.
    pub fn seek_time(&mut self, time_ms: u64) -> Result<()> {
        let crossfade = self.config.crossfade;
        let index = self
            .current_index()
            .ok_or_else(|| Error::InvalidArgument("Nothing is playing".to_string()))?;
        let session = &mut self.sessions[index];
        if session.state != SessionState::Playing {
            return Err(Error::InvalidArgument(
                "Cannot seek a finishing item".to_string(),
            ));
        }

        let frame = time_ms * u64::from(session.sample_rate) / 1000;
        let reached = session.decoder.seek(frame)?;
        session.stream.flush();
        session.pending.clear();
        session.frames_sent = reached;
        session.eof = false;
        if let Some(total) = session.total_frames {
            session.set_thresholds(total, crossfade);
        } else {
            session.prepare_at_frame = None;
            session.play_next_at_frame = None;
        }
        if !session.play_next_at_frame.is_some_and(|at| reached >= at) {
            session.play_next_triggered = false;
        }
        info!("Seeked to {time_ms} ms (frame {reached})");
        Ok(())
    }

    /// Playback position of the current item.
    pub fn time_ms(&self) -> u64 {
        let Some(session) = self.current_index().map(|i| &self.sessions[i]) else {
            return 0;
        };
        let sent = session.frames_sent as f64 / f64::from(session.sample_rate.max(1));
        let played = (sent - self.engine.stream_delay(&session.stream)).max(0.0);
        (played * 1000.0).round() as u64
    }

    pub fn total_time_ms(&self) -> u64 {
        self.current_index()
            .map(|i| &self.sessions[i])
            .and_then(|s| {
                s.total_frames
                    .map(|total| total * 1000 / u64::from(s.sample_rate.max(1)))
            })
            .unwrap_or(0)
    }

    /// Position as a percentage of the length, 0 when the length is unknown.
    pub fn percentage(&self) -> f32 {
        let total = self.total_time_ms();
        if total == 0 {
            return 0.0;
        }
        (self.time_ms() as f32 / total as f32 * 100.0).min(100.0)
    }

    /// Volume for every session stream.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        for session in &self.sessions {
            session.stream.set_volume(self.volume);
        }
    }

    pub const fn volume(&self) -> f32 {
        self.volume
    }

    /// Drop the current item and start the next one.
    pub fn skip_next(&mut self) -> Result<()> {
        let Some(index) = self.current_index() else {
            return Err(Error::InvalidArgument("Nothing is playing".to_string()));
        };
        let current = self.sessions.remove(index);
        self.close_session(current, false);

        if self.next_waiting().is_none() {
            self.prepare_next();
        }
        if let Some(next) = self.next_waiting() {
            self.start_session(next, Duration::ZERO);
        }
        self.update_state();
        Ok(())
    }

    /// Stop the current item.
    pub fn close_file(&mut self) {
        self.close_all_streams(false);
    }

    /// End every session, after a short fade when `fade` is set.
    pub fn close_all_streams(&mut self, fade: bool) {
        if fade {
            for session in &mut self.sessions {
                if session.is_audible() && !session.stream.is_paused() {
                    let level = session.stream.fade_level();
                    session.stream.fade_volume(level, 0.0, SOFT_FADE);
                }
                session.stopping = true;
            }
            return;
        }

        for session in std::mem::take(&mut self.sessions) {
            self.close_session(session, false);
        }
        self.update_state();
    }

    pub fn is_playing(&self) -> bool {
        self.sessions.iter().any(Session::is_audible)
    }

    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    pub const fn state(&self) -> PlayerState {
        self.state
    }

    /// Fill level of the current stream, 0.0 to 1.0.
    pub fn cache_level(&self) -> f64 {
        self.current_index()
            .map(|i| &self.sessions[i].stream)
            .map_or(0.0, |stream| {
                let total = stream.cache_total();
                if total > 0.0 {
                    stream.cache_time() / total
                } else {
                    0.0
                }
            })
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(Session::info).collect()
    }

    pub fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            state: self.state,
            time_ms: self.time_ms(),
            total_time_ms: self.total_time_ms(),
            cache_level: self.cache_level(),
            volume: self.volume,
            current: self.current_index().map(|i| self.sessions[i].info()),
        }
    }

    fn handle(&mut self, command: CoordinatorCommand) {
        let result = match command {
            CoordinatorCommand::OpenFile(path) => self.open_file(&path).map(|_| ()),
            CoordinatorCommand::QueueNext(path) => self.queue_next_file(&path).map(|_| ()),
            CoordinatorCommand::Pause => {
                self.pause();
                Ok(())
            }
            CoordinatorCommand::Resume => {
                self.resume();
                Ok(())
            }
            CoordinatorCommand::Seek(time_ms) => self.seek_time(time_ms),
            CoordinatorCommand::SetVolume(volume) => {
                self.set_volume(volume);
                Ok(())
            }
            CoordinatorCommand::SkipNext => self.skip_next(),
            CoordinatorCommand::CloseFile => {
                self.close_file();
                Ok(())
            }
            CoordinatorCommand::CloseAll(fade) => {
                self.close_all_streams(fade);
                Ok(())
            }
            CoordinatorCommand::Shutdown => Ok(()),
        };
        if let Err(e) = result {
            warn!("Command failed: {e}");
            self.emit(CoordinatorEvent::Error(e.to_string()));
        }
    }
}

impl Drop for PlaybackCoordinator {
    fn drop(&mut self) {
        for session in std::mem::take(&mut self.sessions) {
            self.close_session(session, false);
        }
    }
}

/// Published by the worker after every tick.
#[derive(Debug, Clone, Default)]
pub struct PlaybackStatus {
    pub state: PlayerState,
    pub time_ms: u64,
    pub total_time_ms: u64,
    pub cache_level: f64,
    pub volume: f32,
    pub current: Option<SessionInfo>,
}

/// Commands for the coordinator worker.
#[derive(Debug, Clone)]
pub enum CoordinatorCommand {
    OpenFile(PathBuf),
    QueueNext(PathBuf),
    Pause,
    Resume,
    /// Seek to a position in milliseconds.
    Seek(u64),
    SetVolume(f32),
    SkipNext,
    CloseFile,
    CloseAll(bool),
    Shutdown,
}

/// A coordinator running on its own thread.
pub struct CoordinatorHandle {
    command_tx: Sender<CoordinatorCommand>,
    event_rx: Receiver<CoordinatorEvent>,
    status: Arc<RwLock<PlaybackStatus>>,
    thread: Option<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Move `coordinator` onto a worker thread ticking at least every
    /// `tick_interval`.
    pub fn spawn(mut coordinator: PlaybackCoordinator, tick_interval: Duration) -> Result<Self> {
        let (command_tx, command_rx) = unbounded::<CoordinatorCommand>();
        let event_rx = coordinator.events();
        let status = Arc::new(RwLock::new(PlaybackStatus::default()));
        let shared = Arc::clone(&status);

        let thread = std::thread::Builder::new()
            .name("playback-coordinator".to_string())
            .spawn(move || {
                info!("Coordinator worker started");
                let wake = coordinator.wake_receiver();
                loop {
                    select! {
                        recv(command_rx) -> command => match command {
                            Ok(CoordinatorCommand::Shutdown) | Err(_) => break,
                            Ok(command) => coordinator.handle(command),
                        },
                        recv(wake) -> _ => {},
                        default(tick_interval) => {},
                    }
                    coordinator.tick();
                    *shared.write() = coordinator.status();
                }
                coordinator.close_all_streams(false);
                info!("Coordinator worker shutting down");
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn coordinator thread: {e}")))?;

        Ok(Self {
            command_tx,
            event_rx,
            status,
            thread: Some(thread),
        })
    }

    /// Send a command to the worker.
    pub fn send_command(&self, command: CoordinatorCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|e| Error::Internal(format!("Failed to send command: {e}")))
    }

    pub fn open_file(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.send_command(CoordinatorCommand::OpenFile(path.into()))
    }

    pub fn queue_next_file(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.send_command(CoordinatorCommand::QueueNext(path.into()))
    }

    pub fn pause(&self) -> Result<()> {
        self.send_command(CoordinatorCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send_command(CoordinatorCommand::Resume)
    }

    pub fn seek_time(&self, time_ms: u64) -> Result<()> {
        self.send_command(CoordinatorCommand::Seek(time_ms))
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.send_command(CoordinatorCommand::SetVolume(volume.clamp(0.0, 1.0)))
    }

    pub fn skip_next(&self) -> Result<()> {
        self.send_command(CoordinatorCommand::SkipNext)
    }

    pub fn close_file(&self) -> Result<()> {
        self.send_command(CoordinatorCommand::CloseFile)
    }

    pub fn close_all_streams(&self, fade: bool) -> Result<()> {
        self.send_command(CoordinatorCommand::CloseAll(fade))
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status.read().clone()
    }

    pub fn time_ms(&self) -> u64 {
        self.status.read().time_ms
    }

    pub fn total_time_ms(&self) -> u64 {
        self.status.read().total_time_ms
    }

    pub fn is_playing(&self) -> bool {
        self.status.read().state != PlayerState::Stopped
    }

    pub fn is_paused(&self) -> bool {
        self.status.read().state == PlayerState::Paused
    }

    /// Try to receive an event without blocking.
    pub fn try_recv_event(&self) -> Option<CoordinatorEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive an event, waiting at most `timeout`.
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<CoordinatorEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Stop the worker and close all sessions.
    pub fn shutdown(&mut self) {
        let _ = self.command_tx.send(CoordinatorCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Coordinator thread panicked");
            }
        }
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
