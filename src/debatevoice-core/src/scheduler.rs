//! Turn scheduling between the two sides.
//!
//! The scheduler is a state machine driven by discrete [`SchedulerEvent`]s.
//! It owns both side queues, at most one live session and the renderer,
//! and decides when a turn has ended: only once the active queue has
//! drained AND the session has delivered every chunk. Those two
//! conditions can become true in either order, so both paths check for
//! advancement.

use std::collections::VecDeque;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::audio::{AudioChunk, AudioOutput, AudioRenderer, PlaybackToken, RenderStep};
use crate::config::VoicesConfig;
use crate::session::{SessionControl, SessionEvent, SessionFactory, SessionId, SessionRequest};
use crate::side::Side;

/// Inputs to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Submit { text: String, side: Side },
    Reset,
    Session { id: SessionId, event: SessionEvent },
    PlaybackFinished(PlaybackToken),
    Shutdown,
}

pub type EventSender = UnboundedSender<SchedulerEvent>;

/// Notifications emitted by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    /// A session has been started for `side`.
    TurnStarted { side: Side },
    /// Playback is over and nothing is pending.
    TurnEnded { side: Option<Side> },
    /// The active session ended without completing.
    SessionFailed { side: Side, reason: String },
}

/// Callback for speech events.
pub type SpeechCallback = Box<dyn Fn(SpeechEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Speaking(Side),
}

/// The next utterance to speak once the current turn ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUtterance {
    pub text: String,
    pub side: Side,
}

/// One FIFO of received chunks per side.
#[derive(Debug, Default)]
pub struct SideQueues {
    positive: VecDeque<AudioChunk>,
    negative: VecDeque<AudioChunk>,
}

impl SideQueues {
    pub fn get(&self, side: Side) -> &VecDeque<AudioChunk> {
        match side {
            Side::Positive => &self.positive,
            Side::Negative => &self.negative,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut VecDeque<AudioChunk> {
        match side {
            Side::Positive => &mut self.positive,
            Side::Negative => &mut self.negative,
        }
    }

    pub fn clear(&mut self) {
        self.positive.clear();
        self.negative.clear();
    }
}

struct ActiveSession<S> {
    id: SessionId,
    side: Side,
    handle: S,
}

pub struct TurnScheduler<F: SessionFactory, O> {
    factory: F,
    renderer: AudioRenderer<O>,
    voices: VoicesConfig,
    enabled: bool,
    turn: TurnState,
    pending: Option<PendingUtterance>,
    queues: SideQueues,
    session: Option<ActiveSession<F::Session>>,
    fully_received: bool,
    next_session: u64,
    callback: Option<SpeechCallback>,
}

impl<F, O> TurnScheduler<F, O>
where
    F: SessionFactory,
    O: AudioOutput,
{
    pub fn new(factory: F, renderer: AudioRenderer<O>, voices: VoicesConfig, enabled: bool) -> Self {
        Self {
            factory,
            renderer,
            voices,
            enabled,
            turn: TurnState::Idle,
            pending: None,
            queues: SideQueues::default(),
            session: None,
            fully_received: false,
            next_session: 0,
            callback: None,
        }
    }

    /// Set a callback for speech events.
    pub fn with_callback(mut self, callback: SpeechCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Dispatch one event. `Shutdown` is handled by the owner of the loop.
    pub fn handle(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Submit { text, side } => self.submit(text, side),
            SchedulerEvent::Reset => self.reset(),
            SchedulerEvent::Session { id, event } => match event {
                SessionEvent::Chunk(chunk) => self.on_chunk_available(id, chunk),
                SessionEvent::AllChunksReceived => self.on_all_chunks_received(id),
                SessionEvent::Failed(reason) => self.on_session_failed(id, reason),
            },
            SchedulerEvent::PlaybackFinished(token) => self.on_playback_finished(token),
            SchedulerEvent::Shutdown => self.reset(),
        }
    }

    /// Speak `text` for `side`, now if idle or after the current turn.
    ///
    /// Only the latest submission made during a turn is kept.
    pub fn submit(&mut self, text: impl Into<String>, side: Side) {
        if !self.enabled {
            return;
        }

        let text = text.into();
        match self.turn {
            TurnState::Idle => {
                self.pending = Some(PendingUtterance { text, side });
                self.turn = TurnState::Speaking(side);
                self.start_pending();
            }
            TurnState::Speaking(current) => {
                if let Some(replaced) = &self.pending {
                    debug!(side = %replaced.side, "Replacing pending utterance");
                }
                debug!(%current, next = %side, "Queued utterance behind current turn");
                self.pending = Some(PendingUtterance { text, side });
            }
        }
    }

    /// Discard all in-flight work and return to idle.
    pub fn reset(&mut self) {
        if let Some(mut session) = self.session.take() {
            info!(session = %session.id, "Aborting speech session");
            session.handle.abort();
        }
        self.renderer.stop();
        self.queues.clear();
        self.pending = None;
        self.turn = TurnState::Idle;
        self.fully_received = false;
    }

    pub fn turn_state(&self) -> TurnState {
        self.turn
    }

    pub fn pending(&self) -> Option<&PendingUtterance> {
        self.pending.as_ref()
    }

    pub fn queue_len(&self, side: Side) -> usize {
        self.queues.get(side).len()
    }

    pub fn is_playing(&self) -> bool {
        self.renderer.is_playing()
    }

    pub fn is_fully_received(&self) -> bool {
        self.fully_received
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    fn current_side(&self, id: SessionId) -> Option<Side> {
        match &self.session {
            Some(session) if session.id == id => Some(session.side),
            _ => {
                debug!(session = %id, "Dropping event from inactive session");
                None
            }
        }
    }

    fn on_chunk_available(&mut self, id: SessionId, chunk: AudioChunk) {
        let Some(side) = self.current_side(id) else {
            return;
        };
        self.queues.get_mut(side).push_back(chunk);
        if !self.renderer.is_playing() {
            self.drain(side);
        }
    }

    fn on_all_chunks_received(&mut self, id: SessionId) {
        let Some(side) = self.current_side(id) else {
            return;
        };
        self.fully_received = true;
        if !self.renderer.is_playing() && self.queues.get(side).is_empty() {
            self.advance_turn();
        }
    }

    fn on_session_failed(&mut self, id: SessionId, reason: String) {
        let Some(side) = self.current_side(id) else {
            return;
        };
        warn!(session = %id, %side, %reason, "Ending turn after session failure");
        self.emit_event(SpeechEvent::SessionFailed { side, reason });
        self.on_all_chunks_received(id);
    }

    fn on_playback_finished(&mut self, token: PlaybackToken) {
        if !self.renderer.finished(token) {
            return;
        }
        if let TurnState::Speaking(side) = self.turn {
            self.drain(side);
        }
    }

    /// Play the next chunk of `side`, or check for turn end if none is left.
    fn drain(&mut self, side: Side) {
        let step = self.renderer.play_next(side, self.queues.get_mut(side));
        if step == RenderStep::Drained && self.fully_received {
            self.advance_turn();
        }
    }

    fn advance_turn(&mut self) {
        self.fully_received = false;
        // The finished session's task has already returned.
        self.session = None;

        if self.pending.is_some() {
            self.start_pending();
            return;
        }

        let finished = match self.turn {
            TurnState::Speaking(side) => Some(side),
            TurnState::Idle => None,
        };
        self.turn = TurnState::Idle;
        info!(side = ?finished, "Turn ended");
        self.emit_event(SpeechEvent::TurnEnded { side: finished });
    }

    fn start_pending(&mut self) {
        let Some(utterance) = self.pending.take() else {
            return;
        };

        if let Some(mut old) = self.session.take() {
            old.handle.abort();
        }

        let id = SessionId(self.next_session);
        self.next_session += 1;

        let side = utterance.side;
        let request = SessionRequest {
            side,
            voice_id: self.voices.get_voice(side).to_string(),
            text: utterance.text,
        };

        self.fully_received = false;
        self.turn = TurnState::Speaking(side);
        let handle = self.factory.start(id, request);
        self.session = Some(ActiveSession { id, side, handle });
        self.emit_event(SpeechEvent::TurnStarted { side });
    }

    /// Emit an event if a callback is registered.
    fn emit_event(&self, event: SpeechEvent) {
        if let Some(ref callback) = self.callback {
            callback(event);
        }
    }
}
