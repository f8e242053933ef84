//! One synthesis exchange per utterance.
//!
//! [`SessionProtocol`] is the pure state machine for the handshake and text
//! streaming. [`WsSessionFactory`] runs it over a WebSocket connection in a
//! spawned task and forwards its results to the scheduler.

use std::fmt;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::audio::AudioChunk;
use crate::config::SpeechConfig;
use crate::error::SpeechError;
use crate::protocol::{self, InboundEvent, OutboundEvent};
use crate::scheduler::{EventSender, SchedulerEvent};
use crate::side::Side;

/// Distinguishes sessions so events from a replaced one can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a session reports back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Chunk(AudioChunk),
    /// `speech.audio.completed` was received.
    AllChunksReceived,
    /// The session ended without completing; no further chunks will arrive.
    Failed(String),
}

/// The utterance a session synthesizes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub side: Side,
    pub text: String,
    pub voice_id: String,
}

/// Starts sessions on behalf of the scheduler.
pub trait SessionFactory: Send {
    type Session: SessionControl;

    fn start(&mut self, id: SessionId, request: SessionRequest) -> Self::Session;
}

/// Handle to a live session.
pub trait SessionControl: Send {
    /// Tear down the connection. Safe to call on a finished session.
    fn abort(&mut self);
}

/// Protocol progress of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HandshakePending,
    StreamingText,
    AwaitingCompletion,
}

/// Work the transport must carry out for the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(OutboundEvent),
    /// Call [`SessionProtocol::on_timer`] after this delay.
    ScheduleComplete(Duration),
    Chunk(AudioChunk),
    Completed,
}

/// Pacing and format settings shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub url: String,
    pub sample_rate: u32,
    pub speech_rate: i32,
    pub append_delay: Duration,
    pub append_ack_event: Option<String>,
    pub completion_timeout: Duration,
}

impl From<&SpeechConfig> for SessionSettings {
    fn from(config: &SpeechConfig) -> Self {
        Self {
            url: config.ws_url.clone(),
            sample_rate: config.sample_rate,
            speech_rate: config.speech_rate,
            append_delay: config.append_delay(),
            append_ack_event: config.append_ack_event.clone(),
            completion_timeout: config.completion_timeout(),
        }
    }
}

pub struct SessionProtocol {
    state: SessionState,
    text: String,
    voice_id: String,
    sample_rate: u32,
    speech_rate: i32,
    append_delay: Duration,
    append_ack_event: Option<String>,
}

impl SessionProtocol {
    pub fn new(request: &SessionRequest, settings: &SessionSettings) -> Self {
        Self {
            state: SessionState::Idle,
            text: request.text.clone(),
            voice_id: request.voice_id.clone(),
            sample_rate: settings.sample_rate,
            speech_rate: settings.speech_rate,
            append_delay: settings.append_delay,
            append_ack_event: settings.append_ack_event.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The connection is open: configure the output format.
    pub fn on_open(&mut self) -> Vec<Action> {
        if self.state != SessionState::Idle {
            return Vec::new();
        }
        self.state = SessionState::HandshakePending;
        vec![Action::Send(OutboundEvent::speech_update(
            self.sample_rate,
            self.speech_rate,
            self.voice_id.clone(),
        ))]
    }

    pub fn on_event(&mut self, event: InboundEvent) -> Vec<Action> {
        match event {
            InboundEvent::SpeechUpdated => {
                if self.state != SessionState::HandshakePending {
                    debug!("Ignoring repeated speech.updated");
                    return Vec::new();
                }
                self.state = SessionState::StreamingText;
                let mut actions = vec![Action::Send(OutboundEvent::append_text(self.text.clone()))];
                if self.append_ack_event.is_none() {
                    actions.push(Action::ScheduleComplete(self.append_delay));
                }
                actions
            }
            InboundEvent::AudioUpdate(payload) => {
                if !matches!(
                    self.state,
                    SessionState::StreamingText | SessionState::AwaitingCompletion
                ) {
                    debug!(state = ?self.state, "Ignoring audio outside of a stream");
                    return Vec::new();
                }
                match protocol::decode_audio_payload(&payload) {
                    Ok(bytes) => vec![Action::Chunk(AudioChunk::new(bytes))],
                    Err(e) => {
                        warn!(error = %e, "Dropping audio chunk");
                        Vec::new()
                    }
                }
            }
            InboundEvent::AudioCompleted => {
                if !matches!(
                    self.state,
                    SessionState::StreamingText | SessionState::AwaitingCompletion
                ) {
                    return Vec::new();
                }
                self.state = SessionState::Idle;
                vec![Action::Completed]
            }
            InboundEvent::Other(event_type) => {
                if self.append_ack_event.as_deref() == Some(event_type.as_str()) {
                    return self.on_timer();
                }
                debug!(%event_type, "Ignoring unhandled event");
                Vec::new()
            }
        }
    }

    /// The append has been ingested: signal the end of the text.
    pub fn on_timer(&mut self) -> Vec<Action> {
        if self.state != SessionState::StreamingText {
            return Vec::new();
        }
        self.state = SessionState::AwaitingCompletion;
        vec![Action::Send(OutboundEvent::complete_text())]
    }
}

/// Opens a WebSocket connection per session.
pub struct WsSessionFactory {
    settings: SessionSettings,
    events: EventSender,
}

impl WsSessionFactory {
    pub fn new(settings: SessionSettings, events: EventSender) -> Self {
        Self { settings, events }
    }
}

impl SessionFactory for WsSessionFactory {
    type Session = WsSession;

    fn start(&mut self, id: SessionId, request: SessionRequest) -> WsSession {
        let settings = self.settings.clone();
        let events = self.events.clone();
        let task = tokio::spawn(run_session(id, request, settings, events));
        WsSession { task }
    }
}

/// A spawned session task. Aborting or dropping it closes the connection.
pub struct WsSession {
    task: JoinHandle<()>,
}

impl SessionControl for WsSession {
    fn abort(&mut self) {
        self.task.abort();
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

async fn run_session(
    id: SessionId,
    request: SessionRequest,
    settings: SessionSettings,
    events: EventSender,
) {
    let side = request.side;
    info!(session = %id, %side, voice = %request.voice_id, "Starting speech session");

    let report = |event: SessionEvent| {
        // The service may already be gone during shutdown.
        let _ = events.send(SchedulerEvent::Session { id, event });
    };

    let outcome = tokio::time::timeout(
        settings.completion_timeout,
        drive_session(&request, &settings, &report),
    )
    .await;

    match outcome {
        Ok(Ok(())) => debug!(session = %id, "Session completed"),
        Ok(Err(e)) => {
            warn!(session = %id, %side, error = %e, "Speech session failed");
            report(SessionEvent::Failed(e.to_string()));
        }
        Err(_) => {
            let e = SpeechError::Timeout("speech.audio.completed".to_string());
            warn!(session = %id, %side, error = %e, "Speech session timed out");
            report(SessionEvent::Failed(e.to_string()));
        }
    }
}

async fn drive_session<R>(
    request: &SessionRequest,
    settings: &SessionSettings,
    report: &R,
) -> Result<(), SpeechError>
where
    R: Fn(SessionEvent),
{
    let (stream, _) = connect_async(settings.url.as_str()).await?;
    debug!(url = %settings.url, "WebSocket connected");
    let (mut writer, mut reader) = stream.split();

    let mut machine = SessionProtocol::new(request, settings);
    let mut complete_at: Option<Instant> = None;

    let actions = machine.on_open();
    if execute(actions, &mut writer, &mut complete_at, report).await? {
        return Ok(());
    }

    loop {
        let actions = tokio::select! {
            _ = sleep_until(complete_at) => {
                complete_at = None;
                machine.on_timer()
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => match InboundEvent::parse(&text) {
                    Ok(event) => machine.on_event(event),
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed message");
                        Vec::new()
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Server closed the connection");
                    return Err(SpeechError::ConnectionClosed);
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => return Err(e.into()),
                None => return Err(SpeechError::ConnectionClosed),
            },
        };

        if execute(actions, &mut writer, &mut complete_at, report).await? {
            let _ = writer.send(Message::Close(None)).await;
            return Ok(());
        }
    }
}

/// Carry out `actions`. Returns true once the stream has completed.
async fn execute<R>(
    actions: Vec<Action>,
    writer: &mut WsWriter,
    complete_at: &mut Option<Instant>,
    report: &R,
) -> Result<bool, SpeechError>
where
    R: Fn(SessionEvent),
{
    for action in actions {
        match action {
            Action::Send(event) => {
                debug!(event_type = event.event_type, "Sending");
                writer.send(Message::Text(event.to_json()?)).await?;
            }
            Action::ScheduleComplete(delay) => *complete_at = Some(Instant::now() + delay),
            Action::Chunk(chunk) => report(SessionEvent::Chunk(chunk)),
            Action::Completed => {
                info!("Server finished sending audio");
                report(SessionEvent::AllChunksReceived);
                return Ok(true);
            }
        }
    }
    Ok(false)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
