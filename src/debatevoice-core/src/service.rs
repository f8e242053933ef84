//! Runs the scheduler on a single task.
//!
//! Submissions, session results and playback completions all arrive on one
//! channel and are handled one at a time, so scheduler state needs no locks.

use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::audio::{AudioOutput, AudioRenderer};
use crate::config::Config;
use crate::error::SpeechError;
use crate::scheduler::{EventSender, SchedulerEvent, SpeechCallback, TurnScheduler};
use crate::session::{SessionFactory, SessionSettings, WsSessionFactory};
use crate::side::Side;

/// Cloneable handle for submitting work to a running service.
#[derive(Clone)]
pub struct SpeechHandle {
    events: EventSender,
}

impl SpeechHandle {
    /// Queue `text` to be spoken by `side`.
    pub fn submit(&self, text: impl Into<String>, side: Side) -> Result<(), SpeechError> {
        self.send(SchedulerEvent::Submit {
            text: text.into(),
            side,
        })
    }

    /// Drop the current session, queued audio and pending utterance.
    pub fn reset(&self) -> Result<(), SpeechError> {
        self.send(SchedulerEvent::Reset)
    }

    fn send(&self, event: SchedulerEvent) -> Result<(), SpeechError> {
        self.events
            .send(event)
            .map_err(|_| SpeechError::AudioError("Speech service has stopped".to_string()))
    }
}

/// A spawned speech pipeline.
pub struct SpeechService {
    handle: SpeechHandle,
    task: JoinHandle<()>,
}

impl SpeechService {
    /// Start the pipeline with WebSocket sessions and the output built by `make_output`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<O, B>(
        config: &Config,
        make_output: B,
        callback: Option<SpeechCallback>,
    ) -> Result<Self, SpeechError>
    where
        O: AudioOutput + 'static,
        B: FnOnce(EventSender) -> Result<O, SpeechError>,
    {
        if config.speech.enabled && config.speech.ws_url.trim().is_empty() {
            return Err(SpeechError::ConfigMissing("speech.ws_url".to_string()));
        }

        let (events, receiver) = unbounded_channel();
        let factory = WsSessionFactory::new(SessionSettings::from(&config.speech), events.clone());
        Self::spawn_with(config, factory, make_output(events.clone())?, events, receiver, callback)
    }

    /// Start the pipeline with an arbitrary session factory.
    pub fn spawn_with<F, O>(
        config: &Config,
        factory: F,
        output: O,
        events: EventSender,
        receiver: UnboundedReceiver<SchedulerEvent>,
        callback: Option<SpeechCallback>,
    ) -> Result<Self, SpeechError>
    where
        F: SessionFactory + 'static,
        F::Session: 'static,
        O: AudioOutput + 'static,
    {
        let renderer = AudioRenderer::new(output, config.speech.sample_rate);
        let mut scheduler = TurnScheduler::new(
            factory,
            renderer,
            config.voices.clone(),
            config.speech.enabled,
        );
        if let Some(callback) = callback {
            scheduler = scheduler.with_callback(callback);
        }

        let task = tokio::spawn(run(scheduler, receiver));
        info!(enabled = config.speech.enabled, "Speech service started");

        Ok(Self {
            handle: SpeechHandle { events },
            task,
        })
    }

    pub fn handle(&self) -> SpeechHandle {
        self.handle.clone()
    }

    pub fn submit(&self, text: impl Into<String>, side: Side) -> Result<(), SpeechError> {
        self.handle.submit(text, side)
    }

    pub fn reset(&self) -> Result<(), SpeechError> {
        self.handle.reset()
    }

    /// Stop the service and wait until its outputs are released.
    pub async fn shutdown(self) {
        let _ = self.handle.events.send(SchedulerEvent::Shutdown);
        let _ = self.task.await;
        info!("Speech service stopped");
    }
}

async fn run<F, O>(mut scheduler: TurnScheduler<F, O>, mut events: UnboundedReceiver<SchedulerEvent>)
where
    F: SessionFactory,
    O: AudioOutput,
{
    while let Some(event) = events.recv().await {
        if event == SchedulerEvent::Shutdown {
            scheduler.reset();
            break;
        }
        scheduler.handle(event);
    }
    debug!("Speech service loop exited");
}
