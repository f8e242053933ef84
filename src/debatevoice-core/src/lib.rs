//! DebateVoice Core Library
//!
//! Streams synthesized speech for a two-sided debate: text for one side is
//! sent to a synthesis backend, the returned PCM audio is played as it
//! arrives, and turns are sequenced so only one side speaks at a time.

pub mod api;
pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod side;

pub use api::{ChatCompletionGenerator, TextGenerator, Transcript};
pub use audio::{AudioChunk, AudioOutput, AudioRenderer, AudioUnit, PlaybackToken};
pub use config::{Config, default_config};
#[cfg(feature = "playback")]
pub use device::RodioOutput;
pub use device::{NullOutput, WavRecorder};
pub use error::SpeechError;
pub use scheduler::{EventSender, SchedulerEvent, SpeechCallback, SpeechEvent, TurnScheduler, TurnState};
pub use service::{SpeechHandle, SpeechService};
pub use session::{SessionEvent, SessionId, SessionState};
pub use side::Side;
