//! Wire format of the synthesis protocol.
//!
//! Every message is a JSON object `{id, event_type, data?}`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::SpeechError;

pub const SPEECH_UPDATE: &str = "speech.update";
pub const SPEECH_UPDATED: &str = "speech.updated";
pub const TEXT_APPEND: &str = "input_text_buffer.append";
pub const TEXT_COMPLETE: &str = "input_text_buffer.complete";
pub const AUDIO_UPDATE: &str = "speech.audio.update";
pub const AUDIO_COMPLETED: &str = "speech.audio.completed";

/// A message sent to the synthesis backend.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutboundEvent {
    pub id: String,
    pub event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<OutboundData>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum OutboundData {
    SpeechUpdate { output_audio: OutputAudio },
    TextDelta { delta: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutputAudio {
    pub codec: String,
    pub pcm_config: PcmConfig,
    pub speech_rate: i32,
    pub voice_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PcmConfig {
    pub sample_rate: u32,
}

impl OutboundEvent {
    fn new(event_type: &'static str, data: Option<OutboundData>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            data,
        }
    }

    /// Session configuration: PCM output at `sample_rate` in the given voice.
    pub fn speech_update(sample_rate: u32, speech_rate: i32, voice_id: impl Into<String>) -> Self {
        Self::new(
            SPEECH_UPDATE,
            Some(OutboundData::SpeechUpdate {
                output_audio: OutputAudio {
                    codec: "pcm".to_string(),
                    pcm_config: PcmConfig { sample_rate },
                    speech_rate,
                    voice_id: voice_id.into(),
                },
            }),
        )
    }

    pub fn append_text(text: impl Into<String>) -> Self {
        Self::new(
            TEXT_APPEND,
            Some(OutboundData::TextDelta { delta: text.into() }),
        )
    }

    pub fn complete_text() -> Self {
        Self::new(TEXT_COMPLETE, None)
    }

    pub fn to_json(&self) -> Result<String, SpeechError> {
        serde_json::to_string(self).map_err(|e| SpeechError::ProtocolError(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event_type: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AudioDelta {
    delta: String,
}

/// A message received from the synthesis backend.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SpeechUpdated,
    /// Base64-encoded PCM bytes.
    AudioUpdate(String),
    AudioCompleted,
    /// Any event type the session does not act on by default.
    Other(String),
}

impl InboundEvent {
    pub fn parse(text: &str) -> Result<Self, SpeechError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| SpeechError::ProtocolError(format!("Malformed message: {}", e)))?;

        match envelope.event_type.as_str() {
            SPEECH_UPDATED => Ok(InboundEvent::SpeechUpdated),
            AUDIO_UPDATE => {
                let data = envelope.data.ok_or_else(|| {
                    SpeechError::ProtocolError(format!("{} without data", AUDIO_UPDATE))
                })?;
                let audio: AudioDelta = serde_json::from_value(data)
                    .map_err(|e| SpeechError::ProtocolError(format!("Bad audio payload: {}", e)))?;
                Ok(InboundEvent::AudioUpdate(audio.delta))
            }
            AUDIO_COMPLETED => Ok(InboundEvent::AudioCompleted),
            _ => Ok(InboundEvent::Other(envelope.event_type)),
        }
    }
}

/// Decode a base64 audio payload into raw bytes.
pub fn decode_audio_payload(payload: &str) -> Result<Vec<u8>, SpeechError> {
    STANDARD
        .decode(payload)
        .map_err(|e| SpeechError::DecodeError(format!("Invalid base64 audio: {}", e)))
}

pub fn encode_audio_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
