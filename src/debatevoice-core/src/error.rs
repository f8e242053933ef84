//! Error types for the speech pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("Missing configuration: {0}")]
    ConfigMissing(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed before audio completed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Audio device error: {0}")]
    AudioError(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("OpenAI API error: {0}")]
    OpenAIError(#[from] async_openai::error::OpenAIError),

    #[error("WAV error: {0}")]
    WavError(#[from] hound::Error),
}
