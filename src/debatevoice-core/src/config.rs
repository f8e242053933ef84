//! Configuration module for loading TOML config files.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::SpeechError;
use crate::side::Side;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub voices: VoicesConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

/// Settings for the synthesis connection and playback.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechConfig {
    /// WebSocket URL of the synthesis backend.
    #[serde(default)]
    pub ws_url: String,
    /// Sample rate of the PCM stream, requested from the backend and used for playback.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub speech_rate: i32,
    /// When false, submissions are ignored.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Pause between `input_text_buffer.append` and `input_text_buffer.complete`.
    #[serde(default = "default_append_delay_ms")]
    pub append_delay_ms: u64,
    /// Event type acknowledging the appended text. When set, completion is
    /// signalled on this event instead of after `append_delay_ms`.
    #[serde(default)]
    pub append_ack_event: Option<String>,
    /// Upper bound on a single session, from connect to `speech.audio.completed`.
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
}

fn default_sample_rate() -> u32 {
    24000
}

fn default_enabled() -> bool {
    true
}

fn default_append_delay_ms() -> u64 {
    300
}

fn default_completion_timeout_secs() -> u64 {
    60
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            sample_rate: default_sample_rate(),
            speech_rate: 0,
            enabled: default_enabled(),
            append_delay_ms: default_append_delay_ms(),
            append_ack_event: None,
            completion_timeout_secs: default_completion_timeout_secs(),
        }
    }
}

impl SpeechConfig {
    pub fn append_delay(&self) -> Duration {
        Duration::from_millis(self.append_delay_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }
}

/// Voice configuration for TTS.
#[derive(Debug, Clone, Deserialize)]
pub struct VoicesConfig {
    pub positive_voice: String,
    pub negative_voice: String,
}

impl Default for VoicesConfig {
    fn default() -> Self {
        Self {
            positive_voice: "female-warm".to_string(),
            negative_voice: "male-steady".to_string(),
        }
    }
}

impl VoicesConfig {
    /// Get voice ID for a side.
    pub fn get_voice(&self, side: Side) -> &str {
        match side {
            Side::Positive => &self.positive_voice,
            Side::Negative => &self.negative_voice,
        }
    }
}

/// Chat-completion endpoints, one per side.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub positive: EndpointConfig,
    #[serde(default)]
    pub negative: EndpointConfig,
}

impl ApiConfig {
    pub fn endpoint(&self, side: Side) -> &EndpointConfig {
        match side {
            Side::Positive => &self.positive,
            Side::Negative => &self.negative,
        }
    }
}

/// One OpenAI-compatible endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_model() -> String {
    "moonshot-v1-8k".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
        }
    }
}

/// System prompts configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptsConfig {
    pub positive_prompt: String,
    pub negative_prompt: String,
}

impl PromptsConfig {
    /// Get the system prompt for a side, with placeholders replaced.
    pub fn get_prompt(&self, side: Side, topic: &str) -> String {
        let template = match side {
            Side::Positive => &self.positive_prompt,
            Side::Negative => &self.negative_prompt,
        };

        template.replace("{topic}", topic)
    }
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            positive_prompt: DEFAULT_POSITIVE_PROMPT.to_string(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SpeechError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| SpeechError::ConfigError(format!("Failed to read config: {}", e)))?;

        Self::from_str(&content)
    }

    /// Load configuration from string content.
    pub fn from_str(content: &str) -> Result<Self, SpeechError> {
        toml::from_str(content)
            .map_err(|e| SpeechError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SPEECH_WS_URL") {
            self.speech.ws_url = url;
        }

        for (side, prefix) in [(Side::Positive, "POSITIVE"), (Side::Negative, "NEGATIVE")] {
            let endpoint = match side {
                Side::Positive => &mut self.api.positive,
                Side::Negative => &mut self.api.negative,
            };
            if let Some(base) = lookup(&format!("{}_API_URL", prefix)) {
                endpoint.api_base = Some(base);
            }
            if let Some(key) = lookup(&format!("{}_API_KEY", prefix)) {
                endpoint.api_key = Some(key);
            }
            if let Some(model) = lookup(&format!("{}_MODEL", prefix)) {
                endpoint.model = model;
            }
        }
    }

}

/// Default configuration embedded in the binary.
pub fn default_config() -> Config {
    Config {
        speech: SpeechConfig::default(),
        voices: VoicesConfig::default(),
        api: ApiConfig::default(),
        prompts: PromptsConfig::default(),
    }
}

const DEFAULT_POSITIVE_PROMPT: &str = r#"You are the POSITIVE side of a formal debate.

DEBATE TOPIC: {topic}

You argue IN FAVOR of the topic. Answer your opponent's latest points directly,
then advance your own case. Keep each turn under 150 words.

Your words are read aloud by a speech synthesizer: output only the spoken text,
with no markdown, lists, stage directions or text in parentheses.
"#;

const DEFAULT_NEGATIVE_PROMPT: &str = r#"You are the NEGATIVE side of a formal debate.

DEBATE TOPIC: {topic}

You argue AGAINST the topic. Answer your opponent's latest points directly,
then advance your own case. Keep each turn under 150 words.

Your words are read aloud by a speech synthesizer: output only the spoken text,
with no markdown, lists, stage directions or text in parentheses.
"#;
