//! Text generation for each side through an OpenAI-compatible API.

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{ApiConfig, Config, PromptsConfig};
use crate::error::SpeechError;
use crate::side::Side;

/// One spoken turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DebateTurn {
    pub side: Side,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Everything said so far in a debate.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub topic: String,
    turns: Vec<DebateTurn>,
}

impl Transcript {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            turns: Vec::new(),
        }
    }

    pub fn push(&mut self, side: Side, content: impl Into<String>) {
        self.turns.push(DebateTurn {
            side,
            content: content.into(),
        });
    }

    /// Chat history from the point of view of `side`.
    ///
    /// Its own turns are assistant messages and the opponent's are user
    /// messages, so the model always answers the latest opposing argument.
    pub fn history_for(&self, side: Side, prompts: &PromptsConfig) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: ChatRole::System,
            content: prompts.get_prompt(side, &self.topic),
        }];

        for turn in &self.turns {
            let role = if turn.side == side {
                ChatRole::Assistant
            } else {
                ChatRole::User
            };
            messages.push(ChatMessage {
                role,
                content: turn.content.clone(),
            });
        }

        if messages.last().map(|m| m.role) != Some(ChatRole::User) {
            messages.push(ChatMessage {
                role: ChatRole::User,
                content: "Please deliver your opening statement.".to_string(),
            });
        }

        messages
    }
}

/// Produces the next turn for a side.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn try_generate(&self, transcript: &Transcript, side: Side) -> Result<String, SpeechError>;

    /// Like `try_generate`, but failures come back as the returned text.
    async fn generate_text(&self, transcript: &Transcript, side: Side) -> String {
        match self.try_generate(transcript, side).await {
            Ok(text) => text,
            Err(e) => {
                warn!(%side, error = %e, "Text generation failed");
                format!("API call failed: {}", e)
            }
        }
    }
}

/// Chat-completion client with one endpoint per side.
pub struct ChatCompletionGenerator {
    api: ApiConfig,
    prompts: PromptsConfig,
}

impl ChatCompletionGenerator {
    pub fn new(config: &Config) -> Self {
        Self {
            api: config.api.clone(),
            prompts: config.prompts.clone(),
        }
    }

    fn client(&self, side: Side) -> Result<Client<OpenAIConfig>, SpeechError> {
        let endpoint = self.api.endpoint(side);
        let (Some(api_base), Some(api_key)) = (
            endpoint.api_base.as_deref().filter(|s| !s.is_empty()),
            endpoint.api_key.as_deref().filter(|s| !s.is_empty()),
        ) else {
            return Err(SpeechError::ConfigMissing(format!(
                "API URL or key for the {} side",
                side
            )));
        };

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| {
                SpeechError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;

        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base);

        Ok(Client::with_config(config).with_http_client(http_client))
    }
}

#[async_trait]
impl TextGenerator for ChatCompletionGenerator {
    async fn try_generate(&self, transcript: &Transcript, side: Side) -> Result<String, SpeechError> {
        let client = self.client(side)?;
        let endpoint = self.api.endpoint(side);

        let messages: Vec<ChatCompletionRequestMessage> = transcript
            .history_for(side, &self.prompts)
            .into_iter()
            .map(to_request_message)
            .collect();

        let request = CreateChatCompletionRequestArgs::default()
            .model(&endpoint.model)
            .temperature(endpoint.temperature)
            .messages(messages)
            .build()?;

        debug!(%side, model = %endpoint.model, "Requesting completion");
        let response = client.chat().create(request).await?;

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

fn to_request_message(message: ChatMessage) -> ChatCompletionRequestMessage {
    match message.role {
        ChatRole::System => {
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: message.content.into(),
                name: None,
            })
        }
        ChatRole::User => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
            content: message.content.into(),
            name: None,
        }),
        ChatRole::Assistant => {
            ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                content: Some(message.content.into()),
                name: None,
                tool_calls: None,
                refusal: None,
                audio: None,
                function_call: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;

    #[test]
    fn test_history_roles_follow_side() {
        let prompts = PromptsConfig::default();
        let mut transcript = Transcript::new("Remote work beats the office");
        transcript.push(Side::Positive, "Opening for.");
        transcript.push(Side::Negative, "Opening against.");

        let positive = transcript.history_for(Side::Positive, &prompts);
        assert_eq!(positive[0].role, ChatRole::System);
        assert!(positive[0].content.contains("Remote work beats the office"));
        assert_eq!(positive[1].role, ChatRole::Assistant);
        assert_eq!(positive[2].role, ChatRole::User);
        assert_eq!(positive.len(), 3);

        let negative = transcript.history_for(Side::Negative, &prompts);
        assert_eq!(negative[1].role, ChatRole::User);
        assert_eq!(negative[2].role, ChatRole::Assistant);
        assert_eq!(negative.last().unwrap().role, ChatRole::User);
    }

    #[test]
    fn test_empty_history_asks_for_opening() {
        let history = Transcript::new("t").history_for(Side::Positive, &PromptsConfig::default());
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, ChatRole::User);
    }

    #[tokio::test]
    async fn test_missing_endpoint_returns_error_text() {
        let generator = ChatCompletionGenerator::new(&default_config());
        let text = generator
            .generate_text(&Transcript::new("t"), Side::Negative)
            .await;
        assert!(text.starts_with("API call failed:"));
        assert!(text.contains("negative"));
    }
}
