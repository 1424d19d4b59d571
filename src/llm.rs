//! LLM integration via OpenAI-compatible APIs
//!
//! Two independent channels: **chat** (provider chosen by configuration)
//! and **image-assist** (always the local provider, used to build SD
//! prompts). Provider failures come back as structured outcomes; nothing
//! panics across this boundary.

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::config::Config;

/// Message roles in the provider contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a provider conversation
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Provider response, success or structured failure
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub content: String,
    pub success: bool,
    pub provider: String,
    pub error: Option<String>,
}

impl ChatOutcome {
    fn failure(provider: &str, error: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            success: false,
            provider: provider.to_string(),
            error: Some(error.into()),
        }
    }
}

/// How to reach a provider
pub enum LlmBackend {
    /// Any OpenAI-compatible endpoint (local llama.cpp/LM Studio, OpenAI)
    OpenAiCompatible {
        model: String,
    },
    /// Null object: always reports unavailability
    Null,
    /// Mock backend for testing; echoes the last user message
    Mock {
        prefix: String,
    },
}

/// A single LLM provider
pub struct LlmProvider {
    name: String,
    backend: LlmBackend,
    client: Option<Client<OpenAIConfig>>,
}

impl LlmProvider {
    /// OpenAI-compatible provider. Local engines ignore the API key.
    pub fn openai_compatible(
        name: &str,
        endpoint: &str,
        api_key: Option<&str>,
        model: &str,
    ) -> Self {
        let config = OpenAIConfig::new()
            .with_api_base(endpoint)
            .with_api_key(api_key.unwrap_or("not-needed"));
        Self {
            name: name.to_string(),
            backend: LlmBackend::OpenAiCompatible {
                model: model.to_string(),
            },
            client: Some(Client::with_config(config)),
        }
    }

    /// Provider that reports unavailability for every call
    pub fn null(name: &str) -> Self {
        Self {
            name: name.to_string(),
            backend: LlmBackend::Null,
            client: None,
        }
    }

    /// Echo provider for tests
    pub fn mock(name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            backend: LlmBackend::Mock {
                prefix: prefix.to_string(),
            },
            client: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_available(&self) -> bool {
        !matches!(self.backend, LlmBackend::Null)
    }

    /// Send a conversation and get a response
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> ChatOutcome {
        match &self.backend {
            LlmBackend::Null => {
                ChatOutcome::failure(&self.name, "no LLM provider configured")
            }
            LlmBackend::Mock { prefix } => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("");
                ChatOutcome {
                    content: format!("{} {}", prefix, last_user),
                    success: true,
                    provider: self.name.clone(),
                    error: None,
                }
            }
            LlmBackend::OpenAiCompatible { model } => {
                let client = match &self.client {
                    Some(client) => client,
                    None => return ChatOutcome::failure(&self.name, "client not initialized"),
                };

                let mut converted: Vec<ChatCompletionRequestMessage> =
                    Vec::with_capacity(messages.len());
                for message in messages {
                    let result = match message.role {
                        Role::System => ChatCompletionRequestSystemMessageArgs::default()
                            .content(message.content.clone())
                            .build()
                            .map(ChatCompletionRequestMessage::System),
                        Role::User => ChatCompletionRequestUserMessageArgs::default()
                            .content(message.content.clone())
                            .build()
                            .map(ChatCompletionRequestMessage::User),
                        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                            .content(message.content.clone())
                            .build()
                            .map(ChatCompletionRequestMessage::Assistant),
                    };
                    match result {
                        Ok(converted_message) => converted.push(converted_message),
                        Err(e) => return ChatOutcome::failure(&self.name, e.to_string()),
                    }
                }

                let request = match CreateChatCompletionRequestArgs::default()
                    .model(model)
                    .messages(converted)
                    .temperature(temperature as f32)
                    .max_tokens(max_tokens)
                    .build()
                {
                    Ok(request) => request,
                    Err(e) => return ChatOutcome::failure(&self.name, e.to_string()),
                };

                match client.chat().create(request).await {
                    Ok(response) => {
                        let content = response
                            .choices
                            .first()
                            .and_then(|c| c.message.content.clone())
                            .unwrap_or_default();
                        ChatOutcome {
                            content,
                            success: true,
                            provider: self.name.clone(),
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!(provider = %self.name, "chat request failed: {}", e);
                        ChatOutcome::failure(&self.name, e.to_string())
                    }
                }
            }
        }
    }

    /// List model ids the provider offers
    pub async fn list_models(&self) -> Vec<String> {
        match &self.backend {
            LlmBackend::Null => vec![],
            LlmBackend::Mock { .. } => vec!["mock".to_string()],
            LlmBackend::OpenAiCompatible { .. } => {
                let Some(client) = &self.client else {
                    return vec![];
                };
                match client.models().list().await {
                    Ok(response) => response.data.into_iter().map(|m| m.id).collect(),
                    Err(e) => {
                        warn!(provider = %self.name, "model listing failed: {}", e);
                        vec![]
                    }
                }
            }
        }
    }

    /// Is the provider reachable?
    pub async fn health_check(&self) -> bool {
        match &self.backend {
            LlmBackend::Null => false,
            LlmBackend::Mock { .. } => true,
            LlmBackend::OpenAiCompatible { .. } => match &self.client {
                Some(client) => client.models().list().await.is_ok(),
                None => false,
            },
        }
    }
}

/// Two-channel provider router
pub struct LlmRouter {
    /// User-facing conversation channel (configurable provider)
    pub chat: LlmProvider,
    /// Prompt-building channel (always the local provider)
    pub image_assist: LlmProvider,
}

impl LlmRouter {
    /// Build both channels from configuration. Unknown provider names fall
    /// back to the null provider rather than failing startup.
    pub fn from_config(config: &Config) -> Self {
        let chat = match config.chat_provider.as_str() {
            "local" => LlmProvider::openai_compatible(
                "local",
                &config.local_llm_url,
                None,
                &config.local_llm_model,
            ),
            "openai" => match &config.openai_api_key {
                Some(key) => LlmProvider::openai_compatible(
                    "openai",
                    &config.openai_base_url,
                    Some(key),
                    &config.openai_model,
                ),
                None => {
                    warn!("openai provider selected but no API key configured");
                    LlmProvider::null("openai")
                }
            },
            "none" => LlmProvider::null("none"),
            other => {
                warn!("unknown chat provider '{}', disabling chat", other);
                LlmProvider::null(other)
            }
        };

        // Image-assist is pinned to the local provider
        let image_assist = LlmProvider::openai_compatible(
            "local",
            &config.local_llm_url,
            None,
            &config.local_llm_model,
        );

        Self { chat, image_assist }
    }

    /// Mock router for tests
    pub fn mock() -> Self {
        Self {
            chat: LlmProvider::mock("mock-chat", "[chat]"),
            image_assist: LlmProvider::mock("mock-assist", "[assist]"),
        }
    }

    /// Summary of both channels for the status tool
    pub async fn provider_info(&self) -> serde_json::Value {
        json!({
            "chat": {
                "provider": self.chat.name(),
                "available": self.chat.is_available(),
                "healthy": self.chat.health_check().await,
            },
            "image_assist": {
                "provider": self.image_assist.name(),
                "available": self.image_assist.is_available(),
                "healthy": self.image_assist.health_check().await,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_provider_reports_unavailability() {
        let provider = LlmProvider::null("none");
        let outcome = provider.chat(&[ChatMessage::user("hi")], 0.7, 100).await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
        assert!(!provider.health_check().await);
    }

    #[tokio::test]
    async fn mock_provider_echoes_last_user_message() {
        let provider = LlmProvider::mock("mock", "[echo]");
        let outcome = provider
            .chat(
                &[
                    ChatMessage::system("be helpful"),
                    ChatMessage::user("first"),
                    ChatMessage::assistant("reply"),
                    ChatMessage::user("second"),
                ],
                0.7,
                100,
            )
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.content, "[echo] second");
    }

    #[tokio::test]
    async fn router_mock_channels_are_distinct() {
        let router = LlmRouter::mock();
        let chat = router.chat.chat(&[ChatMessage::user("x")], 0.7, 10).await;
        let assist = router
            .image_assist
            .chat(&[ChatMessage::user("x")], 0.7, 10)
            .await;
        assert!(chat.content.starts_with("[chat]"));
        assert!(assist.content.starts_with("[assist]"));
    }
}
