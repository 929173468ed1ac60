//! `OpenAI` provider implementation using the `async-openai` crate.
//!
//! Works against any endpoint that speaks the `OpenAI` chat completion
//! API (`OpenAI` itself, Azure, local proxies) via the base URL override
//! in [`EngineConfig`].

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, ResponseFormat,
};
use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::engine::message::{ChatRequest, ChatResponse, Role, TokenUsage};
use crate::engine::provider::LlmProvider;
use crate::error::EngineError;

/// `OpenAI`-compatible LLM provider.
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    /// Creates a new provider from engine configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ApiKeyMissing`] when no API key is configured.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let Some(api_key) = config.api_key.as_deref() else {
            return Err(EngineError::ApiKeyMissing);
        };

        let mut sdk_config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = config.base_url.as_deref() {
            sdk_config = sdk_config.with_api_base(base);
        }

        Ok(Self {
            client: Client::with_config(sdk_config),
        })
    }

    /// Translates the engine's request into the SDK request type.
    ///
    /// The engine only ever sends system and user turns; an assistant
    /// turn, if one ever reached this layer, is folded into a user turn
    /// rather than silently dropped.
    fn sdk_request(request: &ChatRequest) -> Result<CreateChatCompletionRequest, EngineError> {
        let mut messages: Vec<ChatCompletionRequestMessage> =
            Vec::with_capacity(request.messages.len());
        for msg in &request.messages {
            let text = msg.content.clone();
            messages.push(match msg.role {
                Role::System => ChatCompletionRequestSystemMessage {
                    content: ChatCompletionRequestSystemMessageContent::Text(text),
                    name: None,
                }
                .into(),
                Role::User | Role::Assistant => ChatCompletionRequestUserMessage {
                    content: ChatCompletionRequestUserMessageContent::Text(text),
                    name: None,
                }
                .into(),
            });
        }

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&request.model).messages(messages);
        if let Some(limit) = request.max_tokens {
            args.max_completion_tokens(limit);
        }
        if request.json_mode {
            args.response_format(ResponseFormat::JsonObject);
        }
        // Zero is the API default; only forward a real sampling temperature.
        if let Some(temperature) = request.temperature.filter(|&t| t > 0.0) {
            args.temperature(temperature);
        }

        args.build()
            .map_err(|e| EngineError::Upstream(format!("chat request build failed: {e}")))
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OpenAiProvider")
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, EngineError> {
        let response = self
            .client
            .chat()
            .create(Self::sdk_request(request)?)
            .await
            .map_err(|e| EngineError::Upstream(format!("chat completion failed: {e}")))?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        // An empty choices array is a degenerate but observed response
        // shape from some proxies; treat it as an empty completion.
        let (content, finish_reason) = match response.choices.into_iter().next() {
            Some(choice) => (
                choice.message.content.unwrap_or_default(),
                choice
                    .finish_reason
                    .map(|reason| format!("{reason:?}").to_lowercase()),
            ),
            None => (String::new(), None),
        };

        Ok(ChatResponse {
            content,
            usage,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::message::{system_message, user_message};

    fn request(json_mode: bool, temperature: Option<f32>) -> ChatRequest {
        ChatRequest {
            model: "gpt-5.2-2025-12-11".to_string(),
            messages: vec![system_message("rules"), user_message("question")],
            temperature,
            max_tokens: Some(256),
            json_mode,
        }
    }

    #[test]
    fn test_sdk_request_roles_and_order() {
        let built = OpenAiProvider::sdk_request(&request(false, None))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(built.messages.len(), 2);
        assert!(matches!(
            built.messages[0],
            ChatCompletionRequestMessage::System(_)
        ));
        assert!(matches!(
            built.messages[1],
            ChatCompletionRequestMessage::User(_)
        ));
        assert_eq!(built.model, "gpt-5.2-2025-12-11");
        assert_eq!(built.max_completion_tokens, Some(256));
    }

    #[test]
    fn test_sdk_request_assistant_folds_to_user() {
        let chat = ChatRequest {
            model: "m".to_string(),
            messages: vec![crate::engine::message::ChatMessage {
                role: Role::Assistant,
                content: "prior turn".to_string(),
            }],
            temperature: None,
            max_tokens: None,
            json_mode: false,
        };
        let built = OpenAiProvider::sdk_request(&chat).unwrap_or_else(|_| unreachable!());
        assert!(matches!(
            built.messages[0],
            ChatCompletionRequestMessage::User(_)
        ));
    }

    #[test]
    fn test_sdk_request_json_mode() {
        let built = OpenAiProvider::sdk_request(&request(true, Some(0.0)))
            .unwrap_or_else(|_| unreachable!());
        assert!(built.response_format.is_some());
        // Temperature 0.0 is the API default and is not forwarded.
        assert!(built.temperature.is_none());
    }

    #[test]
    fn test_sdk_request_forwards_real_temperature() {
        let built = OpenAiProvider::sdk_request(&request(false, Some(0.4)))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(built.temperature, Some(0.4));
    }

    #[test]
    fn test_new_requires_api_key() {
        let config = EngineConfig::builder().build();
        assert!(matches!(
            OpenAiProvider::new(&config),
            Err(EngineError::ApiKeyMissing)
        ));
    }
}
