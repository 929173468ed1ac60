//! Pluggable LLM provider trait and registry.
//!
//! Implementations translate provider-agnostic [`ChatRequest`]/[`ChatResponse`]
//! into provider-specific SDK calls. This keeps all engine logic decoupled
//! from any particular LLM vendor, and lets tests substitute a scripted fake.

use async_trait::async_trait;

use super::message::{ChatRequest, ChatResponse};
use super::providers::OpenAiProvider;
use crate::config::EngineConfig;
use crate::error::EngineError;

/// Trait for LLM provider backends.
///
/// Implementations handle the transport layer (HTTP, SDK calls, retries)
/// for a specific provider while presenting a uniform interface to the
/// engine's agents.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g., `"openai"`).
    fn name(&self) -> &'static str;

    /// Executes a chat completion request.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on API failures, timeouts, or parse errors.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, EngineError>;
}

/// Creates an [`LlmProvider`] based on the configured provider name.
///
/// # Errors
///
/// Returns [`EngineError::ApiKeyMissing`] when no key is configured and
/// [`EngineError::UnsupportedProvider`] for unknown provider names.
pub fn create_provider(config: &EngineConfig) -> Result<Box<dyn LlmProvider>, EngineError> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiProvider::new(config)?)),
        other => Err(EngineError::UnsupportedProvider {
            name: other.to_string(),
        }),
    }
}
