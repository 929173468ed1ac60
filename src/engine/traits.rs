//! Agent trait definition.
//!
//! The planner, extractor, and finalizer all implement this trait, which
//! gives the controller a uniform way to run a one-shot LLM call with a
//! fixed system prompt, JSON mode, and a deadline.

use std::time::Duration;

use async_trait::async_trait;

use super::message::{ChatRequest, system_message, user_message};
use super::provider::LlmProvider;
use crate::error::EngineError;

/// Response from an agent execution.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    /// The agent's text output.
    pub content: String,
    /// Token usage for this call.
    pub usage: super::message::TokenUsage,
    /// Why the model stopped generating (e.g. `"stop"`, `"length"`).
    pub finish_reason: Option<String>,
}

/// Trait implemented by the engine's LLM-backed agents.
///
/// Agents encapsulate a specific role (planning, extraction, answer
/// writing) with a fixed system prompt and model configuration. The
/// controller calls [`Agent::execute`] to run the agent against a
/// provider under a deadline.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Agent name for logging and identification.
    fn name(&self) -> &'static str;

    /// Model identifier to use for this agent.
    fn model(&self) -> &str;

    /// System prompt that defines the agent's role and behavior.
    fn system_prompt(&self) -> &str;

    /// Whether to request JSON-object formatted output.
    fn json_mode(&self) -> bool {
        true
    }

    /// Sampling temperature (0.0 = deterministic).
    fn temperature(&self) -> f32 {
        0.0
    }

    /// Maximum tokens for the response.
    fn max_tokens(&self) -> u32 {
        2048
    }

    /// Executes the agent with the given user message under a deadline.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UpstreamTimeout`] when the deadline elapses
    /// and [`EngineError::Upstream`] on API failures.
    async fn execute(
        &self,
        provider: &dyn LlmProvider,
        user_msg: &str,
        deadline: Duration,
    ) -> Result<AgentResponse, EngineError> {
        let request = ChatRequest {
            model: self.model().to_string(),
            messages: vec![system_message(self.system_prompt()), user_message(user_msg)],
            temperature: Some(self.temperature()),
            max_tokens: Some(self.max_tokens()),
            json_mode: self.json_mode(),
        };

        let response = tokio::time::timeout(deadline, provider.chat(&request))
            .await
            .map_err(|_| EngineError::UpstreamTimeout(deadline))??;

        tracing::debug!(
            agent = self.name(),
            model = self.model(),
            tokens = response.usage.total_tokens,
            "agent call completed"
        );

        Ok(AgentResponse {
            content: response.content,
            usage: response.usage,
            finish_reason: response.finish_reason,
        })
    }
}
