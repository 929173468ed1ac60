//! Final answer assembly: evidence selection, the answer-writing LLM
//! call, citation rewriting, and quote persistence.
//!
//! Evidence for the final call is selected per slot (each slot
//! contributes the chunks its items cite) and merged under the fair
//! allocator, so late-found evidence is represented against early-found
//! evidence. The model's `[[quote:<chunk_id>]]` placeholders are rewritten
//! to `[k]` markers and every cited chunk becomes one persisted Quote.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::citations::{page_context, rewrite_citations, sentence_snippet};
use super::coerce;
use super::context::RunContext;
use super::prompt::build_finalizer_prompt;
use super::provider::LlmProvider;
use super::select::fair_merge;
use super::traits::Agent;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::{Chunk, Message, Quote};
use crate::store::{Datastore, NewAssistantMessage};

/// Maximum tokens for the finalizer response.
const FINALIZER_MAX_TOKENS: u32 = 4096;

/// Agent that writes the final cited answer.
pub struct FinalizerAgent {
    model: String,
    system_prompt: String,
}

impl FinalizerAgent {
    /// Creates a new finalizer agent with the given configuration and
    /// system prompt.
    #[must_use]
    pub fn new(config: &EngineConfig, system_prompt: String) -> Self {
        Self {
            model: config.finalizer_model.clone(),
            system_prompt,
        }
    }
}

#[async_trait]
impl Agent for FinalizerAgent {
    fn name(&self) -> &'static str {
        "finalizer"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn temperature(&self) -> f32 {
        0.1
    }

    fn max_tokens(&self) -> u32 {
        FINALIZER_MAX_TOKENS
    }
}

/// Parsed finalizer output.
#[derive(Debug, Clone)]
pub struct FinalizerOutput {
    /// Answer text with `[[quote:<chunk_id>]]` placeholders.
    pub final_answer: String,
    /// Verbatim passage per cited chunk id.
    pub cited_snippets: HashMap<Uuid, String>,
}

/// Parses the finalizer response. A non-JSON response degrades to the raw
/// text with no snippets, so the zero-placeholder compromise can still
/// attach citations.
#[must_use]
pub fn parse_finalizer(content: &str) -> FinalizerOutput {
    let stripped = coerce::strip_code_fences(content);
    let Ok(value) = serde_json::from_str::<Value>(stripped) else {
        return FinalizerOutput {
            final_answer: stripped.to_string(),
            cited_snippets: HashMap::new(),
        };
    };
    if !value.is_object() {
        return FinalizerOutput {
            final_answer: stripped.to_string(),
            cited_snippets: HashMap::new(),
        };
    }

    let final_answer = coerce::field_str(&value, "final_answer").unwrap_or_default();

    let mut cited_snippets = HashMap::new();
    if let Some(map) = value.get("cited_snippets").and_then(Value::as_object) {
        for (key, snippet) in map {
            if let (Ok(id), Some(text)) = (Uuid::parse_str(key.trim()), snippet.as_str())
                && !text.trim().is_empty()
            {
                cited_snippets.insert(id, text.trim().to_string());
            }
        }
    }

    FinalizerOutput {
        final_answer,
        cited_snippets,
    }
}

/// Selects the evidence offered to the final call: per-slot cited chunks,
/// fair-merged under the configured cap.
#[must_use]
pub fn select_final_evidence(
    evidence_by_slot: &[(Uuid, Vec<Uuid>)],
    pool: &[Chunk],
    cap: usize,
) -> Vec<Chunk> {
    let by_id: HashMap<Uuid, &Chunk> = pool.iter().map(|c| (c.id, c)).collect();
    let lists: Vec<Vec<Chunk>> = evidence_by_slot
        .iter()
        .map(|(_, chunk_ids)| {
            chunk_ids
                .iter()
                .filter_map(|id| by_id.get(id).map(|&c| c.clone()))
                .collect()
        })
        .filter(|list: &Vec<Chunk>| !list.is_empty())
        .collect();
    fair_merge(&lists, cap)
}

/// The assembled final answer, persisted and ready to stream.
pub struct BuiltAnswer {
    /// The persisted assistant message.
    pub message: Message,
    /// Quotes backing the message's citations, by citation order.
    pub quotes: Vec<Quote>,
}

/// Builds, persists, and returns the final answer for a run.
///
/// # Errors
///
/// Returns [`EngineError`] on LLM transport failures or persistence
/// failures on the terminal insert.
#[allow(clippy::too_many_arguments)]
pub async fn build_final_answer(
    store: &Arc<dyn Datastore>,
    provider: &dyn LlmProvider,
    config: &EngineConfig,
    finalizer_prompt: String,
    run: &RunContext,
    question: &str,
    slot_state: &Value,
    evidence_pool: &[Chunk],
    thought_process: Value,
    scraped_page_display: Option<String>,
) -> Result<BuiltAnswer, EngineError> {
    let evidence_by_slot = store.evidence_chunks_by_slot(run.root_message_id).await?;
    let offered = select_final_evidence(
        &evidence_by_slot,
        evidence_pool,
        config.final_answer_chunks_cap,
    );
    let offered_ids: Vec<Uuid> = offered.iter().map(|c| c.id).collect();

    let agent = FinalizerAgent::new(config, finalizer_prompt);
    let user_msg = build_finalizer_prompt(question, slot_state, &offered);
    let output = match agent
        .execute(provider, &user_msg, config.llm_timeout)
        .await
    {
        Ok(response) => parse_finalizer(&response.content),
        Err(EngineError::UpstreamTimeout(elapsed)) => {
            tracing::warn!(?elapsed, "finalizer timed out; answering from slot state");
            FinalizerOutput {
                final_answer: String::new(),
                cited_snippets: HashMap::new(),
            }
        }
        Err(err) => return Err(err),
    };

    let answer_text = if output.final_answer.trim().is_empty() {
        "I gathered the evidence below but could not compose a narrative answer.".to_string()
    } else {
        output.final_answer
    };

    let rewritten = rewrite_citations(&answer_text, &offered_ids);

    let message = store
        .insert_assistant_message(NewAssistantMessage {
            conversation_id: run.conversation.id,
            content: rewritten.text.clone(),
            thought_process: Some(thought_process),
            suggested_page: None,
            scraped_page_display,
            follows_message_id: run.follows_message_id,
        })
        .await?;

    let chunk_by_id: HashMap<Uuid, &Chunk> = offered.iter().map(|c| (c.id, c)).collect();
    let mut quotes: Vec<Quote> = Vec::with_capacity(rewritten.ordered_chunk_ids.len());

    for (index, chunk_id) in rewritten.ordered_chunk_ids.iter().enumerate() {
        let Some(chunk) = chunk_by_id.get(chunk_id) else {
            continue;
        };
        let snippet = output
            .cited_snippets
            .get(chunk_id)
            .cloned()
            .unwrap_or_else(|| sentence_snippet(&chunk.content, config.quote_snippet_max_chars));

        let page_content = store.get_page_content(chunk.page_id).await?;
        let located = page_content
            .as_deref()
            .and_then(|page| page_context(page, &snippet, config.page_context_chars));
        let (context_before, context_after) =
            located.map_or((None, None), |c| (c.before, c.after));

        let quote = Quote {
            id: Uuid::new_v4(),
            message_id: message.id,
            page_id: chunk.page_id,
            chunk_id: *chunk_id,
            snippet,
            page_title: chunk.page_title.clone(),
            page_path: chunk.page_path.clone(),
            domain: chunk.source_domain.clone(),
            page_url: run.page_by_id.get(&chunk.page_id).map(|p| p.url.clone()),
            context_before,
            context_after,
            citation_order: u32::try_from(index + 1).unwrap_or(u32::MAX),
        };
        store.insert_quote(&quote).await?;
        quotes.push(quote);
    }

    Ok(BuiltAnswer { message, quotes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: Uuid, content: &str) -> Chunk {
        Chunk {
            id,
            page_id: Uuid::new_v4(),
            content: content.to_string(),
            page_title: "T".to_string(),
            page_path: "/t".to_string(),
            source_domain: "example.org".to_string(),
            distance: Some(0.1),
        }
    }

    #[test]
    fn test_parse_finalizer_valid() {
        let id = Uuid::new_v4();
        let content = serde_json::json!({
            "final_answer": format!("Born in 1942 [[quote:{id}]]."),
            "cited_snippets": {id.to_string(): "born November 20, 1942"}
        })
        .to_string();
        let output = parse_finalizer(&content);
        assert!(output.final_answer.contains("[[quote:"));
        assert_eq!(
            output.cited_snippets.get(&id).map(String::as_str),
            Some("born November 20, 1942")
        );
    }

    #[test]
    fn test_parse_finalizer_degrades_to_raw_text() {
        let output = parse_finalizer("A plain text answer, no JSON.");
        assert_eq!(output.final_answer, "A plain text answer, no JSON.");
        assert!(output.cited_snippets.is_empty());
    }

    #[test]
    fn test_parse_finalizer_drops_bad_snippet_keys() {
        let content = serde_json::json!({
            "final_answer": "x",
            "cited_snippets": {"not-a-uuid": "text", Uuid::new_v4().to_string(): "  "}
        })
        .to_string();
        let output = parse_finalizer(&content);
        assert!(output.cited_snippets.is_empty());
    }

    #[test]
    fn test_select_final_evidence_groups_by_slot() {
        let slot_a = Uuid::new_v4();
        let slot_b = Uuid::new_v4();
        let pool: Vec<Chunk> = (0..6)
            .map(|i| chunk(Uuid::new_v4(), &format!("chunk {i}")))
            .collect();
        let evidence = vec![
            (slot_a, pool[..4].iter().map(|c| c.id).collect::<Vec<_>>()),
            (slot_b, pool[4..].iter().map(|c| c.id).collect::<Vec<_>>()),
        ];
        let offered = select_final_evidence(&evidence, &pool, 4);
        assert_eq!(offered.len(), 4);
        // Both slots keep representation under the cap.
        let b_ids: Vec<Uuid> = pool[4..].iter().map(|c| c.id).collect();
        assert!(offered.iter().any(|c| b_ids.contains(&c.id)));
    }

    #[test]
    fn test_select_final_evidence_ignores_unknown_ids() {
        let slot = Uuid::new_v4();
        let pool = vec![chunk(Uuid::new_v4(), "present")];
        let evidence = vec![(slot, vec![pool[0].id, Uuid::new_v4()])];
        let offered = select_final_evidence(&evidence, &pool, 10);
        assert_eq!(offered.len(), 1);
    }

    #[test]
    fn test_select_final_evidence_empty() {
        assert!(select_final_evidence(&[], &[], 10).is_empty());
    }
}
