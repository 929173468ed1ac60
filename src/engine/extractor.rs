//! Extractor/decider: the per-iteration LLM call.
//!
//! Returns atomic claims anchored to evidence chunks plus the loop's next
//! action. Parsing is strictly lenient: claims that do not reference at
//! least one chunk present in the evidence pool are dropped, unknown
//! enums default, and a completely unparseable response degrades to
//! "no claims, retrieve again" so the loop can converge or hard-stop on
//! its own terms.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use super::coerce;
use super::planner::SubqueryDef;
use super::provider::LlmProvider;
use super::traits::{Agent, AgentResponse};
use crate::config::EngineConfig;
use crate::model::QueryStrategy;

/// Maximum tokens for the extractor response.
const EXTRACTOR_MAX_TOKENS: u32 = 8192;

/// Cap on claims accepted from a single response.
const MAX_CLAIMS_PER_STEP: usize = 100;

/// Cap on clarifying questions accepted from a single response.
const MAX_QUESTIONS: usize = 10;

/// Action the decider chose for the next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Run more subqueries.
    Retrieve,
    /// Suggest a not-yet-indexed page.
    ExpandCorpus,
    /// Ask the user for clarification.
    Clarify,
    /// Assemble the final answer.
    Answer,
}

impl NextAction {
    /// Stable string form used in events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retrieve => "retrieve",
            Self::ExpandCorpus => "expand_corpus",
            Self::Clarify => "clarify",
            Self::Answer => "answer",
        }
    }
}

/// One extracted claim: a slot value plus the chunks that support it.
#[derive(Debug, Clone)]
pub struct ClaimDef {
    /// Slot name the claim fills.
    pub slot: String,
    /// Parent-list key, mappings only.
    pub key: Option<String>,
    /// Extracted value.
    pub value: Value,
    /// Extractor confidence in `[0, 1]`.
    pub confidence: f32,
    /// Evidence chunks; always at least one after parsing.
    pub chunk_ids: Vec<Uuid>,
}

/// Normalised extractor output.
#[derive(Debug, Clone)]
pub struct ExtractOutput {
    /// Accepted claims.
    pub claims: Vec<ClaimDef>,
    /// Next action.
    pub next_action: NextAction,
    /// Short rationale surfaced to the UI.
    pub why: String,
    /// Subqueries for the next iteration, when retrieving.
    pub subqueries: Vec<SubqueryDef>,
    /// Clarifying questions, when clarifying.
    pub questions: Vec<String>,
    /// 1-based pick into the offered candidate pages, when expanding.
    pub suggested_page_index: Option<usize>,
    /// Broad slots the decider asserts are fully swept.
    pub broad_completed: Vec<String>,
    /// True when the response failed to parse and this is the fallback.
    pub parse_error: bool,
}

impl ExtractOutput {
    /// The fallback produced when the model response cannot be parsed:
    /// no claims, retrieve again. The loop then converges or stalls into
    /// a hard stop naturally.
    #[must_use]
    pub fn parse_fallback() -> Self {
        Self {
            claims: Vec::new(),
            next_action: NextAction::Retrieve,
            why: "Parse error".to_string(),
            subqueries: Vec::new(),
            questions: Vec::new(),
            suggested_page_index: None,
            broad_completed: Vec::new(),
            parse_error: true,
        }
    }
}

/// Agent that extracts claims and decides the loop's next action.
pub struct ExtractorAgent {
    model: String,
    system_prompt: String,
}

impl ExtractorAgent {
    /// Creates a new extractor agent with the given configuration and
    /// system prompt.
    #[must_use]
    pub fn new(config: &EngineConfig, system_prompt: String) -> Self {
        Self {
            model: config.extractor_model.clone(),
            system_prompt,
        }
    }

    /// Executes the agent and parses its response against the evidence
    /// pool. Transport failures propagate; malformed output degrades to
    /// [`ExtractOutput::parse_fallback`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::EngineError`] on transport failures only.
    pub async fn execute_and_parse(
        &self,
        provider: &dyn LlmProvider,
        user_msg: &str,
        evidence_ids: &[Uuid],
        deadline: Duration,
    ) -> Result<(ExtractOutput, AgentResponse), crate::error::EngineError> {
        let response = match self.execute(provider, user_msg, deadline).await {
            Ok(response) => response,
            Err(crate::error::EngineError::UpstreamTimeout(elapsed)) => {
                // A timed-out decider surfaces as a parse-error fallback:
                // the loop keeps its budgets and stops on stagnation.
                tracing::warn!(?elapsed, "extractor timed out; treating as parse error");
                return Ok((
                    ExtractOutput::parse_fallback(),
                    AgentResponse {
                        content: String::new(),
                        usage: super::message::TokenUsage::default(),
                        finish_reason: None,
                    },
                ));
            }
            Err(err) => return Err(err),
        };

        let output = parse_extract(&response.content, evidence_ids)
            .unwrap_or_else(ExtractOutput::parse_fallback);
        Ok((output, response))
    }
}

#[async_trait]
impl Agent for ExtractorAgent {
    fn name(&self) -> &'static str {
        "extractor"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn max_tokens(&self) -> u32 {
        EXTRACTOR_MAX_TOKENS
    }
}

/// Resolves one raw chunk reference against the evidence pool.
///
/// Accepts chunk ids verbatim; bare integers are a fallback, read as
/// 1-based positions in the evidence block.
fn resolve_chunk_ref(raw: &Value, evidence_ids: &[Uuid]) -> Option<Uuid> {
    match raw {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(id) = Uuid::parse_str(trimmed) {
                return evidence_ids.contains(&id).then_some(id);
            }
            trimmed
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|idx| evidence_ids.get(idx).copied())
        }
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| evidence_ids.get(idx).copied()),
        _ => None,
    }
}

/// Parses and normalises raw extractor output. `None` when the content is
/// not a JSON object.
#[must_use]
pub fn parse_extract(content: &str, evidence_ids: &[Uuid]) -> Option<ExtractOutput> {
    let value: Value = serde_json::from_str(coerce::strip_code_fences(content)).ok()?;
    if !value.is_object() {
        return None;
    }

    let next_action = match coerce::field_str(&value, "next_action").as_deref() {
        Some("answer") => NextAction::Answer,
        Some("clarify") => NextAction::Clarify,
        Some("expand_corpus") => NextAction::ExpandCorpus,
        _ => NextAction::Retrieve,
    };
    let why = coerce::field_str(&value, "why").unwrap_or_default();

    let mut claims: Vec<ClaimDef> = Vec::new();
    for raw in coerce::field_array(&value, "claims") {
        if claims.len() >= MAX_CLAIMS_PER_STEP {
            tracing::warn!("claim cap reached; dropping the remainder");
            break;
        }
        let Some(slot) = coerce::field_str(raw, "slot") else {
            continue;
        };
        let Some(claim_value) = raw.get("value") else {
            continue;
        };
        if claim_value.is_null() {
            continue;
        }

        let mut chunk_ids: Vec<Uuid> = Vec::new();
        for chunk_ref in coerce::field_array(raw, "chunkIds") {
            if let Some(id) = resolve_chunk_ref(chunk_ref, evidence_ids)
                && !chunk_ids.contains(&id)
            {
                chunk_ids.push(id);
            }
        }
        // A claim without supporting evidence is inadmissible.
        if chunk_ids.is_empty() {
            tracing::debug!(slot = %slot, "dropping claim without valid chunk references");
            continue;
        }

        claims.push(ClaimDef {
            slot,
            key: coerce::field_str(raw, "key"),
            value: claim_value.clone(),
            confidence: coerce::field_unit_f32(raw, "confidence").unwrap_or(0.5),
            chunk_ids,
        });
    }

    let mut subqueries: Vec<SubqueryDef> = Vec::new();
    if next_action == NextAction::Retrieve {
        for raw in coerce::field_array(&value, "subqueries") {
            let Some(slot) = coerce::field_str(raw, "slot") else {
                continue;
            };
            let Some(query) = coerce::field_str(raw, "query") else {
                continue;
            };
            let strategy = match coerce::field_str(raw, "strategy").as_deref() {
                Some("broad") => QueryStrategy::Broad,
                _ => QueryStrategy::Targeted,
            };
            subqueries.push(SubqueryDef {
                slot,
                query,
                strategy,
            });
        }
    }

    let mut questions = coerce::field_string_array(&value, "questions");
    questions.truncate(MAX_QUESTIONS);

    let suggested_page_index = coerce::field_u32(&value, "suggested_page_index")
        .map(|n| usize::try_from(n).unwrap_or(usize::MAX));

    Some(ExtractOutput {
        claims,
        next_action,
        why,
        subqueries,
        questions,
        suggested_page_index,
        broad_completed: coerce::field_string_array(&value, "broad_query_completed_slot_fully"),
        parse_error: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_parse_extract_basic() {
        let evidence = ids(2);
        let content = json!({
            "claims": [
                {"slot": "birth_year", "value": 1942, "confidence": 0.95,
                 "chunkIds": [evidence[0].to_string()]}
            ],
            "next_action": "answer",
            "why": "single fact found"
        })
        .to_string();
        let out = parse_extract(&content, &evidence).unwrap_or_else(|| unreachable!());
        assert_eq!(out.claims.len(), 1);
        assert_eq!(out.claims[0].chunk_ids, vec![evidence[0]]);
        assert_eq!(out.next_action, NextAction::Answer);
        assert!(!out.parse_error);
    }

    #[test]
    fn test_claims_without_valid_chunks_dropped() {
        let evidence = ids(1);
        let content = json!({
            "claims": [
                {"slot": "a", "value": "x", "chunkIds": [Uuid::new_v4().to_string()]},
                {"slot": "b", "value": "y", "chunkIds": []},
                {"slot": "c", "value": "z"}
            ],
            "next_action": "retrieve"
        })
        .to_string();
        let out = parse_extract(&content, &evidence).unwrap_or_else(|| unreachable!());
        assert!(out.claims.is_empty());
    }

    #[test]
    fn test_numeric_chunk_index_fallback() {
        let evidence = ids(3);
        let content = json!({
            "claims": [
                {"slot": "a", "value": "x", "chunkIds": [2]},
                {"slot": "b", "value": "y", "chunkIds": ["3"]},
                {"slot": "c", "value": "z", "chunkIds": [0]},
                {"slot": "d", "value": "w", "chunkIds": [9]}
            ],
            "next_action": "retrieve"
        })
        .to_string();
        let out = parse_extract(&content, &evidence).unwrap_or_else(|| unreachable!());
        // 1-based: [2] → evidence[1], "3" → evidence[2]; 0 and 9 resolve to nothing.
        assert_eq!(out.claims.len(), 2);
        assert_eq!(out.claims[0].chunk_ids, vec![evidence[1]]);
        assert_eq!(out.claims[1].chunk_ids, vec![evidence[2]]);
    }

    #[test]
    fn test_subqueries_only_for_retrieve() {
        let content = json!({
            "claims": [],
            "next_action": "answer",
            "subqueries": [{"slot": "a", "query": "ignored"}]
        })
        .to_string();
        let out = parse_extract(&content, &[]).unwrap_or_else(|| unreachable!());
        assert!(out.subqueries.is_empty());

        let content = json!({
            "claims": [],
            "next_action": "retrieve",
            "subqueries": [{"slot": "a", "query": "kept", "strategy": "broad"}]
        })
        .to_string();
        let out = parse_extract(&content, &[]).unwrap_or_else(|| unreachable!());
        assert_eq!(out.subqueries.len(), 1);
        assert_eq!(out.subqueries[0].strategy, QueryStrategy::Broad);
    }

    #[test]
    fn test_unknown_action_defaults_to_retrieve() {
        let content = json!({"claims": [], "next_action": "meditate"}).to_string();
        let out = parse_extract(&content, &[]).unwrap_or_else(|| unreachable!());
        assert_eq!(out.next_action, NextAction::Retrieve);
    }

    #[test]
    fn test_parse_fallback_on_garbage() {
        assert!(parse_extract("not json at all", &[]).is_none());
        let fallback = ExtractOutput::parse_fallback();
        assert!(fallback.parse_error);
        assert_eq!(fallback.next_action, NextAction::Retrieve);
        assert_eq!(fallback.why, "Parse error");
    }

    #[test]
    fn test_duplicate_chunk_refs_deduped() {
        let evidence = ids(1);
        let content = json!({
            "claims": [{
                "slot": "a", "value": "x",
                "chunkIds": [evidence[0].to_string(), evidence[0].to_string(), 1]
            }],
            "next_action": "retrieve"
        })
        .to_string();
        let out = parse_extract(&content, &evidence).unwrap_or_else(|| unreachable!());
        assert_eq!(out.claims[0].chunk_ids, vec![evidence[0]]);
    }

    #[test]
    fn test_suggested_page_index_and_broad_completed() {
        let content = json!({
            "claims": [],
            "next_action": "expand_corpus",
            "suggested_page_index": 3,
            "broad_query_completed_slot_fully": ["offices"]
        })
        .to_string();
        let out = parse_extract(&content, &[]).unwrap_or_else(|| unreachable!());
        assert_eq!(out.next_action, NextAction::ExpandCorpus);
        assert_eq!(out.suggested_page_index, Some(3));
        assert_eq!(out.broad_completed, vec!["offices".to_string()]);
    }
}
