//! Progress events streamed to the caller as NDJSON.
//!
//! One JSON object per line, one shape per object. `thoughtProcess`
//! lines grow monotonically: every emission carries all steps so far, so
//! clients may recompute derived views from the last line alone.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::completeness::FillStatus;
use crate::model::{PageSuggestion, Quote};

/// Slot summary inside the plan and thought-process shapes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotView {
    /// Slot name.
    pub name: String,
    /// Slot type string.
    pub kind: String,
    /// Human description.
    pub description: String,
    /// Whether the slot counts toward completeness.
    pub required: bool,
    /// Item target, 0 when open-ended.
    pub target_item_count: u32,
    /// Name of the slot this one depends on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
}

/// One subquery inside a thought step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubqueryView {
    /// Slot the subquery served.
    pub slot: String,
    /// Query text.
    pub query: String,
    /// Chunks retrieved for this query.
    pub chunks_found: usize,
}

/// One iteration inside the thought process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThoughtStep {
    /// 1-based iteration number.
    pub iter: u32,
    /// Action the iteration took.
    pub action: String,
    /// Decider rationale.
    pub why: String,
    /// Subqueries run this iteration.
    pub subqueries: Vec<SubqueryView>,
    /// Claims recorded this iteration.
    pub claims: usize,
    /// Overall completeness after this iteration.
    pub completeness: f32,
    /// Fill status per slot name.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub fill_status: HashMap<String, FillStatus>,
}

/// The accumulated reasoning trace, persisted on the assistant message
/// and streamed as it grows.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThoughtProcess {
    /// Planned slots.
    pub slots: Vec<SlotView>,
    /// Planner rationale.
    pub plan_reason: String,
    /// One entry per completed iteration.
    pub steps: Vec<ThoughtStep>,
    /// Why the loop hard-stopped, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hard_stop_reason: Option<String>,
    /// Extraction problems worth surfacing (parse failures, ignored
    /// assertions).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extraction_gaps: Vec<String>,
    /// Note attached when the answer is known to be partial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_answer_note: Option<String>,
    /// Questions surfaced on the clarify path.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clarify_questions: Vec<String>,
    /// Rationale attached on the expand-corpus path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expand_corpus_reason: Option<String>,
}

/// Plan summary, the first line of every stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanView {
    /// First action (`retrieve` or `clarify`).
    pub action: String,
    /// Planner rationale.
    pub why: String,
    /// Planned slots.
    pub slots: Vec<SlotView>,
    /// Initial subqueries (slot, query) pairs.
    pub subqueries: Vec<PlanSubqueryView>,
}

/// One planned subquery inside the plan shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSubqueryView {
    /// Slot the subquery serves.
    pub slot: String,
    /// Query text.
    pub query: String,
    /// Retrieval strategy.
    pub strategy: String,
}

/// Per-step progress line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    /// 1-based position in the stream of progress lines.
    pub step: u32,
    /// Total steps the run may take.
    pub total_steps: u32,
    /// Iteration this line reports.
    pub iter: u32,
    /// Action taken.
    pub action: String,
    /// Short human label for the progress UI.
    pub label: String,
    /// Decider rationale.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub why: Option<String>,
    /// Evidence chunks in the pool after this iteration.
    pub quotes_found: usize,
    /// Claims recorded this iteration.
    pub claims: usize,
    /// Overall completeness.
    pub completeness: f32,
    /// Fill status per slot name, when configured on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_status_by_slot: Option<HashMap<String, FillStatus>>,
}

/// Quote as rendered on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteOut {
    /// Quote id, opaque to the caller.
    pub id: Uuid,
    /// Source the quote's page belongs to.
    pub source_id: Uuid,
    /// Page the quote cites.
    pub page_id: Uuid,
    /// Rendered passage.
    pub snippet: String,
    /// Page title.
    pub page_title: String,
    /// Site-relative page path.
    pub page_path: String,
    /// Source domain.
    pub domain: String,
    /// Absolute page URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    /// Page text before the snippet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_before: Option<String>,
    /// Page text after the snippet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_after: Option<String>,
}

impl QuoteOut {
    /// Builds the wire shape from a persisted quote and its source id.
    #[must_use]
    pub fn from_quote(quote: &Quote, source_id: Uuid) -> Self {
        Self {
            id: quote.id,
            source_id,
            page_id: quote.page_id,
            snippet: quote.snippet.clone(),
            page_title: quote.page_title.clone(),
            page_path: quote.page_path.clone(),
            domain: quote.domain.clone(),
            page_url: quote.page_url.clone(),
            context_before: quote.context_before.clone(),
            context_after: quote.context_after.clone(),
        }
    }
}

/// Terminal line of a successful stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneEvent {
    /// Always true.
    pub done: bool,
    /// Assistant message text.
    pub message: String,
    /// Quotes backing the message's citations, by citation order.
    pub quotes: Vec<QuoteOut>,
    /// Suggested page on the expand-corpus path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_page: Option<PageSuggestion>,
    /// Title of the suggested page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_title: Option<String>,
    /// Final reasoning trace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_process: Option<ThoughtProcess>,
}

/// One NDJSON line. Serialized untagged: each variant contributes its own
/// top-level keys, so a line carries exactly one shape.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EngineEvent {
    /// The plan, first line of the stream.
    Plan {
        /// Plan summary.
        plan: PlanView,
    },
    /// The growing reasoning trace.
    Thought {
        /// Trace so far.
        #[serde(rename = "thoughtProcess")]
        thought_process: ThoughtProcess,
    },
    /// Per-step progress.
    Step(StepEvent),
    /// Clarifying questions for the user.
    Clarify {
        /// Always true.
        clarify: bool,
        /// Questions to relay.
        questions: Vec<String>,
    },
    /// Terminal success line.
    Done(DoneEvent),
    /// Terminal failure line.
    Error {
        /// Human-readable error.
        error: String,
    },
}

/// Sends engine events to the response stream.
///
/// Send failures mean the client went away; the pipeline keeps running so
/// terminal persistence stays consistent, and drops are logged at debug.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<EngineEvent>,
}

impl EventSink {
    /// Wraps an mpsc sender.
    #[must_use]
    pub const fn new(sender: mpsc::Sender<EngineEvent>) -> Self {
        Self { sender }
    }

    /// Creates a sink and its receiving half with the given buffer.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (Self::new(sender), receiver)
    }

    /// Emits one event, ignoring a disconnected receiver.
    pub async fn emit(&self, event: EngineEvent) {
        if self.sender.send(event).await.is_err() {
            tracing::debug!("event receiver dropped; continuing pipeline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_shapes_one_key_each() {
        let plan = EngineEvent::Plan {
            plan: PlanView {
                action: "retrieve".to_string(),
                why: "w".to_string(),
                slots: Vec::new(),
                subqueries: Vec::new(),
            },
        };
        let value = serde_json::to_value(&plan).unwrap_or_default();
        assert!(value.get("plan").is_some());
        assert!(value.get("thoughtProcess").is_none());

        let error = EngineEvent::Error {
            error: "boom".to_string(),
        };
        let value = serde_json::to_value(&error).unwrap_or_default();
        assert_eq!(value.get("error").and_then(|v| v.as_str()), Some("boom"));
    }

    #[test]
    fn test_done_event_wire_naming() {
        let done = EngineEvent::Done(DoneEvent {
            done: true,
            message: "m".to_string(),
            quotes: Vec::new(),
            suggested_page: None,
            suggested_title: Some("T".to_string()),
            thought_process: None,
        });
        let value = serde_json::to_value(&done).unwrap_or_default();
        assert_eq!(value.get("done").and_then(serde_json::Value::as_bool), Some(true));
        assert!(value.get("suggestedTitle").is_some());
        assert!(value.get("suggested_title").is_none());
        assert!(value.get("thoughtProcess").is_none());
    }

    #[test]
    fn test_thought_process_omits_empty_optionals() {
        let thought = ThoughtProcess::default();
        let value = serde_json::to_value(&thought).unwrap_or_default();
        assert!(value.get("hardStopReason").is_none());
        assert!(value.get("extractionGaps").is_none());
        assert!(value.get("planReason").is_some());
    }

    #[test]
    fn test_step_event_camel_case() {
        let step = EngineEvent::Step(StepEvent {
            step: 1,
            total_steps: 6,
            iter: 1,
            action: "retrieve".to_string(),
            label: "Searching".to_string(),
            why: None,
            quotes_found: 3,
            claims: 1,
            completeness: 0.5,
            fill_status_by_slot: None,
        });
        let value = serde_json::to_value(&step).unwrap_or_default();
        assert!(value.get("totalSteps").is_some());
        assert!(value.get("quotesFound").is_some());
        assert!(value.get("why").is_none());
    }

    #[tokio::test]
    async fn test_sink_survives_dropped_receiver() {
        let (sink, receiver) = EventSink::channel(4);
        drop(receiver);
        sink.emit(EngineEvent::Error {
            error: "ignored".to_string(),
        })
        .await;
    }
}
