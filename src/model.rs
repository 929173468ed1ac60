//! Domain entities shared by the reasoning engine and the datastore.
//!
//! Identities are stable UUIDs minted by whichever side creates the row.
//! Structs here are plain data; all behavior lives in the engine modules.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A dialogue container owned by one user.
#[derive(Debug, Clone)]
pub struct Conversation {
    /// Stable identity.
    pub id: Uuid,
    /// Owning user, when the surface layer supplies one.
    pub owner_id: Option<Uuid>,
    /// When set, the engine may suggest not-yet-indexed pages for this
    /// conversation instead of searching further.
    pub dynamic_sources: bool,
}

/// A crawled site attached to a conversation.
#[derive(Debug, Clone)]
pub struct Source {
    /// Stable identity.
    pub id: Uuid,
    /// Conversation this source belongs to.
    pub conversation_id: Uuid,
    /// Site domain, e.g. `"en.wikipedia.org"`.
    pub domain: String,
    /// Root URL the crawl started from.
    pub root_url: String,
}

/// Indexing status of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Discovered but not yet chunked/embedded.
    Pending,
    /// Fully indexed; eligible for retrieval.
    Indexed,
    /// Indexing failed.
    Failed,
}

impl PageStatus {
    /// Stable string form used in persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Indexed => "indexed",
            Self::Failed => "failed",
        }
    }

    /// Parses the persisted string form; unknown values map to `Pending`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "indexed" => Self::Indexed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// An indexed page belonging to one source.
#[derive(Debug, Clone)]
pub struct Page {
    /// Stable identity.
    pub id: Uuid,
    /// Source this page belongs to.
    pub source_id: Uuid,
    /// Page title.
    pub title: String,
    /// Site-relative path.
    pub path: String,
    /// Absolute URL.
    pub url: String,
    /// Indexing status.
    pub status: PageStatus,
}

/// An immutable text window of a page, enriched with page/source metadata
/// the way the similarity RPC returns it.
///
/// `distance` is attached only when the chunk came back from a similarity
/// query; lead chunks carry `None`.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Stable identity.
    pub id: Uuid,
    /// Page this chunk belongs to.
    pub page_id: Uuid,
    /// Chunk text.
    pub content: String,
    /// Title of the owning page.
    pub page_title: String,
    /// Site-relative path of the owning page.
    pub page_path: String,
    /// Domain of the owning source.
    pub source_domain: String,
    /// Cosine-like distance (smaller is better) when similarity-matched.
    pub distance: Option<f32>,
}

/// An outbound URL observed during crawl whose target is not yet an
/// indexed page.
#[derive(Debug, Clone)]
pub struct DiscoveredLink {
    /// Target URL.
    pub to_url: String,
    /// Anchor text the link was found under.
    pub anchor_text: String,
    /// Text snippet around the link.
    pub snippet: String,
    /// Source the link was discovered in.
    pub source_id: Uuid,
    /// Page the link was discovered on, when known.
    pub from_page_id: Option<Uuid>,
    /// Cosine-like distance when similarity-matched.
    pub distance: Option<f32>,
}

/// Role of a dialogue turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    /// End-user turn.
    User,
    /// Engine-produced turn.
    Assistant,
}

impl MessageRole {
    /// Stable string form used in persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parses the persisted string form; unknown values map to `User`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s == "assistant" { Self::Assistant } else { Self::User }
    }
}

/// A dialogue turn.
#[derive(Debug, Clone)]
pub struct Message {
    /// Stable identity.
    pub id: Uuid,
    /// Conversation this message belongs to.
    pub conversation_id: Uuid,
    /// Monotonic position within the conversation.
    pub seq: i64,
    /// Turn role.
    pub role: MessageRole,
    /// Turn text.
    pub content: String,
    /// Serialized reasoning trace, assistant turns only.
    pub thought_process: Option<serde_json::Value>,
    /// Serialized page suggestion, assistant turns only.
    pub suggested_page: Option<serde_json::Value>,
    /// Rendered form of a page scraped on the user's behalf.
    pub scraped_page_display: Option<String>,
    /// Assistant message this turn re-answers, in ask-again threads.
    pub follows_message_id: Option<Uuid>,
}

/// Action taken by one iteration of the reasoning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Initial plan over the question.
    Plan,
    /// Run subqueries against the chunk store.
    Retrieve,
    /// Assemble the final answer.
    Answer,
    /// Suggest a not-yet-indexed page.
    ExpandCorpus,
    /// Ask the user for clarification.
    Clarify,
}

impl StepAction {
    /// Stable string form used in persistence and events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Retrieve => "retrieve",
            Self::Answer => "answer",
            Self::ExpandCorpus => "expand_corpus",
            Self::Clarify => "clarify",
        }
    }

    /// Parses the persisted string form; unknown values map to `Retrieve`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "plan" => Self::Plan,
            "answer" => Self::Answer,
            "expand_corpus" => Self::ExpandCorpus,
            "clarify" => Self::Clarify,
            _ => Self::Retrieve,
        }
    }
}

/// One iteration of the loop, keyed by `(root_message_id, iteration)`.
#[derive(Debug, Clone)]
pub struct ReasoningStep {
    /// Root user message identifying the run.
    pub root_message_id: Uuid,
    /// 0 for the plan step, then 1-based loop iterations.
    pub iteration: u32,
    /// Action this iteration took.
    pub action: StepAction,
    /// Short rationale surfaced to the UI.
    pub why: String,
    /// Overall completeness after this iteration, in `[0, 1]`.
    pub completeness_score: f32,
}

/// Retrieval strategy of a subquery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStrategy {
    /// First, wide sweep for a list/mapping slot.
    Broad,
    /// Follow-up query aimed at a specific gap.
    Targeted,
}

impl QueryStrategy {
    /// Stable string form used in persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Broad => "broad",
            Self::Targeted => "targeted",
        }
    }

    /// Parses the persisted string form; unknown values map to `Targeted`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s == "broad" { Self::Broad } else { Self::Targeted }
    }
}

/// A subquery tied to one reasoning step.
#[derive(Debug, Clone)]
pub struct SubqueryRecord {
    /// Slot this subquery serves, when tied to one.
    pub slot_id: Option<Uuid>,
    /// Query text sent to the embedder.
    pub query_text: String,
    /// Retrieval strategy.
    pub strategy: QueryStrategy,
}

/// Shape of information a slot tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    /// Exactly one value sought.
    Scalar,
    /// An ordered set of items.
    List,
    /// A per-key value where keys come from a parent list.
    Mapping,
}

impl SlotKind {
    /// Stable string form used in persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::List => "list",
            Self::Mapping => "mapping",
        }
    }

    /// Parses the persisted string form; unknown values map to `Scalar`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "list" => Self::List,
            "mapping" => Self::Mapping,
            _ => Self::Scalar,
        }
    }
}

/// A typed unit of information the question requires.
///
/// Slots form a DAG rooted in the slots with no dependency; a mapping slot
/// always depends on a list.
#[derive(Debug, Clone)]
pub struct Slot {
    /// Stable identity.
    pub id: Uuid,
    /// Root user message identifying the run that planned this slot.
    pub root_message_id: Uuid,
    /// Short machine-usable name, unique within the run.
    pub name: String,
    /// Human-readable description of what fills this slot.
    pub description: String,
    /// Slot shape.
    pub kind: SlotKind,
    /// Whether this slot counts toward overall completeness.
    pub required: bool,
    /// Slot whose values gate retrieval for this one.
    pub depends_on_slot_id: Option<Uuid>,
    /// Items sought; 0 means open-ended. For mappings this is
    /// `parent.target_item_count * items_per_key`.
    pub target_item_count: u32,
    /// Values sought per parent key; mappings only, at least 1.
    pub items_per_key: u32,
    /// Items currently held (count of slot items).
    pub current_item_count: u32,
    /// Retrieval attempts made for this slot.
    pub attempt_count: u32,
    /// Once true, no further subqueries are issued for this slot.
    /// Monotonic within a run.
    pub finished_querying: bool,
    /// Queries most recently run for this slot.
    pub last_queries: Vec<String>,
}

impl Slot {
    /// True while the slot is in its first, broad retrieval pass.
    #[must_use]
    pub const fn is_broad(&self) -> bool {
        self.attempt_count == 0 && matches!(self.kind, SlotKind::List | SlotKind::Mapping)
    }

    /// True when the slot no longer needs subqueries.
    #[must_use]
    pub const fn is_satisfied(&self) -> bool {
        match self.kind {
            SlotKind::Scalar => self.current_item_count >= 1,
            SlotKind::List | SlotKind::Mapping => {
                self.target_item_count > 0 && self.current_item_count >= self.target_item_count
            }
        }
    }
}

/// One extracted value populating a slot.
#[derive(Debug, Clone)]
pub struct SlotItem {
    /// Stable identity.
    pub id: Uuid,
    /// Slot this item fills.
    pub slot_id: Uuid,
    /// Parent-list value this item is keyed under; mandatory for mappings.
    pub key: Option<String>,
    /// Extracted value.
    pub value: serde_json::Value,
    /// Extractor-reported confidence in `[0, 1]`.
    pub confidence: f32,
    /// Whether the extractor considered the value final.
    pub complete: bool,
}

/// A persisted citation artifact pinned to one assistant message.
#[derive(Debug, Clone)]
pub struct Quote {
    /// Stable identity.
    pub id: Uuid,
    /// Assistant message this quote belongs to.
    pub message_id: Uuid,
    /// Page the cited chunk belongs to.
    pub page_id: Uuid,
    /// Cited chunk.
    pub chunk_id: Uuid,
    /// Rendered passage.
    pub snippet: String,
    /// Title of the cited page.
    pub page_title: String,
    /// Site-relative path of the cited page.
    pub page_path: String,
    /// Domain of the cited source.
    pub domain: String,
    /// Absolute URL of the cited page, when known.
    pub page_url: Option<String>,
    /// Page text immediately before the snippet, when not at the page edge.
    pub context_before: Option<String>,
    /// Page text immediately after the snippet, when not at the page edge.
    pub context_after: Option<String>,
    /// 1-based index of the `[n]` marker this quote backs.
    pub citation_order: u32,
}

/// A not-yet-indexed page the engine suggests adding to the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSuggestion {
    /// Suggested URL.
    pub url: String,
    /// Display title (anchor text or derived from the URL).
    pub title: String,
    /// Snippet around the discovered link.
    pub snippet: String,
    /// Source the link was discovered in.
    pub source_id: Uuid,
    /// Title of the page the link was discovered on, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_page_title: Option<String>,
}
