//! Datastore boundary.
//!
//! [`Datastore`] is the contract the reasoning engine consumes: the
//! similarity RPCs (`match_chunks`, `match_discovered_links`,
//! `get_lead_chunks`) plus conversation, message, slot, and quote
//! operations. The crawler/indexer writes the corpus tables; the engine
//! only reads them and writes its own run-scoped rows, partitioned by
//! root message id.
//!
//! [`SqliteStore`] is the bundled reference implementation.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    Chunk, Conversation, DiscoveredLink, Message, Page, Quote, ReasoningStep, Slot, SlotItem,
    Source, StepAction, SubqueryRecord,
};

/// Fields of an assistant message the engine persists at run termination.
#[derive(Debug, Clone)]
pub struct NewAssistantMessage {
    /// Conversation the message belongs to.
    pub conversation_id: Uuid,
    /// Message text.
    pub content: String,
    /// Serialized reasoning trace.
    pub thought_process: Option<serde_json::Value>,
    /// Serialized page suggestion for expand-corpus stubs.
    pub suggested_page: Option<serde_json::Value>,
    /// Rendered form of a page scraped on the user's behalf.
    pub scraped_page_display: Option<String>,
    /// Assistant message this one re-answers, in ask-again threads.
    pub follows_message_id: Option<Uuid>,
}

/// The datastore contract consumed by the reasoning engine.
///
/// All write operations the loop repeats are idempotent: slot items dedup
/// on `(slot, key, value)`, evidence rows on `(slot_item, chunk)`, and
/// reasoning steps on `(root, iteration)`. Replaying a step yields the
/// same row set.
#[async_trait]
pub trait Datastore: Send + Sync {
    // ── context ────────────────────────────────────────────────────────

    /// Loads a conversation by id.
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    /// Lists the sources attached to a conversation.
    async fn list_sources(&self, conversation_id: Uuid) -> Result<Vec<Source>, StoreError>;

    /// Lists the conversation's pages with status `indexed`.
    async fn list_indexed_pages(&self, conversation_id: Uuid) -> Result<Vec<Page>, StoreError>;

    /// Returns the full text content of a page, when stored.
    async fn get_page_content(&self, page_id: Uuid) -> Result<Option<String>, StoreError>;

    // ── messages ───────────────────────────────────────────────────────

    /// Loads a message by id.
    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Returns the latest user message positioned before `before` in the
    /// same conversation.
    async fn latest_user_message_before(
        &self,
        conversation_id: Uuid,
        before: Uuid,
    ) -> Result<Option<Message>, StoreError>;

    /// Returns the most recent messages of a conversation, oldest first.
    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Persists a terminal assistant message.
    async fn insert_assistant_message(
        &self,
        message: NewAssistantMessage,
    ) -> Result<Message, StoreError>;

    /// Clears the page suggestion carried by an assistant message.
    async fn clear_suggested_page(&self, message_id: Uuid) -> Result<(), StoreError>;

    // ── reasoning trace ────────────────────────────────────────────────

    /// Upserts one reasoning step keyed by `(root, iteration)`.
    async fn upsert_reasoning_step(&self, step: &ReasoningStep) -> Result<(), StoreError>;

    /// Records the subqueries executed by one step.
    async fn insert_subqueries(
        &self,
        root_message_id: Uuid,
        iteration: u32,
        subqueries: &[SubqueryRecord],
    ) -> Result<(), StoreError>;

    /// Returns the subqueries recorded for one step.
    async fn subqueries_for_iteration(
        &self,
        root_message_id: Uuid,
        iteration: u32,
    ) -> Result<Vec<SubqueryRecord>, StoreError>;

    /// Appends a diagnostic run-log row. Callers treat failures as
    /// non-fatal.
    async fn append_run_log(
        &self,
        root_message_id: Uuid,
        iteration: u32,
        action: StepAction,
        why: &str,
        completeness: f32,
    ) -> Result<(), StoreError>;

    // ── slots ──────────────────────────────────────────────────────────

    /// Inserts a planned slot.
    async fn insert_slot(&self, slot: &Slot) -> Result<(), StoreError>;

    /// Lists a run's slots with their current item counts.
    async fn list_slots(&self, root_message_id: Uuid) -> Result<Vec<Slot>, StoreError>;

    /// Bumps a slot's attempt count, replaces its last queries, and
    /// optionally latches `finished_querying` (monotonic: once set it is
    /// never cleared within a run).
    async fn update_slot_attempt(
        &self,
        slot_id: Uuid,
        queries: &[String],
        finished: bool,
    ) -> Result<(), StoreError>;

    /// Clears `finished_querying` on every slot of a run. Called when a
    /// re-ask rehydrates the run against an expanded corpus; the flag
    /// stays monotonic within each run.
    async fn reset_slot_querying(&self, root_message_id: Uuid) -> Result<(), StoreError>;

    /// Upserts one slot item, dedup key `(slot, key, value)`. Returns the
    /// id of the surviving row.
    async fn upsert_slot_item(&self, item: &SlotItem) -> Result<Uuid, StoreError>;

    /// Upserts one evidence association.
    async fn upsert_claim_evidence(
        &self,
        slot_item_id: Uuid,
        chunk_id: Uuid,
    ) -> Result<(), StoreError>;

    /// Lists the items currently held by a slot, insertion order.
    async fn slot_items(&self, slot_id: Uuid) -> Result<Vec<SlotItem>, StoreError>;

    /// For each slot of a run, the distinct chunk ids its items cite,
    /// in citation insertion order. Slots with no evidence are omitted.
    async fn evidence_chunks_by_slot(
        &self,
        root_message_id: Uuid,
    ) -> Result<Vec<(Uuid, Vec<Uuid>)>, StoreError>;

    // ── similarity RPCs ────────────────────────────────────────────────

    /// Top-`count` chunks among `page_ids` by ascending distance to the
    /// query embedding.
    async fn match_chunks(
        &self,
        query_embedding: &[f32],
        page_ids: &[Uuid],
        count: usize,
    ) -> Result<Vec<Chunk>, StoreError>;

    /// Top-`count` discovered links among `source_ids` by ascending
    /// distance, excluding URLs already represented by an indexed page.
    async fn match_discovered_links(
        &self,
        query_embedding: &[f32],
        source_ids: &[Uuid],
        count: usize,
    ) -> Result<Vec<DiscoveredLink>, StoreError>;

    /// The canonical opening-excerpt chunks of the given pages.
    async fn get_lead_chunks(&self, page_ids: &[Uuid]) -> Result<Vec<Chunk>, StoreError>;

    // ── quotes ─────────────────────────────────────────────────────────

    /// Persists one citation quote.
    async fn insert_quote(&self, quote: &Quote) -> Result<(), StoreError>;

    /// Lists the quotes pinned to a message, by citation order.
    async fn quotes_for_message(&self, message_id: Uuid) -> Result<Vec<Quote>, StoreError>;
}
