//! Request context loading and root-message resolution.
//!
//! Loads the conversation, its sources, and its indexed pages, preloads
//! each page's lead chunks, and resolves which user message roots this
//! reasoning run. Ask-again requests (`append_to_message_id`) rehydrate
//! the original run's slots and initial subqueries and arrive with one
//! expansion already consumed.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{Chunk, Conversation, Message, Page, Slot, Source, SubqueryRecord};
use crate::store::Datastore;

/// The fixed reply when a conversation has no indexed pages yet.
pub const NO_PAGES_MESSAGE: &str =
    "I don't have any indexed pages to search yet. Add a source and let it finish indexing, then ask again.";

/// One ask request, as received from the surface layer.
#[derive(Debug, Clone)]
pub struct AskRequest {
    /// Conversation to answer within.
    pub conversation_id: Uuid,
    /// The user's question.
    pub user_message: String,
    /// Root user message id, supplied by the front-end.
    pub root_message_id: Option<Uuid>,
    /// Assistant message to re-answer after a corpus expansion.
    pub append_to_message_id: Option<Uuid>,
    /// Rendered form of a page scraped on the user's behalf.
    pub scraped_page_display: Option<String>,
}

/// State rehydrated from a previous run in append mode.
#[derive(Debug, Clone)]
pub struct RehydratedRun {
    /// The original run's slots, counts included.
    pub slots: Vec<Slot>,
    /// The original run's initial subqueries.
    pub initial_subqueries: Vec<SubqueryRecord>,
}

/// Everything a reasoning run needs about its surroundings.
pub struct RunContext {
    /// The conversation.
    pub conversation: Conversation,
    /// Sources attached to the conversation.
    pub sources: Vec<Source>,
    /// Indexed pages across all sources.
    pub pages: Vec<Page>,
    /// Page lookup by id.
    pub page_by_id: HashMap<Uuid, Page>,
    /// Source domain per page id.
    pub source_domain_by_page: HashMap<Uuid, String>,
    /// Canonical opening-excerpt chunks across all pages.
    pub lead_chunks: Vec<Chunk>,
    /// User message rooting this run.
    pub root_message_id: Uuid,
    /// Assistant message this run re-answers, in append mode.
    pub follows_message_id: Option<Uuid>,
    /// Previous run state, in append mode.
    pub rehydrated: Option<RehydratedRun>,
    /// Expansions already consumed before the loop starts.
    pub expansion_count: u32,
}

impl RunContext {
    /// Ids of all indexed pages.
    #[must_use]
    pub fn page_ids(&self) -> Vec<Uuid> {
        self.pages.iter().map(|p| p.id).collect()
    }

    /// Ids of all sources.
    #[must_use]
    pub fn source_ids(&self) -> Vec<Uuid> {
        self.sources.iter().map(|s| s.id).collect()
    }
}

/// Loads the run context for a request.
///
/// # Errors
///
/// - [`EngineError::BadRequest`] when the question is empty.
/// - [`EngineError::NotFound`] when the conversation or the append target
///   does not exist.
/// - [`EngineError::CorruptedState`] when no root message can be resolved.
///
/// A conversation with zero indexed pages is not an error here; the
/// caller checks `pages.is_empty()` and answers with
/// [`NO_PAGES_MESSAGE`].
pub async fn load_run_context(
    store: &Arc<dyn Datastore>,
    request: &AskRequest,
) -> Result<RunContext, EngineError> {
    if request.user_message.trim().is_empty() {
        return Err(EngineError::BadRequest("userMessage is required".to_string()));
    }

    let conversation = store
        .get_conversation(request.conversation_id)
        .await?
        .ok_or(EngineError::NotFound {
            entity: "conversation",
            id: request.conversation_id,
        })?;

    let sources = store.list_sources(conversation.id).await?;
    let pages = store.list_indexed_pages(conversation.id).await?;

    let page_by_id: HashMap<Uuid, Page> = pages.iter().map(|p| (p.id, p.clone())).collect();
    let domain_by_source: HashMap<Uuid, String> = sources
        .iter()
        .map(|s| (s.id, s.domain.clone()))
        .collect();
    let source_domain_by_page: HashMap<Uuid, String> = pages
        .iter()
        .filter_map(|p| {
            domain_by_source
                .get(&p.source_id)
                .map(|d| (p.id, d.clone()))
        })
        .collect();

    let page_ids: Vec<Uuid> = pages.iter().map(|p| p.id).collect();
    let lead_chunks = if page_ids.is_empty() {
        Vec::new()
    } else {
        store.get_lead_chunks(&page_ids).await?
    };

    let (root_message_id, follows_message_id, rehydrated, expansion_count) =
        resolve_root(store, request).await?;

    Ok(RunContext {
        conversation,
        sources,
        pages,
        page_by_id,
        source_domain_by_page,
        lead_chunks,
        root_message_id,
        follows_message_id,
        rehydrated,
        expansion_count,
    })
}

/// Resolves the root message per the request shape.
async fn resolve_root(
    store: &Arc<dyn Datastore>,
    request: &AskRequest,
) -> Result<(Uuid, Option<Uuid>, Option<RehydratedRun>, u32), EngineError> {
    if let Some(append_to) = request.append_to_message_id {
        let original: Message =
            store
                .get_message(append_to)
                .await?
                .ok_or(EngineError::NotFound {
                    entity: "message",
                    id: append_to,
                })?;

        let root = store
            .latest_user_message_before(original.conversation_id, original.id)
            .await?
            .ok_or_else(|| {
                EngineError::CorruptedState(format!(
                    "assistant message {append_to} has no predecessor user message"
                ))
            })?;

        // The original suggestion was acted on; clear it from the stub.
        store.clear_suggested_page(original.id).await?;

        // The corpus changed since the last run; retrieval is worth
        // retrying for every slot.
        store.reset_slot_querying(root.id).await?;

        let slots = store.list_slots(root.id).await?;
        let initial_subqueries = store.subqueries_for_iteration(root.id, 0).await?;

        // The re-ask consumed one corpus expansion getting here.
        return Ok((
            root.id,
            Some(original.id),
            Some(RehydratedRun {
                slots,
                initial_subqueries,
            }),
            1,
        ));
    }

    if let Some(root_message_id) = request.root_message_id {
        return Ok((root_message_id, None, None, 0));
    }

    // The front-end contract is to always supply a root.
    Err(EngineError::CorruptedState(
        "neither rootMessageId nor appendToMessageId was supplied".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::embedding::HashEmbedder;
    use crate::model::PageStatus;
    use crate::store::SqliteStore;

    struct Seed {
        store: Arc<dyn Datastore>,
        raw: Arc<SqliteStore>,
        conversation_id: Uuid,
        page_id: Uuid,
    }

    fn seed() -> Seed {
        let raw = Arc::new(SqliteStore::open_in_memory().unwrap_or_else(|_| unreachable!()));
        let conversation_id = Uuid::new_v4();
        let source_id = Uuid::new_v4();
        let page_id = Uuid::new_v4();
        raw.insert_conversation(&Conversation {
            id: conversation_id,
            owner_id: None,
            dynamic_sources: false,
        })
        .unwrap_or_else(|_| unreachable!());
        raw.insert_source(&Source {
            id: source_id,
            conversation_id,
            domain: "example.org".to_string(),
            root_url: "https://example.org".to_string(),
        })
        .unwrap_or_else(|_| unreachable!());
        raw.insert_page(
            &Page {
                id: page_id,
                source_id,
                title: "P".to_string(),
                path: "/p".to_string(),
                url: "https://example.org/p".to_string(),
                status: PageStatus::Indexed,
            },
            "content",
        )
        .unwrap_or_else(|_| unreachable!());
        raw.insert_chunk(
            Uuid::new_v4(),
            page_id,
            "lead excerpt",
            true,
            &HashEmbedder::embed_one("lead excerpt"),
        )
        .unwrap_or_else(|_| unreachable!());
        Seed {
            store: raw.clone(),
            raw,
            conversation_id,
            page_id,
        }
    }

    fn request(conversation_id: Uuid, root: Option<Uuid>) -> AskRequest {
        AskRequest {
            conversation_id,
            user_message: "a question".to_string(),
            root_message_id: root,
            append_to_message_id: None,
            scraped_page_display: None,
        }
    }

    #[tokio::test]
    async fn test_loads_pages_and_lead_chunks() {
        let seed = seed();
        let root = Uuid::new_v4();
        seed.raw
            .insert_user_message(root, seed.conversation_id, "a question")
            .unwrap_or_else(|_| unreachable!());

        let context = load_run_context(&seed.store, &request(seed.conversation_id, Some(root)))
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(context.pages.len(), 1);
        assert_eq!(context.lead_chunks.len(), 1);
        assert_eq!(context.root_message_id, root);
        assert_eq!(context.expansion_count, 0);
        assert_eq!(
            context.source_domain_by_page.get(&seed.page_id).map(String::as_str),
            Some("example.org")
        );
    }

    #[tokio::test]
    async fn test_missing_conversation_is_not_found() {
        let seed = seed();
        let result =
            load_run_context(&seed.store, &request(Uuid::new_v4(), Some(Uuid::new_v4()))).await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_empty_question_is_bad_request() {
        let seed = seed();
        let mut bad = request(seed.conversation_id, Some(Uuid::new_v4()));
        bad.user_message = "   ".to_string();
        let result = load_run_context(&seed.store, &bad).await;
        assert!(matches!(result, Err(EngineError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_missing_root_is_corrupted_state() {
        let seed = seed();
        let result = load_run_context(&seed.store, &request(seed.conversation_id, None)).await;
        assert!(matches!(result, Err(EngineError::CorruptedState(_))));
    }

    #[tokio::test]
    async fn test_append_mode_rehydrates_and_clears_suggestion() {
        let seed = seed();
        let root = Uuid::new_v4();
        seed.raw
            .insert_user_message(root, seed.conversation_id, "original question")
            .unwrap_or_else(|_| unreachable!());
        let stub = seed
            .store
            .insert_assistant_message(crate::store::NewAssistantMessage {
                conversation_id: seed.conversation_id,
                content: "suggestion stub".to_string(),
                thought_process: None,
                suggested_page: Some(serde_json::json!({"url": "https://example.org/next"})),
                scraped_page_display: None,
                follows_message_id: None,
            })
            .await
            .unwrap_or_else(|_| unreachable!());

        let mut req = request(seed.conversation_id, None);
        req.append_to_message_id = Some(stub.id);

        let context = load_run_context(&seed.store, &req)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(context.root_message_id, root);
        assert_eq!(context.follows_message_id, Some(stub.id));
        assert_eq!(context.expansion_count, 1);
        assert!(context.rehydrated.is_some());

        let reloaded = seed.store.get_message(stub.id).await.unwrap_or_default();
        assert!(reloaded.and_then(|m| m.suggested_page).is_none());
    }

    #[tokio::test]
    async fn test_append_mode_without_predecessor_is_corrupted() {
        let seed = seed();
        // An assistant message with no user message before it.
        let stub = seed
            .store
            .insert_assistant_message(crate::store::NewAssistantMessage {
                conversation_id: seed.conversation_id,
                content: "orphan".to_string(),
                thought_process: None,
                suggested_page: None,
                scraped_page_display: None,
                follows_message_id: None,
            })
            .await
            .unwrap_or_else(|_| unreachable!());

        let mut req = request(seed.conversation_id, None);
        req.append_to_message_id = Some(stub.id);
        let result = load_run_context(&seed.store, &req).await;
        assert!(matches!(result, Err(EngineError::CorruptedState(_))));
    }
}
