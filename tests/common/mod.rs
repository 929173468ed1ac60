//! Shared harness for end-to-end pipeline tests: a seeded in-memory
//! corpus, a scripted LLM provider, and an event collector.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use quarry_rs::config::EngineConfig;
use quarry_rs::engine::embedding::HashEmbedder;
use quarry_rs::engine::message::{ChatRequest, ChatResponse, TokenUsage};
use quarry_rs::engine::provider::LlmProvider;
use quarry_rs::engine::{AskRequest, EventSink, ReasoningEngine};
use quarry_rs::error::EngineError;
use quarry_rs::model::{Conversation, DiscoveredLink, Page, PageStatus, Source};
use quarry_rs::store::{Datastore, SqliteStore};

/// Replays a fixed sequence of model responses.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    /// Responses not yet consumed; scenarios assert this hits zero.
    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, EngineError> {
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        next.map_or_else(
            || Err(EngineError::Upstream("script exhausted".to_string())),
            |content| {
                Ok(ChatResponse {
                    content,
                    usage: TokenUsage::default(),
                    finish_reason: Some("stop".to_string()),
                })
            },
        )
    }
}

/// A seeded corpus: one conversation, one source, one primary page.
pub struct TestCorpus {
    pub store: Arc<SqliteStore>,
    pub conversation_id: Uuid,
    pub source_id: Uuid,
    pub page_id: Uuid,
}

impl TestCorpus {
    pub fn new(dynamic_sources: bool) -> Self {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let conversation_id = Uuid::new_v4();
        let source_id = Uuid::new_v4();
        let page_id = Uuid::new_v4();

        store
            .insert_conversation(&Conversation {
                id: conversation_id,
                owner_id: None,
                dynamic_sources,
            })
            .unwrap();
        store
            .insert_source(&Source {
                id: source_id,
                conversation_id,
                domain: "en.test.org".to_string(),
                root_url: "https://en.test.org".to_string(),
            })
            .unwrap();

        let corpus = Self {
            store,
            conversation_id,
            source_id,
            page_id,
        };
        corpus.add_page(page_id, "Primary Page", "/primary", "long");
        corpus
    }

    /// Adds an indexed page whose full content is padded so quote
    /// context has something to capture.
    pub fn add_page(&self, id: Uuid, title: &str, path: &str, padding: &str) {
        let pad = if padding == "long" {
            "Lorem context ".repeat(40)
        } else {
            String::new()
        };
        self.store
            .insert_page(
                &Page {
                    id,
                    source_id: self.source_id,
                    title: title.to_string(),
                    path: path.to_string(),
                    url: format!("https://en.test.org{path}"),
                    status: PageStatus::Indexed,
                },
                &format!("{pad}{title} full page body.{pad}"),
            )
            .unwrap();
    }

    /// Adds a chunk to the primary page and patches the page content so
    /// the chunk text is locatable for context extraction.
    pub fn add_chunk(&self, content: &str) -> Uuid {
        self.add_chunk_on(self.page_id, content)
    }

    pub fn add_chunk_on(&self, page_id: Uuid, content: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .insert_chunk(id, page_id, content, false, &HashEmbedder::embed_one(content))
            .unwrap();
        id
    }

    pub fn add_lead_chunk(&self, content: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .insert_chunk(
                id,
                self.page_id,
                content,
                true,
                &HashEmbedder::embed_one(content),
            )
            .unwrap();
        id
    }

    pub fn add_link(&self, to_url: &str, anchor: &str, snippet: &str) {
        self.store
            .insert_discovered_link(
                &DiscoveredLink {
                    to_url: to_url.to_string(),
                    anchor_text: anchor.to_string(),
                    snippet: snippet.to_string(),
                    source_id: self.source_id,
                    from_page_id: Some(self.page_id),
                    distance: None,
                },
                &HashEmbedder::embed_one(&format!("{anchor} {snippet}")),
            )
            .unwrap();
    }

    pub fn user_message(&self, content: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .insert_user_message(id, self.conversation_id, content)
            .unwrap();
        id
    }

    pub fn engine(&self, provider: Arc<ScriptedProvider>) -> ReasoningEngine {
        let store: Arc<dyn Datastore> = self.store.clone();
        ReasoningEngine::new(
            store,
            provider,
            Arc::new(HashEmbedder),
            EngineConfig::builder().build(),
        )
    }
}

/// Runs the engine and collects the emitted NDJSON shapes as JSON values.
pub async fn run_collect(
    corpus: &TestCorpus,
    provider: Arc<ScriptedProvider>,
    request: AskRequest,
) -> Vec<serde_json::Value> {
    let engine = corpus.engine(provider);
    let (sink, mut receiver) = EventSink::channel(64);

    let handle = tokio::spawn(async move {
        engine.run(request, sink).await;
    });

    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        events.push(serde_json::to_value(&event).unwrap());
    }
    handle.await.unwrap();
    events
}

/// Standard request for a fresh run.
pub fn ask(corpus: &TestCorpus, root: Uuid, question: &str) -> AskRequest {
    AskRequest {
        conversation_id: corpus.conversation_id,
        user_message: question.to_string(),
        root_message_id: Some(root),
        append_to_message_id: None,
        scraped_page_display: None,
    }
}

/// The `{done: true}` line of a stream.
pub fn done_event(events: &[serde_json::Value]) -> &serde_json::Value {
    events
        .iter()
        .find(|e| e.get("done").is_some())
        .expect("stream should carry a done line")
}

/// Counts `[k]` citation markers in a message, verifying they are 1..=N.
pub fn citation_markers(message: &str) -> Vec<usize> {
    let re = regex::Regex::new(r"\[(\d+)\]").unwrap();
    re.captures_iter(message)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
        .collect()
}
