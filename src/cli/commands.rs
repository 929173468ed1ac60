//! Command runners for the CLI.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::embedding::{Embedder, HashEmbedder, OpenAiEmbedder};
use crate::engine::provider::create_provider;
use crate::engine::{AskRequest, EventSink, ReasoningEngine};
use crate::server::{AppState, event_line, router};
use crate::store::{Datastore, SqliteStore};

/// Builds an engine over the store at `db_path` using environment
/// configuration.
fn build_engine(db_path: &Path) -> anyhow::Result<Arc<ReasoningEngine>> {
    let config = EngineConfig::from_env();
    let store: Arc<dyn Datastore> =
        Arc::new(SqliteStore::open(db_path).context("opening corpus database")?);
    let provider = create_provider(&config).context("creating LLM provider")?;

    // QUARRY_EMBEDDING_MODEL=hash selects the deterministic local
    // embedder, for smoke runs against corpora indexed the same way.
    let embedder: Arc<dyn Embedder> = if config.embedding_model == "hash" {
        Arc::new(HashEmbedder)
    } else {
        Arc::new(OpenAiEmbedder::new(&config).context("creating embedder")?)
    };

    Ok(Arc::new(ReasoningEngine::new(
        store,
        Arc::from(provider),
        embedder,
        config,
    )))
}

/// Runs the HTTP server until interrupted.
///
/// # Errors
///
/// Returns an error when the database cannot be opened, the provider
/// cannot be created, or the listener cannot bind.
pub async fn run_serve(db_path: &Path, addr: &str) -> anyhow::Result<()> {
    let engine = build_engine(db_path)?;
    let app = router(AppState { engine });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "serving");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server error")
}

/// Runs one question through the engine, streaming NDJSON to stdout.
///
/// # Errors
///
/// Returns an error when the engine cannot be constructed; pipeline
/// failures surface as an `{error}` line instead.
#[allow(clippy::print_stdout)]
pub async fn run_ask(
    db_path: &Path,
    conversation_id: Uuid,
    root_message_id: Uuid,
    question: String,
) -> anyhow::Result<()> {
    let engine = build_engine(db_path)?;

    let request = AskRequest {
        conversation_id,
        user_message: question,
        root_message_id: Some(root_message_id),
        append_to_message_id: None,
        scraped_page_display: None,
    };

    let (sink, mut receiver) = EventSink::channel(64);
    let runner = tokio::spawn(async move {
        engine.run(request, sink).await;
    });

    let stdout = std::io::stdout();
    while let Some(event) = receiver.recv().await {
        let mut lock = stdout.lock();
        let _ = lock.write_all(&event_line(&event));
        let _ = lock.flush();
    }

    runner.await.context("pipeline task panicked")
}
