//! HTTP surface: one NDJSON streaming endpoint over the reasoning engine.
//!
//! `POST /ask` validates the request body, spawns the pipeline onto its
//! own task, and streams progress events back as
//! `application/x-ndjson`, one JSON object per line. The pipeline task
//! is detached from the connection: a client disconnect never interrupts
//! terminal persistence.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::engine::{AskRequest, EngineEvent, EventSink, ReasoningEngine};

/// Event-channel depth between the pipeline and the response stream.
const EVENT_BUFFER: usize = 64;

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// The engine serving every request.
    pub engine: Arc<ReasoningEngine>,
}

/// Builds the service router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ask", post(ask))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// `POST /ask` request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AskBody {
    conversation_id: Option<Uuid>,
    user_message: Option<String>,
    root_message_id: Option<Uuid>,
    append_to_message_id: Option<Uuid>,
    scraped_page_display: Option<String>,
}

async fn healthz() -> impl IntoResponse {
    axum::Json(serde_json::json!({"ok": true}))
}

async fn ask(State(state): State<AppState>, body: axum::extract::Json<AskBody>) -> Response {
    let axum::extract::Json(body) = body;

    let Some(conversation_id) = body.conversation_id else {
        return error_response(StatusCode::BAD_REQUEST, "conversationId is required");
    };
    let user_message = body.user_message.unwrap_or_default();
    if user_message.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "userMessage is required");
    }

    let request = AskRequest {
        conversation_id,
        user_message,
        root_message_id: body.root_message_id,
        append_to_message_id: body.append_to_message_id,
        scraped_page_display: body.scraped_page_display,
    };

    let (sink, receiver) = EventSink::channel(EVENT_BUFFER);
    let engine = state.engine.clone();
    tokio::spawn(async move {
        engine.run(request, sink).await;
    });

    let stream = ReceiverStream::new(receiver).map(|event| {
        Ok::<_, std::convert::Infallible>(event_line(&event))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Serializes one event as an NDJSON line.
#[must_use]
pub fn event_line(event: &EngineEvent) -> Vec<u8> {
    let mut line = serde_json::to_vec(event).unwrap_or_else(|_| b"{}".to_vec());
    line.push(b'\n');
    line
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let line = event_line(&EngineEvent::Error {
        error: message.to_string(),
    });
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from(line))
        .unwrap_or_else(|_| status.into_response())
}
