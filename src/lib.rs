//! quarry-rs: an evidence-first reasoning engine over an indexed web
//! corpus.
//!
//! Given a natural-language question and a conversation's crawled pages,
//! the engine plans typed information slots, drives a bounded
//! retrieve/extract/decide loop against a vector store and an LLM, tracks
//! per-slot completeness, and assembles a final answer whose every claim
//! cites a stored passage. Progress streams to the caller as NDJSON.
//!
//! The crate is organised around three seams:
//!
//! - [`store::Datastore`]: the corpus and run-state contract, with a
//!   bundled `SQLite` reference implementation.
//! - [`engine::provider::LlmProvider`] and
//!   [`engine::embedding::Embedder`]: the model transport boundary.
//! - [`engine::ReasoningEngine`]: the request-scoped pipeline itself.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod server;
pub mod store;

pub use config::EngineConfig;
pub use engine::{AskRequest, EngineEvent, EventSink, ReasoningEngine};
pub use error::{EngineError, StoreError};
