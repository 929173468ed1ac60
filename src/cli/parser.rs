//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Evidence-first question answering over an indexed web corpus.
#[derive(Debug, Parser)]
#[command(name = "quarry-rs", version, about, propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,

    /// Path to the `SQLite` corpus database.
    #[arg(long, global = true, env = "QUARRY_DB", default_value = "quarry.db")]
    pub db: PathBuf,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the NDJSON ask endpoint over HTTP.
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
    },
    /// Run one question through the engine, streaming NDJSON to stdout.
    Ask {
        /// Conversation to answer within.
        #[arg(long)]
        conversation_id: Uuid,
        /// Root user message id for the run.
        #[arg(long)]
        root_message_id: Uuid,
        /// The question.
        question: String,
    },
}
