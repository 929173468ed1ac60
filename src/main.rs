//! Binary entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use quarry_rs::cli::{Cli, Command, commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { addr } => commands::run_serve(&cli.db, &addr).await,
        Command::Ask {
            conversation_id,
            root_message_id,
            question,
        } => commands::run_ask(&cli.db, conversation_id, root_message_id, question).await,
    }
}
