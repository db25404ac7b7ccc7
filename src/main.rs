//! Legal document intelligence pipeline: ingests PDF case files, performs
//! OCR and structural extraction, and builds a multi-layer analytical graph
//! (citations, timeline events, entities, contradictions) over the
//! extracted content.

mod cache;
mod cli;
mod config;
mod error;
mod ledger;
mod llm;
mod lock;
mod models;
mod object_store;
mod pipeline;
mod rate_limit;
mod realtime;
mod recovery;
mod router;
mod store;
mod worker;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let default_filter = if cli::is_verbose() { "legal_pipeline=info" } else { "legal_pipeline=warn" };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run().await
}
