//! transformd - transform orchestration agent
//!
//! A long-running service that drives transforms through their lifecycle:
//! discovery, content materialisation, processing launch and tracking,
//! dependency-gated input release, collection synchronisation, and outbound
//! notifications.

mod agent;
mod config;
mod events;
mod state_machine;
mod store;
mod work;

use agent::Transformer;
use config::Config;
use events::EventBus;
use std::sync::Arc;
use store::memory::MemoryStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use work::WorkRegistry;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transformd=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_threads.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(run(config));
    Ok(())
}

async fn run(config: Config) {
    tracing::info!(
        poll_time_period_secs = config.poll_time_period.as_secs(),
        retrieve_bulk_size = config.retrieve_bulk_size,
        max_number_workers = config.max_number_workers,
        "transformd starting"
    );

    // The relational store is deployed separately; standalone runs use the
    // in-memory implementation of the same contract.
    tracing::warn!("no external store configured, using the volatile in-memory store");
    let store = Arc::new(MemoryStore::new());

    let works = Arc::new(WorkRegistry::with_builtin_kinds());
    let bus = EventBus::new(1024);

    let agent = Arc::new(Transformer::new(config, store, works, bus));
    agent.run().await;
}
