//! flakescope -- flaky test detection and root-cause ranking.
//!
//! This crate records test executions, re-analyses each test case's history
//! as runs arrive, and keeps a ranked list of flaky tests with their most
//! likely root causes.

pub mod api;
pub mod config;
pub mod flaky;
pub mod storage;
pub mod tracker;

use anyhow::{Context, Result};
use config::FlakescopeConfig;

/// Build the tracker over the configured store.
pub fn open_tracker(config: &FlakescopeConfig) -> Result<tracker::FlakinessTracker<storage::Store>> {
    let store = storage::Store::open(&config.storage)?;
    Ok(tracker::FlakinessTracker::new(
        store,
        config.analysis.min_executions,
    ))
}

/// Start the flakescope daemon: storage, tracker, and API server.
pub async fn serve(config: &FlakescopeConfig) -> Result<()> {
    // 1. Initialize Storage + Tracker
    let tracker = open_tracker(config)?;
    tracing::info!(min_executions = tracker.min_executions(), "Flakiness tracker ready");

    // 2. Start API Server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let app = api::router(api::state::AppState::new(tracker));

    tracing::info!(%addr, "flakescope listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
