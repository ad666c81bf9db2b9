//! usagewatch -- per-entity usage baselining, anomaly scoring, and cost
//! attribution for warehouse telemetry.
//!
//! This crate provides the core library for aggregating usage events into
//! daily records, tracking running baselines and trends, scoring anomalies,
//! attributing shared costs, and materializing the results in SQLite.

pub mod analysis;
pub mod api;
pub mod attribution;
pub mod config;
pub mod detect;
pub mod entity;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;

/// Start the usagewatch daemon: read API and cron-driven recomputes.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Initialize Storage
    let db_path = &config.storage.db_path;
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let pool = storage::open_pool(db_path)?;

    // 2. Initialize Scheduler
    let scheduler = scheduler::Scheduler::new(&config.schedule)?;
    let source = Arc::new(storage::events::SqliteEventSource::new(pool.clone()));
    let pipeline = pipeline::Pipeline::new(pool.clone(), source, &config);

    // 3. Start Scheduler Engine (background task)
    tokio::spawn(scheduler::run_scheduler_loop(scheduler, pipeline));

    // 4. Start API Server
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.api.bind))?;
    let app = api::router(api::state::AppState { pool });

    tracing::info!(%addr, "usagewatch listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
