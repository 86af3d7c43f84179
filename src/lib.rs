//! bandwatch -- scheduled network speed tests with pluggable providers.
//!
//! This crate provides the core library for cron-driven schedules, the
//! single-flight dispatcher, result retention and the HTTP API.

pub mod api;
pub mod config;
pub mod error;
pub mod results;
pub mod scheduler;
pub mod settings;
pub mod storage;
pub mod throughput;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::scheduler::{Dispatcher, ScheduleRegistry, SchedulerEngine};
use crate::storage::Pool;
use crate::throughput::provider::ProviderRegistry;

/// Open the database, register the configured providers and build the
/// dispatcher shared by the API, the tick loop and the CLI.
pub fn open_core(config: &AppConfig) -> Result<(Pool, Dispatcher)> {
    let db_path = config.storage.database_path.to_string_lossy();
    tracing::info!(%db_path, "initializing database");
    let pool = storage::open_pool(&db_path)?;

    let registry = ProviderRegistry::from_config(&config.providers);
    let names = registry.names();
    storage::providers::sync_providers(&pool, names.iter().map(String::as_str))
        .context("failed to register providers")?;
    tracing::info!(providers = ?names, "providers registered");

    let dispatcher = Dispatcher::new(pool.clone(), Arc::new(registry), config.scheduler.run_timeout());
    Ok((pool, dispatcher))
}

/// Start the bandwatch daemon: API server and scheduler engine.
///
/// Runs until `shutdown` is cancelled.
pub async fn serve(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    config.validate()?;
    let (pool, dispatcher) = open_core(&config)?;

    let engine = SchedulerEngine::new(ScheduleRegistry::new(pool.clone()), dispatcher.clone());
    let scheduler_task = tokio::spawn(scheduler::run_scheduler_loop(
        engine,
        config.scheduler.tick_interval(),
        shutdown.child_token(),
    ));

    let app = api::router(api::state::AppState::new(pool, dispatcher));
    let addr: std::net::SocketAddr = config.server.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "bandwatch listening");

    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    shutdown.cancel();
    scheduler_task.await.context("scheduler task panicked")?;
    tracing::info!("bandwatch stopped");
    Ok(())
}
