mod api;
mod clock;
mod config;
mod database;
mod error;
mod incident;
mod monitoring;
mod notification;
mod pool;
mod queue;
mod retention;
mod scheduler;
mod seed;
#[cfg(test)]
mod testutil;
mod worker;

use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::sync::watch;
use tokio::task::JoinSet;

use clock::{Clock, SystemClock};
use config::Config;
use database::Store;
use retention::{RetentionPolicy, RetentionSweep};
use scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logger::init_tracing();

    let role = std::env::args().nth(1).unwrap_or_else(|| "all".to_string());
    if !matches!(role.as_str(), "api" | "worker" | "scheduler" | "seed" | "all") {
        bail!("unknown role '{role}' (expected api | worker | scheduler | seed | all)");
    }

    let config = Config::from_env()?;
    let pool = pool::build_pool(&config).await?;
    let store = Arc::new(Store::new(pool));
    {
        let conn = store.conn().await?;
        database::run_migrations(&conn).await?;
    }
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Regions are pre-seeded on every start so queue partitions resolve.
    seed::seed_regions(&store, &config).await?;

    if role == "seed" {
        seed::run(&store, &config, clock.as_ref()).await?;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    let run_all = role == "all";

    if run_all || role == "api" {
        let store = Arc::clone(&store);
        let clock = Arc::clone(&clock);
        let port = config.api_port;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { api::run(store, clock, port, shutdown).await });
    }

    if run_all || role == "worker" {
        let store = Arc::clone(&store);
        let clock = Arc::clone(&clock);
        let config = config.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { worker::run(store, clock, &config, shutdown).await });
    }

    if run_all || role == "scheduler" {
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.scheduler_tick_seconds,
            config.scheduler_batch_size,
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { scheduler.run(shutdown).await });

        let sweep = RetentionSweep::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            RetentionPolicy::with_ping_days(config.ping_retention_days),
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { sweep.run(shutdown).await });
    }

    let mut startup_failure = None;
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
        Some(joined) = tasks.join_next() => {
            match joined {
                Ok(Ok(())) => tracing::warn!("task exited early"),
                Ok(Err(error)) => {
                    tracing::error!(%error, "task failed");
                    startup_failure = Some(error);
                }
                Err(error) => startup_failure = Some(anyhow::anyhow!("task panicked: {error}")),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::error!(%error, "task exited with error"),
            Err(error) => tracing::error!(%error, "task panicked during shutdown"),
        }
    }

    match startup_failure {
        Some(error) => Err(error),
        None => {
            tracing::info!("shutdown complete");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
