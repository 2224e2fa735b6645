//! Startup and demo seeding.
//!
//! Every role upserts the configured regions at startup so queue partitions
//! always resolve. The `seed` role additionally creates a default team and
//! demo monitors for a fresh installation.

use anyhow::Result;
use serde_json::json;

use crate::clock::Clock;
use crate::config::Config;
use crate::database::models::MonitorKind;
use crate::database::{NewMonitor, Store};

pub async fn seed_regions(store: &Store, config: &Config) -> Result<()> {
    for code in &config.app_regions {
        store.upsert_region(code, code).await?;
    }
    tracing::debug!(count = config.app_regions.len(), "regions seeded");
    Ok(())
}

pub async fn run(store: &Store, config: &Config, clock: &dyn Clock) -> Result<()> {
    seed_regions(store, config).await?;

    let now = clock.now();
    let team = match store.team_by_name("default").await? {
        Some(team) => team,
        None => store.create_team("default", now).await?,
    };

    if !store.list_monitors(team.id).await?.is_empty() {
        tracing::info!("monitors already present, nothing to seed");
        return Ok(());
    }

    let region_ids: Vec<i64> = store.list_regions().await?.into_iter().map(|r| r.id).collect();

    store
        .create_monitor(
            NewMonitor {
                team_id: team.id,
                name: "example.com".to_string(),
                kind: MonitorKind::Http,
                config: json!({"url": "https://example.com", "max_redirects": 10}),
                interval_seconds: 60,
                failure_threshold: 3,
                recovery_threshold: 2,
                region_ids: region_ids.clone(),
                notification_ids: vec![],
            },
            now,
        )
        .await?;

    store
        .create_monitor(
            NewMonitor {
                team_id: team.id,
                name: "example.com tcp".to_string(),
                kind: MonitorKind::TcpPing,
                config: json!({"host": "example.com:443", "timeout": 10}),
                interval_seconds: 120,
                failure_threshold: 2,
                recovery_threshold: 2,
                region_ids,
                notification_ids: vec![],
            },
            now,
        )
        .await?;

    tracing::info!(team_id = team.id, "seeded default team and demo monitors");
    Ok(())
}
