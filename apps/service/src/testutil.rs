//! Shared helpers for tests that need a real store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::database::models::{Monitor, MonitorKind, Region, Team};
use crate::database::{NewMonitor, Store, run_migrations};
use crate::pool::LibsqlManager;

/// Migrated store backed by a throwaway on-disk database. Keep the TempDir
/// alive for the duration of the test.
pub async fn test_store() -> (Arc<Store>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");

    let db = libsql::Builder::new_local(db_path.to_str().unwrap()).build().await.unwrap();
    let manager = LibsqlManager::new(db);
    let pool = deadpool::managed::Pool::builder(manager)
        .config(deadpool::managed::PoolConfig::default())
        .build()
        .unwrap();

    let store = Store::new(pool);
    let conn = store.conn().await.unwrap();
    run_migrations(&conn).await.unwrap();

    (Arc::new(store), dir)
}

pub async fn seed_team(store: &Store) -> Team {
    store.create_team("test team", Utc::now()).await.unwrap()
}

pub async fn seed_region(store: &Store, code: &str) -> Region {
    store.upsert_region(code, code).await.unwrap()
}

#[allow(clippy::too_many_arguments)]
pub async fn seed_monitor(
    store: &Store,
    team: &Team,
    kind: MonitorKind,
    config: serde_json::Value,
    region_ids: Vec<i64>,
    notification_ids: Vec<i64>,
    failure_threshold: i64,
    recovery_threshold: i64,
    now: DateTime<Utc>,
) -> Monitor {
    store
        .create_monitor(
            NewMonitor {
                team_id: team.id,
                name: "test monitor".to_string(),
                kind,
                config,
                interval_seconds: 60,
                failure_threshold,
                recovery_threshold,
                region_ids,
                notification_ids,
            },
            now,
        )
        .await
        .unwrap()
}
