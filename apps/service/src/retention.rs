//! Retention sweep for the probe time-series and the queue's dead letters.
//!
//! Runs inside the scheduler role (the singleton), once an hour.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::database::Store;
use crate::queue;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// How long data is kept. The ping window is operator-configurable.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub ping_retention_days: i64,
    pub dead_job_retention_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { ping_retention_days: 90, dead_job_retention_days: 30 }
    }
}

impl RetentionPolicy {
    pub fn with_ping_days(days: i64) -> Self {
        Self { ping_retention_days: days.max(1), ..Default::default() }
    }
}

pub struct RetentionSweep {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    policy: RetentionPolicy,
}

impl RetentionSweep {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, policy: RetentionPolicy) -> Self {
        Self { store, clock, policy }
    }

    /// One pass: prune expired pings and stale dead-lettered jobs.
    pub async fn sweep(&self) -> Result<u64> {
        let now = self.clock.now();
        let ping_cutoff = now - ChronoDuration::days(self.policy.ping_retention_days);
        let pruned = self.store.prune_pings_before(ping_cutoff).await?;

        let dead_cutoff = now - ChronoDuration::days(self.policy.dead_job_retention_days);
        let conn = self.store.conn().await?;
        let dead_pruned = queue::prune_dead_before(&conn, dead_cutoff).await?;

        if pruned > 0 || dead_pruned > 0 {
            tracing::info!(pruned, dead_pruned, "retention sweep completed");
        }
        Ok(pruned + dead_pruned)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut timer = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(error) = self.sweep().await {
                tracing::warn!(%error, "retention sweep failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::clock::Clock;
    use crate::clock::test::FixedClock;
    use crate::database::models::{Ping, PingStatus};
    use crate::database::repository;
    use crate::testutil::test_store;

    #[tokio::test]
    async fn sweep_prunes_only_expired_pings() {
        let (store, _dir) = test_store().await;
        let clock = Arc::new(FixedClock::new());
        let now = clock.now();

        let conn = store.conn().await.unwrap();
        for (age_days, monitor_id) in [(100, 1), (5, 2)] {
            let ping = Ping {
                time: now - ChronoDuration::days(age_days),
                monitor_id,
                region_id: 1,
                status: PingStatus::Successful,
                latency_ms: 10,
                data: json!({}),
            };
            repository::insert_ping(&conn, &ping).await.unwrap();
        }
        drop(conn);

        let sweep = RetentionSweep::new(
            Arc::clone(&store),
            clock.clone() as Arc<dyn Clock>,
            RetentionPolicy::with_ping_days(90),
        );
        assert_eq!(sweep.sweep().await.unwrap(), 1);

        assert!(store.recent_pings(1, 10).await.unwrap().is_empty());
        assert_eq!(store.recent_pings(2, 10).await.unwrap().len(), 1);
    }

    #[test]
    fn policy_floor_is_one_day() {
        assert_eq!(RetentionPolicy::with_ping_days(0).ping_retention_days, 1);
    }
}
