use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::clock::Clock;
use crate::database::Store;
use crate::database::models::Monitor;
use crate::database::repository;
use crate::queue::{self, EnqueueOptions, PingJob, TaskKind};

/// Upper bound on any probe job's timeout, regardless of interval.
const MAX_JOB_TIMEOUT_SECONDS: i64 = 120;

/// Process-wide singleton loop that turns monitor configuration into a steady
/// stream of (monitor, region) probe jobs.
///
/// Exactly one scheduler runs across the cluster; this is enforced by
/// deployment topology, not in-process locking.
pub struct Scheduler {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    batch_size: usize,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        tick_seconds: u64,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            clock,
            tick_interval: Duration::from_secs(tick_seconds.max(1)),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            tick_seconds = self.tick_interval.as_secs(),
            batch_size = self.batch_size,
            "scheduler started"
        );
        let mut timer = tokio::time::interval(self.tick_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            // A failed tick is skipped; the next tick retries naturally since
            // next_check was not advanced for the monitors it missed.
            match self.tick().await {
                Ok(0) => {}
                Ok(enqueued) => tracing::debug!(enqueued, "scheduler tick dispatched jobs"),
                Err(error) => tracing::error!(%error, "scheduler tick failed"),
            }
        }

        tracing::info!("scheduler stopped");
        Ok(())
    }

    /// One scheduling pass. Returns the number of probe jobs enqueued.
    pub async fn tick(&self) -> Result<usize> {
        let now = self.clock.now();
        let due = self.store.monitors_due(now).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut batches = JoinSet::new();
        for batch in due.chunks(self.batch_size) {
            let store = Arc::clone(&self.store);
            let batch = batch.to_vec();
            batches.spawn(async move { dispatch_batch(store, batch, now).await });
        }

        let mut enqueued = 0;
        while let Some(joined) = batches.join_next().await {
            match joined {
                Ok(Ok(count)) => enqueued += count,
                Ok(Err(error)) => tracing::error!(%error, "batch dispatch failed"),
                Err(error) => tracing::error!(%error, "batch dispatch panicked"),
            }
        }
        Ok(enqueued)
    }
}

/// Enqueue one probe job per (monitor, region) of a batch and advance the
/// batch's scheduling state, all in a single transaction.
async fn dispatch_batch(store: Arc<Store>, batch: Vec<Monitor>, now: DateTime<Utc>) -> Result<usize> {
    let conn = store.conn().await?;
    let txn = conn.transaction().await?;

    let mut enqueued = 0;
    for monitor in &batch {
        let opts = EnqueueOptions {
            timeout_seconds: job_timeout_seconds(monitor.interval_seconds),
            ..Default::default()
        };
        for region_id in &monitor.region_ids {
            let job = PingJob { monitor: monitor.clone(), region_id: *region_id };
            queue::enqueue(&txn, &region_id.to_string(), TaskKind::MonitorPing, &job, &opts, now)
                .await?;
            enqueued += 1;
        }

        let next_check = {
            let mut rng = rand::thread_rng();
            next_check_after(now, monitor.interval_seconds, &mut rng)
        };
        repository::mark_scheduled(&txn, monitor.id, now, next_check).await?;
    }

    txn.commit().await?;
    Ok(enqueued)
}

/// `now + interval + jitter`, where jitter is uniform in ±interval/10.
///
/// The jitter de-synchronizes monitors that share an interval and were
/// created in the same second.
pub(crate) fn next_check_after(
    now: DateTime<Utc>,
    interval_seconds: i64,
    rng: &mut impl Rng,
) -> DateTime<Utc> {
    now + chrono::Duration::seconds(interval_seconds + jitter_seconds(interval_seconds, rng))
}

fn jitter_seconds(interval_seconds: i64, rng: &mut impl Rng) -> i64 {
    let spread = interval_seconds / 10;
    if spread == 0 {
        return 0;
    }
    rng.gen_range(-spread..=spread)
}

fn job_timeout_seconds(interval_seconds: i64) -> i64 {
    (2 * interval_seconds).min(MAX_JOB_TIMEOUT_SECONDS).max(1)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::clock::Clock;
    use crate::clock::test::FixedClock;
    use crate::database::models::MonitorKind;
    use crate::queue::claim_next;
    use crate::testutil::{seed_monitor, seed_region, seed_team, test_store};

    #[test]
    fn jitter_stays_within_a_tenth_of_the_interval() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let jitter = jitter_seconds(60, &mut rng);
            assert!((-6..=6).contains(&jitter), "jitter {jitter} out of range");
        }
    }

    #[test]
    fn next_check_is_always_in_the_future() {
        let mut rng = StdRng::seed_from_u64(7);
        let now = Utc::now();
        for _ in 0..1000 {
            let next = next_check_after(now, 10, &mut rng);
            assert!(next > now);
        }
    }

    #[test]
    fn job_timeout_is_capped() {
        assert_eq!(job_timeout_seconds(10), 20);
        assert_eq!(job_timeout_seconds(60), 120);
        assert_eq!(job_timeout_seconds(3600), 120);
    }

    #[tokio::test]
    async fn tick_enqueues_one_job_per_region_and_advances_next_check() {
        let (store, _dir) = test_store().await;
        let clock = Arc::new(FixedClock::new());
        let team = seed_team(&store).await;
        let region_a = seed_region(&store, "DE-BE").await;
        let region_b = seed_region(&store, "US-CA").await;

        let monitor = seed_monitor(
            &store,
            &team,
            MonitorKind::TcpPing,
            serde_json::json!({"host": "localhost:9", "timeout": 1}),
            vec![region_a.id, region_b.id],
            vec![],
            3,
            2,
            clock.now(),
        )
        .await;

        let scheduler = Scheduler::new(Arc::clone(&store), clock.clone(), 2, 150);
        let enqueued = scheduler.tick().await.unwrap();
        assert_eq!(enqueued, 2);

        // One job per region, on distinct partitions.
        let conn = store.conn().await.unwrap();
        let job_a = claim_next(&conn, &region_a.id.to_string(), clock.now())
            .await
            .unwrap()
            .expect("job for region a");
        let job_b = claim_next(&conn, &region_b.id.to_string(), clock.now())
            .await
            .unwrap()
            .expect("job for region b");
        assert_ne!(job_a.queue, job_b.queue);

        let decoded: PingJob = serde_json::from_value(job_a.payload).unwrap();
        assert_eq!(decoded.monitor.id, monitor.id);

        let rescheduled = store.get_monitor(monitor.id).await.unwrap().unwrap();
        let last_checked = rescheduled.last_checked.expect("last_checked set");
        assert!(rescheduled.next_check > last_checked);

        // The monitor is no longer due, so a second tick is a no-op.
        assert_eq!(scheduler.tick().await.unwrap(), 0);
    }
}
