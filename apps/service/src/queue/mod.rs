pub mod jobs;

pub use jobs::{NOTIFICATIONS_QUEUE, NotificationJob, PingJob, TaskKind};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use serde::Serialize;
use tokio::sync::{Semaphore, watch};

use crate::clock::Clock;
use crate::database::Store;
use crate::database::repository::to_ts;

/// How long a processor waits before re-polling an empty partition.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Slack added to a job's lease beyond its own timeout, so a lease only
/// expires when the worker died rather than when the handler ran long.
const LEASE_GRACE_SECONDS: i64 = 30;

/// Per-task options at enqueue time.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub timeout_seconds: i64,
    pub max_retries: i64,
    pub delay_seconds: i64,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self { timeout_seconds: 120, max_retries: 3, delay_seconds: 0 }
    }
}

/// A claimed job handed to a handler.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub timeout_seconds: i64,
    pub failures: i64,
}

/// Exponential retry backoff, capped at ten minutes.
pub fn retry_backoff_seconds(failures: i64) -> i64 {
    (5 * (1i64 << failures.clamp(0, 7))).min(600)
}

/// Append a job to a partition. Runs on the caller's connection, so an
/// enqueue inside a transaction commits atomically with the caller's writes.
pub async fn enqueue<P: Serialize>(
    conn: &Connection,
    queue: &str,
    kind: TaskKind,
    payload: &P,
    opts: &EnqueueOptions,
    now: DateTime<Utc>,
) -> Result<i64> {
    let payload = serde_json::to_string(payload).context("encode job payload")?;
    conn.execute(
        "INSERT INTO queue_jobs
            (queue, kind, payload, state, run_at, timeout_seconds, max_retries, created_at,
             updated_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?7)",
        params![
            queue,
            kind.as_str(),
            payload,
            to_ts(now) + opts.delay_seconds,
            opts.timeout_seconds,
            opts.max_retries,
            to_ts(now)
        ],
    )
    .await?;
    Ok(conn.last_insert_rowid())
}

/// Atomically claim the next due job of a partition, taking a lease.
pub(crate) async fn claim_next(
    conn: &Connection,
    queue: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>> {
    let mut rows = conn
        .query(
            "UPDATE queue_jobs
             SET state = 'running',
                 lease_expires_at = ?1 + timeout_seconds + ?2,
                 updated_at = ?1
             WHERE id = (
                 SELECT id FROM queue_jobs
                 WHERE queue = ?3 AND state = 'pending' AND run_at <= ?1
                 ORDER BY run_at ASC
                 LIMIT 1)
             RETURNING id, queue, kind, payload, timeout_seconds, failures",
            params![to_ts(now), LEASE_GRACE_SECONDS, queue],
        )
        .await?;

    let Some(row) = rows.next().await? else {
        return Ok(None);
    };

    let kind_str: String = row.get(2)?;
    let payload_str: String = row.get(3)?;
    let Some(kind) = TaskKind::parse(&kind_str) else {
        // Unknown kinds cannot be handled by any version of this binary.
        let id: i64 = row.get(0)?;
        tracing::error!(job_id = id, kind = %kind_str, "dead-lettering job of unknown kind");
        mark_dead(conn, id, "unknown task kind", now).await?;
        return Ok(None);
    };

    Ok(Some(Job {
        id: row.get(0)?,
        queue: row.get(1)?,
        kind,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        timeout_seconds: row.get(4)?,
        failures: row.get(5)?,
    }))
}

/// Acknowledge a completed job.
pub(crate) async fn ack(conn: &Connection, job_id: i64) -> Result<()> {
    conn.execute("DELETE FROM queue_jobs WHERE id = ?1", params![job_id]).await?;
    Ok(())
}

/// Record a handler failure: schedule a backed-off retry, or dead-letter the
/// job once its retry budget is exhausted.
pub(crate) async fn fail(
    conn: &Connection,
    job_id: i64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut rows = conn
        .query(
            "SELECT failures, max_retries FROM queue_jobs WHERE id = ?1",
            params![job_id],
        )
        .await?;
    let Some(row) = rows.next().await? else {
        return Ok(());
    };
    let failures: i64 = row.get(0)?;
    let max_retries: i64 = row.get(1)?;
    let failures = failures + 1;

    if failures > max_retries {
        conn.execute(
            "UPDATE queue_jobs
             SET state = 'dead', failures = ?1, last_error = ?2, lease_expires_at = NULL,
                 updated_at = ?3
             WHERE id = ?4",
            params![failures, error, to_ts(now), job_id],
        )
        .await?;
    } else {
        conn.execute(
            "UPDATE queue_jobs
             SET state = 'pending', failures = ?1, last_error = ?2, lease_expires_at = NULL,
                 run_at = ?3, updated_at = ?4
             WHERE id = ?5",
            params![failures, error, to_ts(now) + retry_backoff_seconds(failures), to_ts(now), job_id],
        )
        .await?;
    }
    Ok(())
}

async fn mark_dead(conn: &Connection, job_id: i64, error: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE queue_jobs
         SET state = 'dead', last_error = ?1, lease_expires_at = NULL, updated_at = ?2
         WHERE id = ?3",
        params![error, to_ts(now), job_id],
    )
    .await?;
    Ok(())
}

/// Delete dead-lettered jobs that settled before the cutoff.
pub(crate) async fn prune_dead_before(conn: &Connection, cutoff: DateTime<Utc>) -> Result<u64> {
    let pruned = conn
        .execute(
            "DELETE FROM queue_jobs WHERE state = 'dead' AND updated_at < ?1",
            params![to_ts(cutoff)],
        )
        .await?;
    Ok(pruned)
}

/// Return running jobs whose lease lapsed (worker crash) to pending, keeping
/// delivery at-least-once.
pub(crate) async fn release_expired_leases(conn: &Connection, now: DateTime<Utc>) -> Result<u64> {
    let released = conn
        .execute(
            "UPDATE queue_jobs
             SET state = 'pending', lease_expires_at = NULL, run_at = ?1, updated_at = ?1
             WHERE state = 'running' AND lease_expires_at < ?1",
            params![to_ts(now)],
        )
        .await?;
    Ok(released)
}

/// Handler invoked for each claimed job. Must be idempotent or tolerant of
/// duplicates; delivery is at-least-once.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<()>;
}

/// Claim loop over one queue partition with bounded handler concurrency.
pub struct QueueProcessor {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    queue: String,
    concurrency: usize,
}

impl QueueProcessor {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, queue: String, concurrency: usize) -> Self {
        Self { store, clock, queue, concurrency }
    }

    pub async fn run<H: JobHandler>(
        &self,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        tracing::info!(queue = %self.queue, concurrency = self.concurrency, "queue processor started");
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit.context("semaphore closed")?,
                _ = shutdown.changed() => continue,
            };

            match self.claim_one().await {
                Ok(Some(job)) => {
                    let store = Arc::clone(&self.store);
                    let clock = Arc::clone(&self.clock);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        let _permit = permit;
                        run_job(store, clock, handler, job).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(error) => {
                    drop(permit);
                    tracing::warn!(queue = %self.queue, %error, "queue claim failed");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::info!(queue = %self.queue, "queue processor stopped");
        Ok(())
    }

    async fn claim_one(&self) -> Result<Option<Job>> {
        let now = self.clock.now();
        let conn = self.store.conn().await?;
        // Crashed-worker leases are reclaimed opportunistically alongside the
        // normal claim; the partition poll cadence bounds the delay.
        let released = release_expired_leases(&conn, now).await?;
        if released > 0 {
            tracing::warn!(queue = %self.queue, released, "requeued jobs with expired leases");
        }
        claim_next(&conn, &self.queue, now).await
    }
}

async fn run_job<H: JobHandler>(store: Arc<Store>, clock: Arc<dyn Clock>, handler: Arc<H>, job: Job) {
    // Backstop only: probe deadlines are capped below the job timeout by the
    // executor, so this fires for a hung store, not a slow target.
    let timeout = Duration::from_secs(job.timeout_seconds.max(1) as u64);
    let result = match tokio::time::timeout(timeout, handler.handle(&job)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("job timed out after {}s", job.timeout_seconds)),
    };

    let conn = match store.conn().await {
        Ok(conn) => conn,
        Err(error) => {
            // The lease will lapse and the job will be redelivered.
            tracing::error!(job_id = job.id, %error, "could not settle job");
            return;
        }
    };

    match result {
        Ok(()) => {
            if let Err(error) = ack(&conn, job.id).await {
                tracing::error!(job_id = job.id, %error, "failed to ack job");
            }
        }
        Err(job_error) => {
            tracing::warn!(
                job_id = job.id,
                queue = %job.queue,
                kind = job.kind.as_str(),
                error = %job_error,
                "job failed"
            );
            if let Err(error) = fail(&conn, job.id, &job_error.to_string(), clock.now()).await {
                tracing::error!(job_id = job.id, %error, "failed to record job failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_store;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(retry_backoff_seconds(1), 10);
        assert_eq!(retry_backoff_seconds(2), 20);
        assert_eq!(retry_backoff_seconds(3), 40);
        assert!(retry_backoff_seconds(4) > retry_backoff_seconds(3));
        assert_eq!(retry_backoff_seconds(20), 600);
    }

    #[tokio::test]
    async fn claim_ack_leaves_queue_empty() {
        let (store, _dir) = test_store().await;
        let conn = store.conn().await.unwrap();
        let now = Utc::now();

        enqueue(
            &conn,
            "1",
            TaskKind::MonitorPing,
            &serde_json::json!({"probe": true}),
            &EnqueueOptions::default(),
            now,
        )
        .await
        .unwrap();

        let job = claim_next(&conn, "1", now).await.unwrap().expect("job due");
        assert_eq!(job.kind, TaskKind::MonitorPing);
        assert_eq!(job.payload["probe"], serde_json::json!(true));

        // Claimed jobs are invisible to other consumers of the partition.
        assert!(claim_next(&conn, "1", now).await.unwrap().is_none());

        ack(&conn, job.id).await.unwrap();
        assert!(claim_next(&conn, "1", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partitions_are_isolated() {
        let (store, _dir) = test_store().await;
        let conn = store.conn().await.unwrap();
        let now = Utc::now();

        enqueue(&conn, "1", TaskKind::MonitorPing, &1, &EnqueueOptions::default(), now)
            .await
            .unwrap();

        assert!(claim_next(&conn, "2", now).await.unwrap().is_none());
        assert!(claim_next(&conn, "1", now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_due_early() {
        let (store, _dir) = test_store().await;
        let conn = store.conn().await.unwrap();
        let now = Utc::now();

        let opts = EnqueueOptions { delay_seconds: 60, ..Default::default() };
        enqueue(&conn, "1", TaskKind::MonitorPing, &1, &opts, now).await.unwrap();

        assert!(claim_next(&conn, "1", now).await.unwrap().is_none());
        let later = now + chrono::Duration::seconds(61);
        assert!(claim_next(&conn, "1", later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failures_back_off_then_dead_letter() {
        let (store, _dir) = test_store().await;
        let conn = store.conn().await.unwrap();
        let mut now = Utc::now();

        let opts = EnqueueOptions { max_retries: 2, ..Default::default() };
        let id = enqueue(&conn, "1", TaskKind::MonitorPing, &1, &opts, now).await.unwrap();

        for attempt in 1..=2 {
            let job = claim_next(&conn, "1", now).await.unwrap().expect("job due");
            assert_eq!(job.failures, attempt - 1);
            fail(&conn, job.id, "boom", now).await.unwrap();

            // Not due again until the backoff elapses.
            assert!(claim_next(&conn, "1", now).await.unwrap().is_none());
            now += chrono::Duration::seconds(retry_backoff_seconds(attempt) + 1);
        }

        // Third failure exhausts max_retries = 2.
        let job = claim_next(&conn, "1", now).await.unwrap().expect("job due");
        fail(&conn, job.id, "boom", now).await.unwrap();

        now += chrono::Duration::seconds(3600);
        assert!(claim_next(&conn, "1", now).await.unwrap().is_none());

        let mut rows = conn
            .query("SELECT state, failures FROM queue_jobs WHERE id = ?1", params![id])
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<String>(0).unwrap(), "dead");
        assert_eq!(row.get::<i64>(1).unwrap(), 3);
    }

    #[tokio::test]
    async fn expired_leases_are_requeued() {
        let (store, _dir) = test_store().await;
        let conn = store.conn().await.unwrap();
        let now = Utc::now();

        let opts = EnqueueOptions { timeout_seconds: 10, ..Default::default() };
        enqueue(&conn, "1", TaskKind::MonitorPing, &1, &opts, now).await.unwrap();
        let job = claim_next(&conn, "1", now).await.unwrap().expect("job due");

        // Lease = timeout + grace; before expiry nothing is released.
        let before = now + chrono::Duration::seconds(5);
        assert_eq!(release_expired_leases(&conn, before).await.unwrap(), 0);

        let after = now + chrono::Duration::seconds(10 + LEASE_GRACE_SECONDS + 1);
        assert_eq!(release_expired_leases(&conn, after).await.unwrap(), 1);

        let redelivered = claim_next(&conn, "1", after).await.unwrap().expect("requeued");
        assert_eq!(redelivered.id, job.id);
    }
}
