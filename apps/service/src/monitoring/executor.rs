use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::checker::{Checker, HttpChecker, TcpChecker};
use crate::clock::Clock;
use crate::database::Store;
use crate::database::models::{Monitor, MonitorKind, Ping};
use crate::database::repository;
use crate::error::ServiceError;
use crate::incident::IncidentEngine;

/// Seconds of the job budget reserved for the record write and the incident
/// engine, so the probe's deadline always fires before the queue timeout.
const RECORD_HEADROOM_SECONDS: i64 = 5;

/// Executes one probe and records its result.
///
/// One probe is one network attempt; the probe itself never retries. Writing
/// the record and running the incident engine happen in a single transaction,
/// and a failure there fails the enclosing queue job so the queue retries it.
pub struct ProbeExecutor {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    engine: IncidentEngine,
    http: HttpChecker,
    tcp: TcpChecker,
}

impl ProbeExecutor {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        let engine = IncidentEngine::new(Arc::clone(&clock));
        Self { store, clock, engine, http: HttpChecker::new(), tcp: TcpChecker::new() }
    }

    pub async fn execute(
        &self,
        monitor: &Monitor,
        region_id: i64,
        job_timeout_seconds: i64,
    ) -> Result<()> {
        let checker: &dyn Checker = match monitor.kind {
            MonitorKind::Http => &self.http,
            MonitorKind::TcpPing => &self.tcp,
        };

        // The probe gets the job budget minus headroom; a timeout is then
        // observed by the checker itself and recorded as a ping, never by the
        // queue cancelling the handler mid-flight.
        let deadline_cap =
            Duration::from_secs((job_timeout_seconds - RECORD_HEADROOM_SECONDS).max(1) as u64);

        let outcome = match checker.check(monitor, deadline_cap).await {
            Ok(outcome) => outcome,
            Err(ServiceError::Validation(message)) => {
                // A blob that no longer parses can never probe; retrying the
                // job would spin, so it is dropped.
                tracing::warn!(
                    monitor_id = monitor.id,
                    region_id,
                    %message,
                    "dropping probe job with unusable config"
                );
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        let ping = Ping {
            time: self.clock.now(),
            monitor_id: monitor.id,
            region_id,
            status: outcome.status,
            latency_ms: outcome.latency_ms,
            data: outcome.data,
        };

        let conn = self.store.conn().await?;
        let txn = conn.transaction().await?;
        repository::insert_ping(&txn, &ping).await?;
        self.engine.apply(&txn, monitor, region_id, &ping).await?;
        txn.commit().await?;

        tracing::debug!(
            monitor_id = monitor.id,
            region_id,
            status = ping.status.as_str(),
            latency_ms = ping.latency_ms,
            "probe recorded"
        );
        Ok(())
    }
}
