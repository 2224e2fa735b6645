
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use libsql::Connection;

use crate::clock::Clock;
use crate::database::models::{Monitor, MonitorStatus, Ping};
use crate::database::repository;
use crate::queue::{self, EnqueueOptions, NOTIFICATIONS_QUEUE, NotificationJob, TaskKind};

/// Turns the stream of raw probe outcomes into monitor status and incident
/// lifecycle events.
///
/// `apply` runs on the probe executor's transaction, so counter updates,
/// status transitions, incident writes and notification enqueues commit
/// atomically with the ping insert. All transition edges are re-checked
/// against the store inside that transaction, which makes reprocessing a
/// duplicate probe outcome a no-op.
pub struct IncidentEngine {
    clock: Arc<dyn Clock>,
}

impl IncidentEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Fold one probe outcome for (monitor, region) into durable state.
    pub async fn apply(
        &self,
        conn: &Connection,
        monitor: &Monitor,
        region_id: i64,
        ping: &Ping,
    ) -> Result<()> {
        let now = self.clock.now();

        // The snapshot travelled through the queue; status and existence must
        // come from the store.
        let Some(current_status) = repository::monitor_status(conn, monitor.id).await? else {
            tracing::warn!(
                monitor_id = monitor.id,
                region_id,
                "monitor no longer exists, dropping probe outcome"
            );
            return Ok(());
        };

        let mut state = repository::region_state(conn, monitor.id, region_id).await?;
        if ping.status.is_success() {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
        }
        state.last_outcome = Some(ping.status);

        let crossed_down =
            !state.reported_down && state.consecutive_failures >= monitor.failure_threshold;
        let crossed_up =
            state.reported_down && state.consecutive_successes >= monitor.recovery_threshold;
        if crossed_down {
            state.reported_down = true;
        }
        if crossed_up {
            state.reported_down = false;
        }
        repository::save_region_state(conn, monitor.id, region_id, &state).await?;

        if crossed_down {
            self.on_region_down(conn, monitor, region_id, ping, current_status, now).await?;
        } else if crossed_up {
            self.on_region_recovered(conn, monitor, region_id, ping, current_status, now).await?;
        }
        Ok(())
    }

    /// A region crossed the failure threshold. Quorum-of-one: the first such
    /// region takes the monitor down and opens the incident.
    async fn on_region_down(
        &self,
        conn: &Connection,
        monitor: &Monitor,
        region_id: i64,
        ping: &Ping,
        current_status: MonitorStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let region = region_label(conn, region_id).await?;
        let detail = describe_ping(ping);

        match current_status {
            MonitorStatus::Up => {
                repository::set_monitor_status(conn, monitor.id, MonitorStatus::Down, now).await?;

                if let Some(open) = repository::open_incident(conn, monitor.id).await? {
                    // Duplicate or concurrent crossing: the incident already
                    // exists, so no second incident and no second round of
                    // notifications.
                    tracing::debug!(
                        monitor_id = monitor.id,
                        incident_id = open.id,
                        "incident already open, skipping open"
                    );
                    return Ok(());
                }

                let title = format!("{} is down", monitor.name);
                let incident_id =
                    repository::insert_incident(conn, monitor.id, &title, true, now).await?;
                repository::append_incident_event(
                    conn,
                    incident_id,
                    "monitor_down",
                    &format!("Monitor went down from region {region}: {detail}"),
                    now,
                )
                .await?;
                tracing::info!(
                    monitor_id = monitor.id,
                    region_id,
                    incident_id,
                    "monitor down, incident opened"
                );

                self.enqueue_notifications(conn, monitor, region_id, ping, Some(detail), now).await
            }
            MonitorStatus::Down => {
                // The outage spread to another region; note it on the open
                // incident's timeline.
                if let Some(open) = repository::open_incident(conn, monitor.id).await? {
                    repository::append_incident_event(
                        conn,
                        open.id,
                        "region_affected",
                        &format!("Region {region} is also failing: {detail}"),
                        now,
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }

    /// A region crossed the recovery threshold. The monitor comes back up
    /// once no region is still reporting down.
    async fn on_region_recovered(
        &self,
        conn: &Connection,
        monitor: &Monitor,
        region_id: i64,
        ping: &Ping,
        current_status: MonitorStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if current_status != MonitorStatus::Down {
            return Ok(());
        }
        if repository::reported_down_count(conn, monitor.id).await? > 0 {
            return Ok(());
        }

        repository::set_monitor_status(conn, monitor.id, MonitorStatus::Up, now).await?;

        let Some(open) = repository::open_incident(conn, monitor.id).await? else {
            return Ok(());
        };

        if open.auto_resolve {
            repository::resolve_incident(conn, open.id, now).await?;
            repository::append_incident_event(
                conn,
                open.id,
                "monitor_up",
                "All affected regions recovered",
                now,
            )
            .await?;
            tracing::info!(
                monitor_id = monitor.id,
                incident_id = open.id,
                "monitor recovered, incident resolved"
            );
            self.enqueue_notifications(conn, monitor, region_id, ping, None, now).await?;
        } else {
            // The operator owns resolution; only the status flips back.
            tracing::info!(
                monitor_id = monitor.id,
                incident_id = open.id,
                "monitor recovered, incident left open for operator"
            );
        }
        Ok(())
    }

    async fn enqueue_notifications(
        &self,
        conn: &Connection,
        monitor: &Monitor,
        region_id: i64,
        ping: &Ping,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for notification_id in &monitor.notification_ids {
            let job = NotificationJob {
                team_id: monitor.team_id,
                monitor_id: monitor.id,
                notification_id: *notification_id,
                region_id,
                ping: ping.clone(),
                detail: detail.clone(),
            };
            queue::enqueue(
                conn,
                NOTIFICATIONS_QUEUE,
                TaskKind::NotificationDispatch,
                &job,
                &EnqueueOptions::default(),
                now,
            )
            .await?;
        }
        Ok(())
    }
}

/// Human-readable cause extracted from a probe record.
fn describe_ping(ping: &Ping) -> String {
    if let Some(error) = ping.data.get("error").and_then(|e| e.as_str()) {
        return error.to_string();
    }
    if let Some(code) = ping.data.get("http_status_code").and_then(|c| c.as_i64()) {
        return format!("HTTP {code}");
    }
    format!("probe {}", ping.status.as_str())
}

async fn region_label(conn: &Connection, region_id: i64) -> Result<String> {
    let mut rows = conn
        .query("SELECT code FROM regions WHERE id = ?1", libsql::params![region_id])
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get(0)?),
        None => Ok(format!("#{region_id}")),
    }
}
