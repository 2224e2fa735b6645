use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use libsql::{Connection, params};

use super::models::{
    Incident, IncidentEvent, IncidentStatus, Monitor, MonitorKind, MonitorStatus, Notification,
    NotificationKind, Ping, PingStatus, Region, RegionProbeState, Team,
};
use crate::error::ServiceError;
use crate::pool::{LibsqlManager, LibsqlPool};

pub(crate) fn to_ts(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

pub(crate) fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Input for monitor creation. Callers validate the config blob first.
#[derive(Debug, Clone)]
pub struct NewMonitor {
    pub team_id: i64,
    pub name: String,
    pub kind: MonitorKind,
    pub config: serde_json::Value,
    pub interval_seconds: i64,
    pub failure_threshold: i64,
    pub recovery_threshold: i64,
    pub region_ids: Vec<i64>,
    pub notification_ids: Vec<i64>,
}

/// Pooled access to the durable store.
///
/// Multi-statement paths (probe recording, scheduling, monitor creation) run
/// inside one transaction; the connection-level functions below compose under
/// a caller-held transaction.
pub struct Store {
    pool: LibsqlPool,
}

impl Store {
    pub fn new(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    pub async fn conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| ServiceError::Transient(anyhow::anyhow!("acquire connection: {e}")).into())
    }

    // ===== Teams =====

    pub async fn create_team(&self, name: &str, now: DateTime<Utc>) -> Result<Team> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO teams (name, created_at) VALUES (?1, ?2)",
            params![name, to_ts(now)],
        )
        .await?;
        let id = conn.last_insert_rowid();
        Ok(Team { id, name: name.to_string(), created_at: now })
    }

    pub async fn team_by_name(&self, name: &str) -> Result<Option<Team>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT id, name, created_at FROM teams WHERE name = ?1", params![name])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Team {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: from_ts(row.get(2)?),
            })),
            None => Ok(None),
        }
    }

    // ===== Regions =====

    pub async fn upsert_region(&self, code: &str, name: &str) -> Result<Region> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO regions (code, name) VALUES (?1, ?2)
             ON CONFLICT(code) DO UPDATE SET name = excluded.name",
            params![code, name],
        )
        .await?;
        self.region_by_code(code)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("region {code}")).into())
    }

    pub async fn region_by_code(&self, code: &str) -> Result<Option<Region>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT id, code, name FROM regions WHERE code = ?1", params![code])
            .await?;
        match rows.next().await? {
            Some(row) => {
                Ok(Some(Region { id: row.get(0)?, code: row.get(1)?, name: row.get(2)? }))
            }
            None => Ok(None),
        }
    }

    pub async fn list_regions(&self) -> Result<Vec<Region>> {
        let conn = self.conn().await?;
        let mut rows = conn.query("SELECT id, code, name FROM regions ORDER BY code", ()).await?;
        let mut regions = Vec::new();
        while let Some(row) = rows.next().await? {
            regions.push(Region { id: row.get(0)?, code: row.get(1)?, name: row.get(2)? });
        }
        Ok(regions)
    }

    pub async fn region_by_id(&self, id: i64) -> Result<Option<Region>> {
        let conn = self.conn().await?;
        let mut rows =
            conn.query("SELECT id, code, name FROM regions WHERE id = ?1", params![id]).await?;
        match rows.next().await? {
            Some(row) => {
                Ok(Some(Region { id: row.get(0)?, code: row.get(1)?, name: row.get(2)? }))
            }
            None => Ok(None),
        }
    }

    // ===== Monitors =====

    /// Create a monitor plus its region and notification joins in one
    /// transaction. Every referenced region must exist; a monitor with zero
    /// regions is rejected.
    pub async fn create_monitor(&self, new: NewMonitor, now: DateTime<Utc>) -> Result<Monitor> {
        if new.region_ids.is_empty() {
            return Err(
                ServiceError::Validation("monitor needs at least one region".to_string()).into()
            );
        }

        let conn = self.conn().await?;
        let txn = conn.transaction().await?;

        for region_id in &new.region_ids {
            let mut rows = txn
                .query("SELECT 1 FROM regions WHERE id = ?1", params![*region_id])
                .await?;
            if rows.next().await?.is_none() {
                return Err(
                    ServiceError::Validation(format!("unknown region id {region_id}")).into()
                );
            }
        }

        txn.execute(
            "INSERT INTO monitors
                (team_id, name, kind, config, interval_seconds, failure_threshold,
                 recovery_threshold, status, next_check, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'up', ?8, ?8, ?8)",
            params![
                new.team_id,
                new.name.as_str(),
                new.kind.as_str(),
                new.config.to_string(),
                new.interval_seconds,
                new.failure_threshold,
                new.recovery_threshold,
                to_ts(now)
            ],
        )
        .await?;
        let id = txn.last_insert_rowid();

        for region_id in &new.region_ids {
            txn.execute(
                "INSERT INTO monitor_regions (monitor_id, region_id) VALUES (?1, ?2)",
                params![id, *region_id],
            )
            .await?;
        }
        for notification_id in &new.notification_ids {
            txn.execute(
                "INSERT INTO monitor_notifications (monitor_id, notification_id) VALUES (?1, ?2)",
                params![id, *notification_id],
            )
            .await?;
        }

        txn.commit().await?;

        self.get_monitor(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("monitor {id}")).into())
    }

    pub async fn get_monitor(&self, id: i64) -> Result<Option<Monitor>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(&format!("{MONITOR_SELECT} WHERE id = ?1"), params![id])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(read_monitor(&conn, &row).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_monitors(&self, team_id: i64) -> Result<Vec<Monitor>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!("{MONITOR_SELECT} WHERE team_id = ?1 ORDER BY id"),
                params![team_id],
            )
            .await?;
        let mut monitors = Vec::new();
        while let Some(row) = rows.next().await? {
            monitors.push(read_monitor(&conn, &row).await?);
        }
        Ok(monitors)
    }

    pub async fn delete_monitor(&self, team_id: i64, id: i64) -> Result<bool> {
        let conn = self.conn().await?;
        let affected = conn
            .execute("DELETE FROM monitors WHERE id = ?1 AND team_id = ?2", params![id, team_id])
            .await?;
        Ok(affected > 0)
    }

    /// All monitors due for a probe, ordered by how overdue they are.
    pub async fn monitors_due(&self, now: DateTime<Utc>) -> Result<Vec<Monitor>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!("{MONITOR_SELECT} WHERE next_check <= ?1 ORDER BY next_check ASC"),
                params![to_ts(now)],
            )
            .await?;
        let mut monitors = Vec::new();
        while let Some(row) = rows.next().await? {
            monitors.push(read_monitor(&conn, &row).await?);
        }
        Ok(monitors)
    }

    // ===== Notifications =====

    pub async fn create_notification(
        &self,
        team_id: i64,
        kind: NotificationKind,
        name: &str,
        config: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Notification> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO notifications (team_id, kind, name, config, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![team_id, kind.as_str(), name, config.to_string(), to_ts(now)],
        )
        .await?;
        let id = conn.last_insert_rowid();
        Ok(Notification { id, team_id, kind, name: name.to_string(), config, created_at: now })
    }

    pub async fn get_notification(
        &self,
        team_id: i64,
        id: i64,
    ) -> Result<Option<Notification>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, team_id, kind, name, config, created_at
                 FROM notifications WHERE id = ?1 AND team_id = ?2",
                params![id, team_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(read_notification(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_notifications(&self, team_id: i64) -> Result<Vec<Notification>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, team_id, kind, name, config, created_at
                 FROM notifications WHERE team_id = ?1 ORDER BY id",
                params![team_id],
            )
            .await?;
        let mut notifications = Vec::new();
        while let Some(row) = rows.next().await? {
            notifications.push(read_notification(&row)?);
        }
        Ok(notifications)
    }

    // ===== Pings =====

    pub async fn recent_pings(&self, monitor_id: i64, limit: usize) -> Result<Vec<Ping>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT time, monitor_id, region_id, status, latency_ms, data
                 FROM pings WHERE monitor_id = ?1 ORDER BY time DESC LIMIT ?2",
                params![monitor_id, limit as i64],
            )
            .await?;
        let mut pings = Vec::new();
        while let Some(row) = rows.next().await? {
            pings.push(read_ping(&row)?);
        }
        Ok(pings)
    }

    /// Drop probe records older than the cutoff. Returns rows deleted.
    pub async fn prune_pings_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn().await?;
        let deleted =
            conn.execute("DELETE FROM pings WHERE time < ?1", params![to_ts(cutoff)]).await?;
        Ok(deleted)
    }

    // ===== Incidents =====

    pub async fn list_incidents(&self, monitor_id: Option<i64>) -> Result<Vec<Incident>> {
        let conn = self.conn().await?;
        let mut rows = match monitor_id {
            Some(id) => {
                conn.query(
                    &format!("{INCIDENT_SELECT} WHERE monitor_id = ?1 ORDER BY started_at DESC"),
                    params![id],
                )
                .await?
            }
            None => {
                conn.query(&format!("{INCIDENT_SELECT} ORDER BY started_at DESC"), ()).await?
            }
        };
        let mut incidents = Vec::new();
        while let Some(row) = rows.next().await? {
            incidents.push(read_incident(&row)?);
        }
        Ok(incidents)
    }

    pub async fn incident_events(&self, incident_id: i64) -> Result<Vec<IncidentEvent>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, incident_id, event_type, message, public, created_at
                 FROM incident_events WHERE incident_id = ?1 ORDER BY id",
                params![incident_id],
            )
            .await?;
        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(IncidentEvent {
                id: row.get(0)?,
                incident_id: row.get(1)?,
                event_type: row.get(2)?,
                message: row.get(3)?,
                public: row.get::<i64>(4)? != 0,
                created_at: from_ts(row.get(5)?),
            });
        }
        Ok(events)
    }

    pub async fn open_incident_for(&self, monitor_id: i64) -> Result<Option<Incident>> {
        let conn = self.conn().await?;
        open_incident(&conn, monitor_id).await
    }
}

const MONITOR_SELECT: &str = "SELECT id, team_id, name, kind, config, interval_seconds, \
     failure_threshold, recovery_threshold, status, last_checked, next_check, created_at, \
     updated_at FROM monitors";

const INCIDENT_SELECT: &str = "SELECT id, monitor_id, status, is_public, auto_resolve, title, \
     started_at, resolved_at, created_at, updated_at FROM incidents";

async fn read_monitor(conn: &Connection, row: &libsql::Row) -> Result<Monitor> {
    let id: i64 = row.get(0)?;
    let kind_str: String = row.get(3)?;
    let config_str: String = row.get(4)?;
    let status_str: String = row.get(8)?;
    let last_checked: Option<i64> = row.get(9)?;

    let (region_ids, notification_ids) = monitor_links(conn, id).await?;

    Ok(Monitor {
        id,
        team_id: row.get(1)?,
        name: row.get(2)?,
        kind: MonitorKind::parse(&kind_str)
            .ok_or_else(|| ServiceError::Validation(format!("unknown monitor kind {kind_str}")))?,
        config: serde_json::from_str(&config_str).unwrap_or(serde_json::Value::Null),
        interval_seconds: row.get(5)?,
        failure_threshold: row.get(6)?,
        recovery_threshold: row.get(7)?,
        status: MonitorStatus::parse(&status_str).unwrap_or(MonitorStatus::Up),
        region_ids,
        notification_ids,
        last_checked: last_checked.map(from_ts),
        next_check: from_ts(row.get(10)?),
        created_at: from_ts(row.get(11)?),
        updated_at: from_ts(row.get(12)?),
    })
}

async fn monitor_links(conn: &Connection, monitor_id: i64) -> Result<(Vec<i64>, Vec<i64>)> {
    let mut region_ids = Vec::new();
    let mut rows = conn
        .query(
            "SELECT region_id FROM monitor_regions WHERE monitor_id = ?1 ORDER BY region_id",
            params![monitor_id],
        )
        .await?;
    while let Some(row) = rows.next().await? {
        region_ids.push(row.get(0)?);
    }

    let mut notification_ids = Vec::new();
    let mut rows = conn
        .query(
            "SELECT notification_id FROM monitor_notifications WHERE monitor_id = ?1
             ORDER BY notification_id",
            params![monitor_id],
        )
        .await?;
    while let Some(row) = rows.next().await? {
        notification_ids.push(row.get(0)?);
    }

    Ok((region_ids, notification_ids))
}

fn read_notification(row: &libsql::Row) -> Result<Notification> {
    let kind_str: String = row.get(2)?;
    let config_str: String = row.get(4)?;
    Ok(Notification {
        id: row.get(0)?,
        team_id: row.get(1)?,
        kind: NotificationKind::parse(&kind_str)
            .ok_or_else(|| ServiceError::Validation(format!("unknown channel kind {kind_str}")))?,
        name: row.get(3)?,
        config: serde_json::from_str(&config_str).unwrap_or(serde_json::Value::Null),
        created_at: from_ts(row.get(5)?),
    })
}

fn read_ping(row: &libsql::Row) -> Result<Ping> {
    let status_str: String = row.get(3)?;
    let data_str: String = row.get(5)?;
    Ok(Ping {
        time: from_ts(row.get(0)?),
        monitor_id: row.get(1)?,
        region_id: row.get(2)?,
        status: PingStatus::parse(&status_str).unwrap_or(PingStatus::Failed),
        latency_ms: row.get(4)?,
        data: serde_json::from_str(&data_str).unwrap_or(serde_json::Value::Null),
    })
}

fn read_incident(row: &libsql::Row) -> Result<Incident> {
    let status_str: String = row.get(2)?;
    let resolved_at: Option<i64> = row.get(7)?;
    Ok(Incident {
        id: row.get(0)?,
        monitor_id: row.get(1)?,
        status: IncidentStatus::parse(&status_str).unwrap_or(IncidentStatus::Investigating),
        is_public: row.get::<i64>(3)? != 0,
        auto_resolve: row.get::<i64>(4)? != 0,
        title: row.get(5)?,
        started_at: from_ts(row.get(6)?),
        resolved_at: resolved_at.map(from_ts),
        created_at: from_ts(row.get(8)?),
        updated_at: from_ts(row.get(9)?),
    })
}

// ===== Connection-level operations =====
//
// These compose under a caller-held transaction (libsql transactions deref to
// a Connection), so probe insertion, status transitions, incident lifecycle
// and notification enqueues commit or roll back as one unit.

pub(crate) async fn insert_ping(conn: &Connection, ping: &Ping) -> Result<()> {
    conn.execute(
        "INSERT INTO pings (time, monitor_id, region_id, status, latency_ms, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            to_ts(ping.time),
            ping.monitor_id,
            ping.region_id,
            ping.status.as_str(),
            ping.latency_ms,
            ping.data.to_string()
        ],
    )
    .await?;
    Ok(())
}

pub(crate) async fn monitor_status(
    conn: &Connection,
    monitor_id: i64,
) -> Result<Option<MonitorStatus>> {
    let mut rows = conn
        .query("SELECT status FROM monitors WHERE id = ?1", params![monitor_id])
        .await?;
    match rows.next().await? {
        Some(row) => {
            let status: String = row.get(0)?;
            Ok(MonitorStatus::parse(&status))
        }
        None => Ok(None),
    }
}

pub(crate) async fn set_monitor_status(
    conn: &Connection,
    monitor_id: i64,
    status: MonitorStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE monitors SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), to_ts(now), monitor_id],
    )
    .await?;
    Ok(())
}

/// Scheduler-owned update of the scheduling fields.
pub(crate) async fn mark_scheduled(
    conn: &Connection,
    monitor_id: i64,
    last_checked: DateTime<Utc>,
    next_check: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE monitors SET last_checked = ?1, next_check = ?2, updated_at = ?1 WHERE id = ?3",
        params![to_ts(last_checked), to_ts(next_check), monitor_id],
    )
    .await?;
    Ok(())
}

pub(crate) async fn region_state(
    conn: &Connection,
    monitor_id: i64,
    region_id: i64,
) -> Result<RegionProbeState> {
    let mut rows = conn
        .query(
            "SELECT consecutive_failures, consecutive_successes, last_outcome, reported_down
             FROM monitor_regions WHERE monitor_id = ?1 AND region_id = ?2",
            params![monitor_id, region_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => {
            let last_outcome: Option<String> = row.get(2)?;
            Ok(RegionProbeState {
                consecutive_failures: row.get(0)?,
                consecutive_successes: row.get(1)?,
                last_outcome: last_outcome.as_deref().and_then(PingStatus::parse),
                reported_down: row.get::<i64>(3)? != 0,
            })
        }
        None => Ok(RegionProbeState::default()),
    }
}

pub(crate) async fn save_region_state(
    conn: &Connection,
    monitor_id: i64,
    region_id: i64,
    state: &RegionProbeState,
) -> Result<()> {
    conn.execute(
        "INSERT INTO monitor_regions
            (monitor_id, region_id, consecutive_failures, consecutive_successes, last_outcome,
             reported_down)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(monitor_id, region_id) DO UPDATE SET
            consecutive_failures = excluded.consecutive_failures,
            consecutive_successes = excluded.consecutive_successes,
            last_outcome = excluded.last_outcome,
            reported_down = excluded.reported_down",
        params![
            monitor_id,
            region_id,
            state.consecutive_failures,
            state.consecutive_successes,
            state.last_outcome.map(|o| o.as_str()),
            state.reported_down as i64
        ],
    )
    .await?;
    Ok(())
}

pub(crate) async fn reported_down_count(conn: &Connection, monitor_id: i64) -> Result<i64> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM monitor_regions WHERE monitor_id = ?1 AND reported_down = 1",
            params![monitor_id],
        )
        .await?;
    let row = rows.next().await?.context("count query returned no rows")?;
    Ok(row.get(0)?)
}

pub(crate) async fn open_incident(
    conn: &Connection,
    monitor_id: i64,
) -> Result<Option<Incident>> {
    let mut rows = conn
        .query(
            &format!("{INCIDENT_SELECT} WHERE monitor_id = ?1 AND status != 'resolved' LIMIT 1"),
            params![monitor_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(read_incident(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn insert_incident(
    conn: &Connection,
    monitor_id: i64,
    title: &str,
    auto_resolve: bool,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO incidents
            (monitor_id, status, is_public, auto_resolve, title, started_at, created_at,
             updated_at)
         VALUES (?1, 'investigating', 0, ?2, ?3, ?4, ?4, ?4)",
        params![monitor_id, auto_resolve as i64, title, to_ts(now)],
    )
    .await?;
    Ok(conn.last_insert_rowid())
}

pub(crate) async fn resolve_incident(
    conn: &Connection,
    incident_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE incidents SET status = 'resolved', resolved_at = ?1, updated_at = ?1
         WHERE id = ?2 AND status != 'resolved'",
        params![to_ts(now), incident_id],
    )
    .await?;
    Ok(())
}

pub(crate) async fn append_incident_event(
    conn: &Connection,
    incident_id: i64,
    event_type: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO incident_events (incident_id, event_type, message, public, created_at)
         VALUES (?1, ?2, ?3, 1, ?4)",
        params![incident_id, event_type, message, to_ts(now)],
    )
    .await?;
    Ok(())
}
