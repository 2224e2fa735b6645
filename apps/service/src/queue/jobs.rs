use serde::{Deserialize, Serialize};

use crate::database::models::{Monitor, Ping};

/// Queue partition consumed by every notification dispatcher.
///
/// Probe jobs use the target region's id as the partition name instead, so a
/// worker only ever sees jobs for its own region.
pub const NOTIFICATIONS_QUEUE: &str = "notifications";

/// Wire kind of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    MonitorPing,
    NotificationDispatch,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::MonitorPing => "monitor:ping",
            TaskKind::NotificationDispatch => "notification:dispatch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monitor:ping" => Some(TaskKind::MonitorPing),
            "notification:dispatch" => Some(TaskKind::NotificationDispatch),
            _ => None,
        }
    }
}

/// Payload of a `monitor:ping` job. Carries a pinned monitor snapshot so the
/// worker probes the configuration that was current at scheduling time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingJob {
    pub monitor: Monitor,
    pub region_id: i64,
}

/// Payload of a `notification:dispatch` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub team_id: i64,
    pub monitor_id: i64,
    pub notification_id: i64,
    pub region_id: i64,
    /// The probe that triggered the transition; its status distinguishes a
    /// down notification from a recovery.
    pub ping: Ping,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
