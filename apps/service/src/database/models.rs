use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of probe a monitor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    Http,
    TcpPing,
}

impl MonitorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorKind::Http => "http",
            MonitorKind::TcpPing => "tcp_ping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(MonitorKind::Http),
            "tcp_ping" => Some(MonitorKind::TcpPing),
            _ => None,
        }
    }
}

/// Derived monitor status. Written only by the incident engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Up,
    Down,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Up => "up",
            MonitorStatus::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(MonitorStatus::Up),
            "down" => Some(MonitorStatus::Down),
            _ => None,
        }
    }
}

/// Monitor model. The `config` blob is validated against the kind's schema
/// when the monitor is written; readers re-validate on use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Monitor {
    pub id: i64,
    pub team_id: i64,
    pub name: String,
    pub kind: MonitorKind,
    pub config: serde_json::Value,
    pub interval_seconds: i64,
    pub failure_threshold: i64,
    pub recovery_threshold: i64,
    pub status: MonitorStatus,
    pub region_ids: Vec<i64>,
    pub notification_ids: Vec<i64>,
    pub last_checked: Option<DateTime<Utc>>,
    pub next_check: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// HTTP request method for HTTP monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HttpMethod {
    #[default]
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "PATCH")]
    Patch,
    #[serde(rename = "HEAD")]
    Head,
    #[serde(rename = "OPTIONS")]
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// Encoding of the HTTP request body, used to pick a Content-Type when the
/// headers do not carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Json,
    Xml,
}

/// A single request header for an HTTP monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub key: String,
    pub value: String,
}

/// Expected config shape for HTTP monitors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpMonitorConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub max_redirects: u32,

    /// Seconds; 0 means the worker default.
    #[serde(default)]
    pub request_timeout: u64,
    #[serde(default)]
    pub headers: Vec<HttpHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<BodyEncoding>,
    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub upside_down_mode: bool,
    #[serde(default)]
    pub ignore_tls_error: bool,
    /// Empty means any 2xx is accepted.
    #[serde(default)]
    pub accepted_status_codes: Vec<u16>,
}

/// Expected config shape for TCP ping monitors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpPingConfig {
    /// `host:port` to connect to.
    pub host: String,
    /// Seconds; 0 means the worker default.
    #[serde(default)]
    pub timeout: u64,
}

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingStatus {
    Successful,
    Failed,
    Timeout,
}

impl PingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PingStatus::Successful => "successful",
            PingStatus::Failed => "failed",
            PingStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "successful" => Some(PingStatus::Successful),
            "failed" => Some(PingStatus::Failed),
            "timeout" => Some(PingStatus::Timeout),
            _ => None,
        }
    }

    /// Timeouts count as failures for threshold purposes.
    pub fn is_success(&self) -> bool {
        matches!(self, PingStatus::Successful)
    }
}

/// One probe record. Append-only; never updated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    pub time: DateTime<Utc>,
    pub monitor_id: i64,
    pub region_id: i64,
    pub status: PingStatus,
    pub latency_ms: i64,
    pub data: serde_json::Value,
}

/// Lifecycle status of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Investigating,
    Identified,
    Monitoring,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Identified => "identified",
            IncidentStatus::Monitoring => "monitoring",
            IncidentStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "investigating" => Some(IncidentStatus::Investigating),
            "identified" => Some(IncidentStatus::Identified),
            "monitoring" => Some(IncidentStatus::Monitoring),
            "resolved" => Some(IncidentStatus::Resolved),
            _ => None,
        }
    }
}

/// Incident model. At most one non-resolved incident exists per monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub monitor_id: i64,
    pub status: IncidentStatus,
    pub is_public: bool,
    pub auto_resolve: bool,
    pub title: Option<String>,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only timeline entry attached to an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub id: i64,
    pub incident_id: i64,
    pub event_type: String,
    pub message: String,
    pub public: bool,
    pub created_at: DateTime<Utc>,
}

/// Notification channel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Discord,
    Slack,
    Telegram,
    Email,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Discord => "discord",
            NotificationKind::Slack => "slack",
            NotificationKind::Telegram => "telegram",
            NotificationKind::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discord" => Some(NotificationKind::Discord),
            "slack" => Some(NotificationKind::Slack),
            "telegram" => Some(NotificationKind::Telegram),
            "email" => Some(NotificationKind::Email),
            _ => None,
        }
    }
}

/// Notification channel configured per team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub team_id: i64,
    pub kind: NotificationKind,
    pub name: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Config blob for discord and slack channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    pub webhook_url: String,
}

/// Config blob for telegram channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChannelConfig {
    pub bot_token: String,
    pub chat_id: String,
}

/// Config blob for email channels. First address is To, the rest are BCC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailChannelConfig {
    pub email_addresses: Vec<String>,
}

/// A probing locality; also names a queue partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub id: i64,
    /// ISO 3166-2 code.
    pub code: String,
    pub name: String,
}

/// Ownership scope for monitors and notification channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Hysteresis state per (monitor, region), kept on the join row.
#[derive(Debug, Clone, Default)]
pub struct RegionProbeState {
    pub consecutive_failures: i64,
    pub consecutive_successes: i64,
    pub last_outcome: Option<PingStatus>,
    /// Set when the region crossed the failure threshold and has not since
    /// crossed the recovery threshold.
    pub reported_down: bool,
}
