use serde_json::json;

use crate::database::models::PingStatus;

/// Result of executing one probe, before it is persisted as a ping.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status: PingStatus,
    pub latency_ms: i64,
    /// Protocol-specific blob: `http_status_code` and/or `error`.
    pub data: serde_json::Value,
}

impl ProbeOutcome {
    pub fn http(success: bool, latency_ms: i64, status_code: u16) -> Self {
        Self {
            status: if success { PingStatus::Successful } else { PingStatus::Failed },
            latency_ms,
            data: json!({ "http_status_code": status_code }),
        }
    }

    pub fn success(latency_ms: i64) -> Self {
        Self { status: PingStatus::Successful, latency_ms, data: json!({}) }
    }

    pub fn failure(latency_ms: i64, error: String) -> Self {
        Self { status: PingStatus::Failed, latency_ms, data: json!({ "error": error }) }
    }

    pub fn timeout(latency_ms: i64, error: String) -> Self {
        Self { status: PingStatus::Timeout, latency_ms, data: json!({ "error": error }) }
    }

    /// The error string, when the outcome carries one.
    pub fn error(&self) -> Option<&str> {
        self.data.get("error").and_then(|e| e.as_str())
    }
}
