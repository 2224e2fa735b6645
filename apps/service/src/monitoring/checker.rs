use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;

use super::types::ProbeOutcome;
use crate::database::models::{BodyEncoding, HttpMonitorConfig, Monitor, TcpPingConfig};
use crate::error::ServiceError;

/// Worker default applied when a monitor config leaves its timeout at 0.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Capability implemented per monitor kind. One call is one probe attempt;
/// network failures become outcomes, never errors. An error means the config
/// blob could not be used and the job should be dropped.
///
/// `deadline_cap` is the probe's share of the enclosing job budget; the
/// effective deadline is the configured timeout upper-bounded by it, so the
/// checker always observes its own deadline and records a timeout outcome
/// instead of being cancelled from outside.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(
        &self,
        monitor: &Monitor,
        deadline_cap: Duration,
    ) -> Result<ProbeOutcome, ServiceError>;
}

/// HTTP/HTTPS prober.
pub struct HttpChecker {
    default_timeout: Duration,
}

impl HttpChecker {
    pub fn new() -> Self {
        Self { default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS) }
    }

    fn request_timeout(&self, cfg: &HttpMonitorConfig, deadline_cap: Duration) -> Duration {
        let configured = if cfg.request_timeout > 0 {
            Duration::from_secs(cfg.request_timeout)
        } else {
            self.default_timeout
        };
        configured.min(deadline_cap)
    }

    /// Per-probe client honoring the monitor's redirect and TLS rules.
    fn build_client(
        &self,
        cfg: &HttpMonitorConfig,
        deadline: Duration,
    ) -> Result<reqwest::Client, ServiceError> {
        let redirect = if cfg.max_redirects > 0 {
            reqwest::redirect::Policy::limited(cfg.max_redirects as usize)
        } else {
            reqwest::redirect::Policy::none()
        };

        reqwest::Client::builder()
            .redirect(redirect)
            .danger_accept_invalid_certs(cfg.ignore_tls_error)
            .timeout(deadline)
            .build()
            .map_err(|e| ServiceError::Validation(format!("build http client: {e}")))
    }
}

#[async_trait]
impl Checker for HttpChecker {
    async fn check(
        &self,
        monitor: &Monitor,
        deadline_cap: Duration,
    ) -> Result<ProbeOutcome, ServiceError> {
        let cfg: HttpMonitorConfig = serde_json::from_value(monitor.config.clone())
            .map_err(|e| ServiceError::Validation(format!("invalid http config: {e}")))?;

        let deadline = self.request_timeout(&cfg, deadline_cap);
        let client = self.build_client(&cfg, deadline)?;
        let method = reqwest::Method::from_bytes(cfg.method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut request = client.request(method, &cfg.url);
        let mut has_content_type = false;
        for header in &cfg.headers {
            if header.key.eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
            request = request.header(header.key.as_str(), header.value.as_str());
        }
        if !cfg.body.is_empty() {
            if !has_content_type {
                let content_type = match cfg.body_encoding {
                    Some(BodyEncoding::Json) => "application/json",
                    _ => "text/plain",
                };
                request = request.header(reqwest::header::CONTENT_TYPE, content_type);
            }
            request = request.body(cfg.body.clone());
        }

        let started = Instant::now();
        let result = request.send().await;
        let latency_ms = started.elapsed().as_millis() as i64;

        let outcome = match result {
            Ok(response) => {
                let code = response.status().as_u16();
                let is_accepted = accepted_status(&cfg.accepted_status_codes, code);
                let success = if cfg.upside_down_mode { !is_accepted } else { is_accepted };
                ProbeOutcome::http(success, latency_ms, code)
            }
            Err(error) if error.is_timeout() => ProbeOutcome::timeout(
                latency_ms,
                format!("deadline of {}s exceeded: {error}", deadline.as_secs()),
            ),
            Err(error) => ProbeOutcome::failure(latency_ms, error.to_string()),
        };
        Ok(outcome)
    }
}

/// Whether a status code passes the accept list; an empty list accepts 2xx.
pub(crate) fn accepted_status(accepted: &[u16], code: u16) -> bool {
    if accepted.is_empty() {
        return (200..300).contains(&code);
    }
    accepted.contains(&code)
}

/// TCP connect prober.
pub struct TcpChecker {
    default_timeout: Duration,
}

impl TcpChecker {
    pub fn new() -> Self {
        Self { default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS) }
    }
}

#[async_trait]
impl Checker for TcpChecker {
    async fn check(
        &self,
        monitor: &Monitor,
        deadline_cap: Duration,
    ) -> Result<ProbeOutcome, ServiceError> {
        let cfg: TcpPingConfig = serde_json::from_value(monitor.config.clone())
            .map_err(|e| ServiceError::Validation(format!("invalid tcp_ping config: {e}")))?;

        let configured = if cfg.timeout > 0 {
            Duration::from_secs(cfg.timeout)
        } else {
            self.default_timeout
        };
        let deadline = configured.min(deadline_cap);

        let started = Instant::now();
        let result = timeout(deadline, tokio::net::TcpStream::connect(&cfg.host)).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        let outcome = match result {
            Ok(Ok(_stream)) => ProbeOutcome::success(latency_ms),
            Ok(Err(error)) => ProbeOutcome::failure(latency_ms, format!("connect failed: {error}")),
            Err(_) => ProbeOutcome::timeout(
                latency_ms,
                format!("connect deadline of {}s exceeded", deadline.as_secs()),
            ),
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::database::models::{MonitorKind, MonitorStatus, PingStatus};

    /// Serve a single canned HTTP response on an ephemeral port.
    async fn serve_once(status_line: &'static str) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response =
                    format!("{status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    fn monitor_with(kind: MonitorKind, config: serde_json::Value) -> Monitor {
        let now = chrono::Utc::now();
        Monitor {
            id: 1,
            team_id: 1,
            name: "t".to_string(),
            kind,
            config,
            interval_seconds: 60,
            failure_threshold: 1,
            recovery_threshold: 1,
            status: MonitorStatus::Up,
            region_ids: vec![1],
            notification_ids: vec![],
            last_checked: None,
            next_check: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn empty_accept_list_means_2xx() {
        assert!(accepted_status(&[], 200));
        assert!(accepted_status(&[], 299));
        assert!(!accepted_status(&[], 300));
        assert!(!accepted_status(&[], 199));
    }

    #[test]
    fn explicit_accept_list_is_exact() {
        assert!(accepted_status(&[200, 301], 301));
        assert!(!accepted_status(&[200, 301], 302));
        assert!(!accepted_status(&[418], 200));
    }

    #[tokio::test]
    async fn accepted_response_classifies_as_successful() {
        let addr = serve_once("HTTP/1.1 204 No Content").await;
        let monitor =
            monitor_with(MonitorKind::Http, json!({"url": format!("http://{addr}/")}));
        let outcome = HttpChecker::new().check(&monitor, Duration::from_secs(120)).await.unwrap();
        assert_eq!(outcome.status, PingStatus::Successful);
        assert_eq!(outcome.data["http_status_code"], json!(204));
    }

    #[tokio::test]
    async fn upside_down_mode_inverts_only_the_accept_decision() {
        let addr = serve_once("HTTP/1.1 500 Internal Server Error").await;
        let monitor = monitor_with(
            MonitorKind::Http,
            json!({
                "url": format!("http://{addr}/"),
                "upside_down_mode": true,
                "accepted_status_codes": [200],
            }),
        );
        let outcome = HttpChecker::new().check(&monitor, Duration::from_secs(120)).await.unwrap();
        assert_eq!(outcome.status, PingStatus::Successful);
        assert_eq!(outcome.data["http_status_code"], json!(500));
    }

    #[tokio::test]
    async fn zero_redirects_makes_the_first_3xx_terminal() {
        let addr = serve_once("HTTP/1.1 302 Found\r\nlocation: http://127.0.0.1:9/").await;
        let monitor = monitor_with(
            MonitorKind::Http,
            json!({"url": format!("http://{addr}/"), "max_redirects": 0}),
        );
        let outcome = HttpChecker::new().check(&monitor, Duration::from_secs(120)).await.unwrap();
        assert_eq!(outcome.status, PingStatus::Failed);
        assert_eq!(outcome.data["http_status_code"], json!(302));
    }

    #[tokio::test]
    async fn slow_server_classifies_as_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((_socket, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        });

        let monitor = monitor_with(
            MonitorKind::Http,
            json!({"url": format!("http://{addr}/"), "request_timeout": 1}),
        );
        let outcome = HttpChecker::new().check(&monitor, Duration::from_secs(120)).await.unwrap();
        assert_eq!(outcome.status, PingStatus::Timeout);
        assert!(
            (900..=1500).contains(&outcome.latency_ms),
            "latency {} not near the 1s deadline",
            outcome.latency_ms
        );
        assert!(outcome.error().unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn job_budget_caps_the_default_deadline() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((_socket, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        // No request_timeout configured, so the 30s default would apply; the
        // 1s cap from the job budget must win.
        let monitor =
            monitor_with(MonitorKind::Http, json!({"url": format!("http://{addr}/")}));
        let outcome =
            HttpChecker::new().check(&monitor, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.status, PingStatus::Timeout);
        assert!(
            (900..=1500).contains(&outcome.latency_ms),
            "latency {} not near the capped deadline",
            outcome.latency_ms
        );
    }

    #[tokio::test]
    async fn malformed_config_is_a_validation_error() {
        let checker = HttpChecker::new();
        let monitor = monitor_with(MonitorKind::Http, serde_json::json!({"no_url": true}));
        let error = checker.check(&monitor, Duration::from_secs(120)).await.unwrap_err();
        assert!(matches!(error, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn tcp_connect_to_closed_port_fails() {
        // Port reservation: bind a listener, take its port, drop it so the
        // connect below lands on a (very likely) closed port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let checker = TcpChecker::new();
        let monitor = monitor_with(
            MonitorKind::TcpPing,
            serde_json::json!({"host": format!("127.0.0.1:{port}"), "timeout": 2}),
        );
        let outcome = checker.check(&monitor, Duration::from_secs(120)).await.unwrap();
        assert_eq!(outcome.status, PingStatus::Failed);
        assert!(outcome.error().is_some());
    }

    #[tokio::test]
    async fn tcp_connect_to_open_port_succeeds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let checker = TcpChecker::new();
        let monitor = monitor_with(
            MonitorKind::TcpPing,
            serde_json::json!({"host": addr.to_string(), "timeout": 2}),
        );
        let outcome = checker.check(&monitor, Duration::from_secs(120)).await.unwrap();
        assert_eq!(outcome.status, PingStatus::Successful);
    }
}
