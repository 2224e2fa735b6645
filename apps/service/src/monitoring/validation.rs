use url::Url;

use crate::database::models::{
    EmailChannelConfig, HttpMonitorConfig, MonitorKind, NotificationKind, TcpPingConfig,
    TelegramChannelConfig, WebhookChannelConfig,
};
use crate::error::ServiceError;

const MIN_INTERVAL_SECONDS: i64 = 10;
const MAX_BODY_BYTES: usize = 1_000_000;

fn invalid(msg: impl Into<String>) -> ServiceError {
    ServiceError::Validation(msg.into())
}

/// Validate the monitor-level fields shared by every kind.
pub fn validate_monitor_fields(
    name: &str,
    interval_seconds: i64,
    failure_threshold: i64,
    recovery_threshold: i64,
    region_ids: &[i64],
) -> Result<(), ServiceError> {
    if name.trim().is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > 255 {
        return Err(invalid("name too long (max 255 characters)"));
    }
    if interval_seconds < MIN_INTERVAL_SECONDS {
        return Err(invalid(format!("interval must be at least {MIN_INTERVAL_SECONDS} seconds")));
    }
    if failure_threshold < 1 {
        return Err(invalid("failure threshold must be at least 1"));
    }
    if recovery_threshold < 1 {
        return Err(invalid("recovery threshold must be at least 1"));
    }
    if region_ids.is_empty() {
        return Err(invalid("at least one region is required"));
    }
    Ok(())
}

/// Validate a config blob against the schema of its monitor kind.
///
/// Write paths call this before the blob is persisted; the probe executor
/// re-validates on read and drops jobs whose blob no longer parses.
pub fn validate_monitor_config(
    kind: MonitorKind,
    config: &serde_json::Value,
) -> Result<(), ServiceError> {
    match kind {
        MonitorKind::Http => {
            let cfg: HttpMonitorConfig = serde_json::from_value(config.clone())
                .map_err(|e| invalid(format!("invalid http config: {e}")))?;
            validate_http_config(&cfg)
        }
        MonitorKind::TcpPing => {
            let cfg: TcpPingConfig = serde_json::from_value(config.clone())
                .map_err(|e| invalid(format!("invalid tcp_ping config: {e}")))?;
            validate_tcp_config(&cfg)
        }
    }
}

fn validate_http_config(cfg: &HttpMonitorConfig) -> Result<(), ServiceError> {
    let url = Url::parse(&cfg.url).map_err(|e| invalid(format!("invalid url: {e}")))?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(invalid(format!("invalid scheme '{scheme}', must be http or https")));
    }
    if url.host_str().is_none() {
        return Err(invalid("url must have a host"));
    }
    if cfg.max_redirects > 1000 {
        return Err(invalid("max_redirects must be between 0 and 1000"));
    }
    if cfg.body.len() > MAX_BODY_BYTES {
        return Err(invalid("body too large"));
    }
    for code in &cfg.accepted_status_codes {
        if !(100..=599).contains(code) {
            return Err(invalid(format!("accepted status code {code} out of range")));
        }
    }
    for header in &cfg.headers {
        if header.key.trim().is_empty() {
            return Err(invalid("header key cannot be empty"));
        }
    }
    Ok(())
}

fn validate_tcp_config(cfg: &TcpPingConfig) -> Result<(), ServiceError> {
    let host = cfg.host.trim();
    if host.is_empty() {
        return Err(invalid("host cannot be empty"));
    }
    let Some((hostname, port)) = host.rsplit_once(':') else {
        return Err(invalid("host must be in 'host:port' form"));
    };
    if hostname.is_empty() {
        return Err(invalid("host must be in 'host:port' form"));
    }
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok(()),
        _ => Err(invalid("invalid port")),
    }
}

/// Validate a channel config blob against the schema of its kind.
pub fn validate_notification_config(
    kind: NotificationKind,
    config: &serde_json::Value,
) -> Result<(), ServiceError> {
    match kind {
        NotificationKind::Discord | NotificationKind::Slack => {
            let cfg: WebhookChannelConfig = serde_json::from_value(config.clone())
                .map_err(|e| invalid(format!("invalid webhook config: {e}")))?;
            let url =
                Url::parse(&cfg.webhook_url).map_err(|e| invalid(format!("invalid webhook_url: {e}")))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(invalid("webhook_url must be http or https"));
            }
            Ok(())
        }
        NotificationKind::Telegram => {
            let cfg: TelegramChannelConfig = serde_json::from_value(config.clone())
                .map_err(|e| invalid(format!("invalid telegram config: {e}")))?;
            if cfg.bot_token.trim().is_empty() {
                return Err(invalid("bot_token cannot be empty"));
            }
            if cfg.chat_id.trim().is_empty() {
                return Err(invalid("chat_id cannot be empty"));
            }
            Ok(())
        }
        NotificationKind::Email => {
            let cfg: EmailChannelConfig = serde_json::from_value(config.clone())
                .map_err(|e| invalid(format!("invalid email config: {e}")))?;
            if cfg.email_addresses.is_empty() {
                return Err(invalid("at least one email address is required"));
            }
            for address in &cfg.email_addresses {
                if !address.contains('@') {
                    return Err(invalid(format!("invalid email address '{address}'")));
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn monitor_fields_validation() {
        assert!(validate_monitor_fields("api", 60, 3, 2, &[1]).is_ok());
        assert!(validate_monitor_fields("", 60, 3, 2, &[1]).is_err());
        assert!(validate_monitor_fields("api", 5, 3, 2, &[1]).is_err());
        assert!(validate_monitor_fields("api", 60, 0, 2, &[1]).is_err());
        assert!(validate_monitor_fields("api", 60, 3, 0, &[1]).is_err());
        assert!(validate_monitor_fields("api", 60, 3, 2, &[]).is_err());
    }

    #[test]
    fn http_config_validation() {
        let ok = json!({"url": "https://example.com/health"});
        assert!(validate_monitor_config(MonitorKind::Http, &ok).is_ok());

        let bad_scheme = json!({"url": "ftp://example.com"});
        assert!(validate_monitor_config(MonitorKind::Http, &bad_scheme).is_err());

        let bad_redirects = json!({"url": "https://example.com", "max_redirects": 1001});
        assert!(validate_monitor_config(MonitorKind::Http, &bad_redirects).is_err());

        let bad_code = json!({"url": "https://example.com", "accepted_status_codes": [42]});
        assert!(validate_monitor_config(MonitorKind::Http, &bad_code).is_err());

        let not_a_blob = json!("https://example.com");
        assert!(validate_monitor_config(MonitorKind::Http, &not_a_blob).is_err());
    }

    #[test]
    fn tcp_config_validation() {
        assert!(validate_monitor_config(MonitorKind::TcpPing, &json!({"host": "db.internal:5432"}))
            .is_ok());
        assert!(validate_monitor_config(MonitorKind::TcpPing, &json!({"host": "db.internal"}))
            .is_err());
        assert!(validate_monitor_config(MonitorKind::TcpPing, &json!({"host": ":5432"})).is_err());
        assert!(
            validate_monitor_config(MonitorKind::TcpPing, &json!({"host": "db.internal:0"}))
                .is_err()
        );
    }

    #[test]
    fn notification_config_validation() {
        assert!(validate_notification_config(
            NotificationKind::Discord,
            &json!({"webhook_url": "https://discord.com/api/webhooks/1/x"})
        )
        .is_ok());
        assert!(
            validate_notification_config(NotificationKind::Slack, &json!({"webhook_url": "nope"}))
                .is_err()
        );
        assert!(validate_notification_config(
            NotificationKind::Telegram,
            &json!({"bot_token": "t", "chat_id": "42"})
        )
        .is_ok());
        assert!(validate_notification_config(
            NotificationKind::Email,
            &json!({"email_addresses": ["ops@example.com", "oncall@example.com"]})
        )
        .is_ok());
        assert!(validate_notification_config(
            NotificationKind::Email,
            &json!({"email_addresses": []})
        )
        .is_err());
        assert!(validate_notification_config(
            NotificationKind::Email,
            &json!({"email_addresses": ["not-an-address"]})
        )
        .is_err());
    }
}
