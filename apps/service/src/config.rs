use std::env;

use anyhow::{Context, Result, bail};

/// Runtime configuration, read once from the environment at startup.
///
/// A `.env` file in the working directory is honored via dotenvy.
#[derive(Debug, Clone)]
pub struct Config {
    /// libsql database: a local file path or a `libsql://` URL.
    pub db_url: String,
    /// Auth token for remote databases.
    pub db_auth_token: Option<String>,

    /// Region this worker probes from (must match one of `app_regions`).
    pub app_region: String,
    /// All regions, ISO 3166-2 codes, seeded at startup.
    pub app_regions: Vec<String>,

    pub api_port: u16,
    pub scheduler_tick_seconds: u64,
    pub scheduler_batch_size: usize,
    pub worker_concurrency: usize,
    pub ping_retention_days: i64,

    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(val) => val.parse().unwrap_or(default),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let db_url = env::var("DB_URL").unwrap_or_else(|_| "outpost.db".to_string());
        let db_auth_token = env::var("DB_AUTH_TOKEN").ok().filter(|t| !t.is_empty());

        let app_region = env_or("APP_REGION", "TW-TPE".to_string());
        let app_regions: Vec<String> = env::var("APP_REGIONS")
            .unwrap_or_else(|_| app_region.clone())
            .split(',')
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();

        if app_regions.is_empty() {
            bail!("APP_REGIONS must name at least one region");
        }
        if !app_regions.contains(&app_region) {
            bail!("APP_REGION '{app_region}' is not listed in APP_REGIONS");
        }

        let smtp = if env_or("SMTP_ENABLED", false) {
            Some(SmtpConfig {
                host: env::var("SMTP_HOST").context("SMTP_ENABLED is set but SMTP_HOST is not")?,
                port: env_or("SMTP_PORT", 587),
                username: env::var("SMTP_USERNAME").unwrap_or_default(),
                password: env::var("SMTP_PASSWORD").unwrap_or_default(),
                from: env::var("SMTP_FROM").context("SMTP_ENABLED is set but SMTP_FROM is not")?,
            })
        } else {
            None
        };

        Ok(Self {
            db_url,
            db_auth_token,
            app_region,
            app_regions,
            api_port: env_or("API_PORT", 8000),
            scheduler_tick_seconds: env_or("SCHEDULER_TICK_SECONDS", 2),
            scheduler_batch_size: env_or("SCHEDULER_BATCH_SIZE", 150),
            worker_concurrency: env_or("WORKER_CONCURRENCY", 50),
            ping_retention_days: env_or("PING_RETENTION_DAYS", 90),
            smtp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_garbage() {
        env::set_var("OUTPOST_TEST_PORT", "not-a-number");
        let port: u16 = env_or("OUTPOST_TEST_PORT", 8000);
        assert_eq!(port, 8000);
        env::remove_var("OUTPOST_TEST_PORT");
    }
}
