pub mod discord;
pub mod email;
pub mod slack;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use crate::config::SmtpConfig;
use crate::database::Store;
use crate::database::models::{Notification, NotificationKind};
use crate::queue::{Job, JobHandler, NotificationJob};

use discord::DiscordSender;
use email::EmailSender;
use slack::SlackSender;
use telegram::TelegramSender;

/// Title and description rendered from a notification job.
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub title: String,
    pub description: String,
}

/// Capability implemented per channel kind.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn deliver(&self, channel: &Notification, message: &RenderedMessage) -> Result<()>;
}

/// POST a JSON payload and treat any non-2xx answer as a failure, so the
/// queue retries and eventually dead-letters the job.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    url: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let response = client.post(url).json(payload).send().await.context("post to provider")?;
    if !response.status().is_success() {
        bail!("provider returned HTTP {}", response.status().as_u16());
    }
    Ok(())
}

/// Consumes `notification:dispatch` jobs: resolves the channel, renders the
/// message, delivers via the channel's provider.
pub struct NotificationDispatcher {
    store: Arc<Store>,
    discord: DiscordSender,
    slack: SlackSender,
    telegram: TelegramSender,
    email: Option<EmailSender>,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<Store>, smtp: Option<&SmtpConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build notification http client")?;

        let email = smtp.map(EmailSender::new).transpose()?;

        Ok(Self {
            store,
            discord: DiscordSender::new(client.clone()),
            slack: SlackSender::new(client.clone()),
            telegram: TelegramSender::new(client),
            email,
        })
    }

    pub async fn dispatch(&self, job: &NotificationJob) -> Result<()> {
        let Some(channel) =
            self.store.get_notification(job.team_id, job.notification_id).await?
        else {
            tracing::warn!(
                team_id = job.team_id,
                notification_id = job.notification_id,
                monitor_id = job.monitor_id,
                "notification channel missing, dropping job"
            );
            return Ok(());
        };

        let message = self.render(job).await?;

        let result = match channel.kind {
            NotificationKind::Discord => self.discord.deliver(&channel, &message).await,
            NotificationKind::Slack => self.slack.deliver(&channel, &message).await,
            NotificationKind::Telegram => self.telegram.deliver(&channel, &message).await,
            NotificationKind::Email => match &self.email {
                Some(email) => email.deliver(&channel, &message).await,
                None => {
                    tracing::warn!(
                        notification_id = channel.id,
                        "SMTP is disabled, dropping email notification"
                    );
                    Ok(())
                }
            },
        };

        if result.is_ok() {
            tracing::info!(
                notification_id = channel.id,
                kind = channel.kind.as_str(),
                monitor_id = job.monitor_id,
                "notification delivered"
            );
        }
        result
    }

    async fn render(&self, job: &NotificationJob) -> Result<RenderedMessage> {
        let monitor_name = self
            .store
            .get_monitor(job.monitor_id)
            .await?
            .map(|m| m.name)
            .unwrap_or_else(|| format!("monitor #{}", job.monitor_id));
        let region = self
            .store
            .region_by_id(job.region_id)
            .await?
            .map(|r| r.code)
            .unwrap_or_else(|| format!("#{}", job.region_id));

        Ok(render_message(&monitor_name, &region, job))
    }
}

fn render_message(monitor_name: &str, region: &str, job: &NotificationJob) -> RenderedMessage {
    let when = job.ping.time.format("%Y-%m-%d %H:%M:%S UTC");
    if job.ping.status.is_success() {
        RenderedMessage {
            title: format!("Monitor {monitor_name} is UP in region {region}"),
            description: format!(
                "Recovered at {when} (latency {} ms).",
                job.ping.latency_ms
            ),
        }
    } else {
        let detail = job.detail.as_deref().unwrap_or("probe failed");
        RenderedMessage {
            title: format!("Monitor {monitor_name} went DOWN in region {region}"),
            description: format!("{detail} — observed at {when}."),
        }
    }
}

#[async_trait]
impl JobHandler for NotificationDispatcher {
    async fn handle(&self, job: &Job) -> Result<()> {
        let payload: NotificationJob = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(error) => {
                // A payload that does not decode will never decode; drop it.
                tracing::error!(job_id = job.id, %error, "undecodable notification payload");
                return Ok(());
            }
        };
        self.dispatch(&payload).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::database::models::{Ping, PingStatus};

    fn job_with(status: PingStatus, detail: Option<&str>) -> NotificationJob {
        NotificationJob {
            team_id: 1,
            monitor_id: 7,
            notification_id: 3,
            region_id: 2,
            ping: Ping {
                time: Utc::now(),
                monitor_id: 7,
                region_id: 2,
                status,
                latency_ms: 120,
                data: json!({}),
            },
            detail: detail.map(str::to_string),
        }
    }

    #[test]
    fn down_message_carries_the_detail() {
        let job = job_with(PingStatus::Failed, Some("HTTP 503"));
        let message = render_message("api", "DE-BE", &job);
        assert_eq!(message.title, "Monitor api went DOWN in region DE-BE");
        assert!(message.description.contains("HTTP 503"));
    }

    #[test]
    fn timeout_renders_as_down() {
        let job = job_with(PingStatus::Timeout, Some("deadline of 1s exceeded"));
        let message = render_message("api", "DE-BE", &job);
        assert!(message.title.contains("DOWN"));
        assert!(message.description.contains("deadline"));
    }

    #[test]
    fn recovery_message_mentions_latency() {
        let job = job_with(PingStatus::Successful, None);
        let message = render_message("api", "US-CA", &job);
        assert_eq!(message.title, "Monitor api is UP in region US-CA");
        assert!(message.description.contains("120 ms"));
    }
}
