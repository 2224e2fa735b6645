use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use super::{ChannelSender, RenderedMessage, post_json};
use crate::database::models::{Notification, WebhookChannelConfig};

pub struct SlackSender {
    client: reqwest::Client,
}

impl SlackSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelSender for SlackSender {
    async fn deliver(&self, channel: &Notification, message: &RenderedMessage) -> Result<()> {
        let cfg: WebhookChannelConfig =
            serde_json::from_value(channel.config.clone()).context("decode slack config")?;

        let payload = json!({
            "text": format!("*{}*\n{}", message.title, message.description),
        });

        post_json(&self.client, &cfg.webhook_url, &payload).await
    }
}
