use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use super::{ChannelSender, RenderedMessage, post_json};
use crate::database::models::{Notification, TelegramChannelConfig};

pub struct TelegramSender {
    client: reqwest::Client,
}

impl TelegramSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelSender for TelegramSender {
    async fn deliver(&self, channel: &Notification, message: &RenderedMessage) -> Result<()> {
        let cfg: TelegramChannelConfig =
            serde_json::from_value(channel.config.clone()).context("decode telegram config")?;

        let url = format!("https://api.telegram.org/bot{}/sendMessage", cfg.bot_token);
        let payload = json!({
            "chat_id": cfg.chat_id,
            "text": format!("{}\n{}", message.title, message.description),
        });

        post_json(&self.client, &url, &payload).await
    }
}
