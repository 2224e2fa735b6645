use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{ChannelSender, RenderedMessage};
use crate::config::SmtpConfig;
use crate::database::models::{EmailChannelConfig, Notification};

pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl EmailSender {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .context("build smtp transport")?
            .port(config.port);

        if !config.username.is_empty() {
            builder = builder
                .credentials(Credentials::new(config.username.clone(), config.password.clone()));
        }

        Ok(Self { transport: builder.build(), from: config.from.clone() })
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    async fn deliver(&self, channel: &Notification, message: &RenderedMessage) -> Result<()> {
        let cfg: EmailChannelConfig =
            serde_json::from_value(channel.config.clone()).context("decode email config")?;

        let Some((to, bcc)) = cfg.email_addresses.split_first() else {
            // Write-time validation requires at least one address.
            anyhow::bail!("email channel has no addresses");
        };

        let mut builder = Message::builder()
            .from(self.from.parse().context("parse from address")?)
            .to(to.parse().with_context(|| format!("parse address '{to}'"))?)
            .subject(message.title.clone());
        for address in bcc {
            builder =
                builder.bcc(address.parse().with_context(|| format!("parse address '{address}'"))?);
        }

        let email = builder
            .header(ContentType::TEXT_PLAIN)
            .body(message.description.clone())
            .context("build email")?;

        self.transport.send(email).await.context("send email")?;
        Ok(())
    }
}
