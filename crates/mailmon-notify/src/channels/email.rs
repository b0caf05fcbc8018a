use crate::error::{NotifyError, Result};
use crate::plugin::{parse_config, ChannelPlugin};
use crate::{NotificationChannel, RenderedMessage};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use serde_json::Value;

pub struct EmailChannel {
    instance_id: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

impl EmailChannel {
    pub fn new(instance_id: &str, cfg: &EmailConfig) -> Result<Self> {
        let (from, recipients) = cfg.mailboxes()?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.smtp_host)
            .map_err(|e| NotifyError::Smtp(e.to_string()))?
            .port(cfg.smtp_port);

        if let (Some(user), Some(pass)) = (&cfg.smtp_username, &cfg.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            instance_id: instance_id.to_string(),
            transport: builder.build(),
            from,
            recipients,
        })
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    async fn send(&self, message: &RenderedMessage) -> Result<()> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(&message.title)
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        let email = builder
            .body(message.body.clone())
            .map_err(|e| NotifyError::Smtp(format!("cannot build message: {e}")))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;
        tracing::debug!(
            channel_id = %self.instance_id,
            recipients = self.recipients.len(),
            "Email sent"
        );
        Ok(())
    }

    fn channel_type(&self) -> &str {
        "email"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

// Plugin

#[derive(Debug, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub from: String,
    pub recipients: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

impl EmailConfig {
    fn mailboxes(&self) -> Result<(Mailbox, Vec<Mailbox>)> {
        let parse = |raw: &str| {
            raw.parse::<Mailbox>()
                .map_err(|e| NotifyError::InvalidConfig(format!("email: invalid address '{raw}': {e}")))
        };
        let from = parse(&self.from)?;
        let recipients = self
            .recipients
            .iter()
            .map(|r| parse(r))
            .collect::<Result<Vec<_>>>()?;
        Ok((from, recipients))
    }
}

pub struct EmailPlugin;

impl ChannelPlugin for EmailPlugin {
    fn name(&self) -> &str {
        "email"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: EmailConfig = parse_config("email", config)?;
        if cfg.smtp_host.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("email: smtp_host is empty".into()));
        }
        if cfg.recipients.is_empty() {
            return Err(NotifyError::InvalidConfig("email: no recipients".into()));
        }
        if cfg.smtp_username.is_some() != cfg.smtp_password.is_some() {
            return Err(NotifyError::InvalidConfig(
                "email: smtp_username and smtp_password must be set together".into(),
            ));
        }
        cfg.mailboxes().map(|_| ())
    }

    fn create_channel(&self, instance_id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>> {
        let cfg: EmailConfig = parse_config("email", config)?;
        Ok(Box::new(EmailChannel::new(instance_id, &cfg)?))
    }
}
