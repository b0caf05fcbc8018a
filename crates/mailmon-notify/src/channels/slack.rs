use crate::channels::check_response;
use crate::error::Result;
use crate::plugin::{parse_config, require_http_url, ChannelPlugin};
use crate::{NotificationChannel, RenderedMessage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Slack incoming-webhook channel.
pub struct SlackChannel {
    instance_id: String,
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackChannel {
    pub fn new(instance_id: &str, webhook_url: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            client: reqwest::Client::new(),
            webhook_url: webhook_url.to_string(),
        }
    }

    fn payload(message: &RenderedMessage) -> Value {
        serde_json::json!({
            "text": message.title,
            "attachments": [{
                "color": message.presentation.color,
                "title": message.title,
                "text": message.body,
                "ts": message.event.fired_at.timestamp(),
            }]
        })
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    async fn send(&self, message: &RenderedMessage) -> Result<()> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&Self::payload(message))
            .send()
            .await?;
        check_response("slack", resp).await?;
        Ok(())
    }

    fn channel_type(&self) -> &str {
        "slack"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

// Plugin

#[derive(Deserialize)]
struct SlackConfig {
    webhook_url: String,
}

pub struct SlackPlugin;

impl ChannelPlugin for SlackPlugin {
    fn name(&self) -> &str {
        "slack"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: SlackConfig = parse_config("slack", config)?;
        require_http_url("slack", "webhook_url", &cfg.webhook_url)
    }

    fn create_channel(&self, instance_id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>> {
        let cfg: SlackConfig = parse_config("slack", config)?;
        Ok(Box::new(SlackChannel::new(instance_id, &cfg.webhook_url)))
    }

    fn redact_config(&self, config: &Value) -> Value {
        // The webhook URL itself is the credential.
        let mut redacted = config.clone();
        if let Some(obj) = redacted.as_object_mut() {
            if obj.contains_key("webhook_url") {
                obj.insert("webhook_url".to_string(), Value::String("***".to_string()));
            }
        }
        redacted
    }
}
