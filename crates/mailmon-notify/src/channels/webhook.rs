use crate::channels::check_response;
use crate::error::Result;
use crate::plugin::{parse_config, require_http_url, ChannelPlugin};
use crate::{NotificationChannel, RenderedMessage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

pub struct WebhookChannel {
    instance_id: String,
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
}

impl WebhookChannel {
    pub fn new(instance_id: &str, url: &str, headers: HashMap<String, String>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
        }
    }

    fn payload(message: &RenderedMessage) -> Value {
        let event = &message.event;
        serde_json::json!({
            "alert_id": event.id,
            "rule_id": event.rule_id,
            "rule_name": event.rule_name,
            "node_id": event.node_id,
            "severity": event.severity,
            "status": event.status,
            "message": event.message,
            "details": event.details,
            "fired_at": event.fired_at.to_rfc3339(),
            "resolved_at": event.resolved_at.map(|t| t.to_rfc3339()),
            "escalation_level": event.escalation_level,
            "title": message.title,
            "icon": message.presentation.icon,
            "color": message.presentation.color,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, message: &RenderedMessage) -> Result<()> {
        let mut request = self.client.post(&self.url).json(&Self::payload(message));
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let resp = request.send().await?;
        check_response("webhook", resp).await?;
        Ok(())
    }

    fn channel_type(&self) -> &str {
        "webhook"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

// Plugin

#[derive(Deserialize)]
struct WebhookConfig {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

pub struct WebhookPlugin;

impl ChannelPlugin for WebhookPlugin {
    fn name(&self) -> &str {
        "webhook"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: WebhookConfig = parse_config("webhook", config)?;
        require_http_url("webhook", "url", &cfg.url)
    }

    fn create_channel(&self, instance_id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>> {
        let cfg: WebhookConfig = parse_config("webhook", config)?;
        Ok(Box::new(WebhookChannel::new(instance_id, &cfg.url, cfg.headers)))
    }

    fn redact_config(&self, config: &Value) -> Value {
        let mut redacted = crate::utils::redact_sensitive_json(config);
        // Header values commonly carry bearer tokens.
        if let Some(headers) = redacted.get_mut("headers").and_then(Value::as_object_mut) {
            for value in headers.values_mut() {
                *value = Value::String("***".to_string());
            }
        }
        redacted
    }
}
