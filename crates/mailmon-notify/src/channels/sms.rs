use crate::channels::check_response;
use crate::error::{NotifyError, Result};
use crate::plugin::{parse_config, require_http_url, ChannelPlugin};
use crate::{NotificationChannel, RenderedMessage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Generic HTTP SMS gateway: one JSON POST per phone number.
pub struct SmsChannel {
    instance_id: String,
    client: reqwest::Client,
    gateway_url: String,
    api_key: String,
    phone_numbers: Vec<String>,
}

impl SmsChannel {
    pub fn new(instance_id: &str, gateway_url: &str, api_key: &str, phone_numbers: Vec<String>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            client: reqwest::Client::new(),
            gateway_url: gateway_url.to_string(),
            api_key: api_key.to_string(),
            phone_numbers,
        }
    }

    async fn send_one(&self, phone: &str, text: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.gateway_url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "to": phone, "message": text }))
            .send()
            .await?;
        check_response("sms", resp).await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationChannel for SmsChannel {
    /// Attempts every number; fails if any number failed.
    async fn send(&self, message: &RenderedMessage) -> Result<()> {
        let text = message.short();
        let mut failed = Vec::new();
        for phone in &self.phone_numbers {
            if let Err(e) = self.send_one(phone, &text).await {
                tracing::warn!(phone = %phone, error = %e, "SMS send failed");
                failed.push(format!("{phone}: {e}"));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(NotifyError::Other(format!(
                "sms: {} of {} numbers failed ({})",
                failed.len(),
                self.phone_numbers.len(),
                failed.join("; ")
            )))
        }
    }

    fn channel_type(&self) -> &str {
        "sms"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

// Plugin

#[derive(Deserialize)]
struct SmsConfig {
    gateway_url: String,
    api_key: String,
    phone_numbers: Vec<String>,
}

pub struct SmsPlugin;

impl ChannelPlugin for SmsPlugin {
    fn name(&self) -> &str {
        "sms"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: SmsConfig = parse_config("sms", config)?;
        require_http_url("sms", "gateway_url", &cfg.gateway_url)?;
        if cfg.api_key.is_empty() {
            return Err(NotifyError::InvalidConfig("sms: api_key is empty".into()));
        }
        if cfg.phone_numbers.is_empty() {
            return Err(NotifyError::InvalidConfig("sms: no phone_numbers".into()));
        }
        Ok(())
    }

    fn create_channel(&self, instance_id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>> {
        let cfg: SmsConfig = parse_config("sms", config)?;
        Ok(Box::new(SmsChannel::new(
            instance_id,
            &cfg.gateway_url,
            &cfg.api_key,
            cfg.phone_numbers,
        )))
    }
}
