use crate::error::{NotifyError, Result};
use crate::plugin::{parse_config, require_http_url, ChannelPlugin};
use crate::utils::{truncate_string, MAX_BODY_LENGTH};
use crate::{NotificationChannel, RenderedMessage};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub struct DingTalkChannel {
    instance_id: String,
    client: reqwest::Client,
    webhook_url: String,
    secret: Option<String>,
}

impl DingTalkChannel {
    pub fn new(instance_id: &str, webhook_url: &str, secret: Option<String>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            client: reqwest::Client::new(),
            webhook_url: webhook_url.to_string(),
            secret,
        }
    }

    /// Appends `timestamp` and the HMAC-SHA256 `sign` when a secret is set.
    pub fn sign_url(&self, timestamp_ms: i64) -> Result<String> {
        let Some(secret) = &self.secret else {
            return Ok(self.webhook_url.clone());
        };

        let string_to_sign = format!("{timestamp_ms}\n{secret}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| NotifyError::InvalidConfig(format!("dingtalk: bad secret: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        let sign = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        let separator = if self.webhook_url.contains('?') { '&' } else { '?' };
        Ok(format!(
            "{}{separator}timestamp={timestamp_ms}&sign={}",
            self.webhook_url,
            urlencoding::encode(&sign)
        ))
    }
}

#[async_trait]
impl NotificationChannel for DingTalkChannel {
    async fn send(&self, message: &RenderedMessage) -> Result<()> {
        let payload = serde_json::json!({
            "msgtype": "markdown",
            "markdown": {
                "title": message.title,
                "text": message.markdown(),
            }
        });
        let url = self.sign_url(chrono::Utc::now().timestamp_millis())?;

        let resp = self.client.post(&url).json(&payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::ApiError {
                service: "dingtalk".to_string(),
                status: status.as_u16(),
                body: truncate_string(&body, MAX_BODY_LENGTH),
            });
        }

        // DingTalk reports failures with HTTP 200 and a non-zero errcode.
        let body: Value = resp.json().await?;
        match body.get("errcode").and_then(Value::as_i64) {
            Some(0) => Ok(()),
            _ => {
                let errmsg = body
                    .get("errmsg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                Err(NotifyError::ApiError {
                    service: "dingtalk".to_string(),
                    status: status.as_u16(),
                    body: errmsg.to_string(),
                })
            }
        }
    }

    fn channel_type(&self) -> &str {
        "dingtalk"
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

// Plugin

#[derive(Deserialize)]
struct DingTalkConfig {
    webhook_url: String,
    secret: Option<String>,
}

pub struct DingTalkPlugin;

impl ChannelPlugin for DingTalkPlugin {
    fn name(&self) -> &str {
        "dingtalk"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let cfg: DingTalkConfig = parse_config("dingtalk", config)?;
        require_http_url("dingtalk", "webhook_url", &cfg.webhook_url)
    }

    fn create_channel(&self, instance_id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>> {
        let cfg: DingTalkConfig = parse_config("dingtalk", config)?;
        Ok(Box::new(DingTalkChannel::new(instance_id, &cfg.webhook_url, cfg.secret)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_url_appends_timestamp_and_signature() {
        let channel = DingTalkChannel::new(
            "c1",
            "https://oapi.dingtalk.com/robot/send?access_token=abc",
            Some("SECtest".into()),
        );
        let url = channel.sign_url(1_700_000_000_000).unwrap();
        assert!(url.starts_with(
            "https://oapi.dingtalk.com/robot/send?access_token=abc&timestamp=1700000000000&sign="
        ));
        let sign = url.rsplit("sign=").next().unwrap();
        assert!(!sign.is_empty());
        // Same input, same signature.
        assert_eq!(url, channel.sign_url(1_700_000_000_000).unwrap());
    }

    #[test]
    fn sign_url_without_secret_is_unchanged() {
        let channel = DingTalkChannel::new("c1", "https://example.com/hook", None);
        assert_eq!(channel.sign_url(1).unwrap(), "https://example.com/hook");
    }
}
