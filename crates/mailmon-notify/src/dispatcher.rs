use crate::error::NotifyError;
use crate::plugin::ChannelRegistry;
use crate::RenderedMessage;
use futures::future::join_all;
use mailmon_common::types::{AlertEvent, ChannelRecord, ChannelType};
use mailmon_storage::{with_retry, AlertEventStore, ChannelStore, RetryPolicy};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one channel delivery. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationResult {
    pub channel: String,
    pub channel_type: ChannelType,
    pub success: bool,
    pub error: Option<String>,
}

impl NotificationResult {
    fn ok(record: &ChannelRecord) -> Self {
        Self {
            channel: record.name.clone(),
            channel_type: record.channel_type,
            success: true,
            error: None,
        }
    }

    fn failed(record: &ChannelRecord, error: &NotifyError) -> Self {
        Self {
            channel: record.name.clone(),
            channel_type: record.channel_type,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Fans an alert event out to its named channels.
pub struct Dispatcher {
    channels: Arc<dyn ChannelStore>,
    events: Arc<dyn AlertEventStore>,
    registry: ChannelRegistry,
    send_timeout: Duration,
    write_retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        channels: Arc<dyn ChannelStore>,
        events: Arc<dyn AlertEventStore>,
        registry: ChannelRegistry,
        send_timeout: Duration,
    ) -> Self {
        Self {
            channels,
            events,
            registry,
            send_timeout,
            write_retry: RetryPolicy::default(),
        }
    }

    /// Overrides the retry policy used when marking events notified.
    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    /// Delivers `event` to every enabled channel named in `channel_names`.
    ///
    /// Channel names match a record's name or id; names with no enabled
    /// record are skipped. All senders run concurrently, each bounded by
    /// the send timeout, and one failure never stops the others. The event
    /// is marked notified once every attempt has finished, whatever the
    /// outcomes.
    pub async fn dispatch(&self, event: &AlertEvent, channel_names: &[String]) -> Vec<NotificationResult> {
        let targets = self.resolve(channel_names).await;
        let message = RenderedMessage::render(event);

        let attempts = targets.iter().map(|record| self.deliver(record, &message));
        let results = join_all(attempts).await;

        let failed = results.iter().filter(|r| !r.success).count();
        tracing::info!(
            event_id = %event.id,
            rule_id = %event.rule_id,
            channels = results.len(),
            failed,
            "Notification dispatch complete"
        );

        self.mark_notified(&event.id).await;
        results
    }

    async fn resolve(&self, channel_names: &[String]) -> Vec<ChannelRecord> {
        if channel_names.is_empty() {
            return Vec::new();
        }
        let enabled = match self.channels.list_enabled_channels().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "Cannot load notification channels");
                return Vec::new();
            }
        };

        let mut targets: Vec<ChannelRecord> = Vec::new();
        for name in channel_names {
            match enabled.iter().find(|c| &c.name == name || &c.id == name) {
                Some(record) if !targets.iter().any(|t| t.id == record.id) => {
                    targets.push(record.clone());
                }
                Some(_) => {}
                None => {
                    tracing::debug!(channel = %name, "Channel disabled or unknown, skipping");
                }
            }
        }
        targets
    }

    async fn deliver(&self, record: &ChannelRecord, message: &RenderedMessage) -> NotificationResult {
        let type_name = record.channel_type.as_str();
        let channel = match self
            .registry
            .create_channel(type_name, &record.id, &record.config)
        {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(
                    channel = %record.name,
                    channel_type = type_name,
                    config = %self.registry.redact_config(type_name, &record.config),
                    error = %e,
                    "Channel misconfigured, not sending"
                );
                return NotificationResult::failed(record, &e);
            }
        };

        let outcome = match tokio::time::timeout(self.send_timeout, channel.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout(self.send_timeout.as_secs())),
        };
        match outcome {
            Ok(()) => {
                tracing::debug!(channel = %record.name, channel_type = type_name, "Notification sent");
                NotificationResult::ok(record)
            }
            Err(e) => {
                tracing::warn!(
                    channel = %record.name,
                    channel_type = type_name,
                    error = %e,
                    "Notification failed"
                );
                NotificationResult::failed(record, &e)
            }
        }
    }

    async fn mark_notified(&self, event_id: &str) {
        let marked = with_retry(self.write_retry, "mark event notified", || {
            self.events.mark_notified(event_id)
        })
        .await;
        if let Err(e) = marked {
            tracing::error!(event_id, error = %e, "Giving up marking event notified");
        }
    }
}
