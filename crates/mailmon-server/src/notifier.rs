use async_trait::async_trait;
use mailmon_alert::AlertNotifier;
use mailmon_common::types::AlertEvent;
use mailmon_notify::Dispatcher;
use std::sync::Arc;

/// Routes engine and remediator events through the channel dispatcher.
pub struct DispatchNotifier(pub Arc<Dispatcher>);

#[async_trait]
impl AlertNotifier for DispatchNotifier {
    async fn notify(&self, event: &AlertEvent, channels: &[String]) {
        let results = self.0.dispatch(event, channels).await;
        for failed in results.iter().filter(|r| !r.success) {
            tracing::debug!(
                event_id = %event.id,
                channel = %failed.channel,
                error = failed.error.as_deref().unwrap_or("-"),
                "Channel delivery failed"
            );
        }
    }
}
