//! Notification delivery with pluggable channel support.
//!
//! The [`Dispatcher`] resolves an alert's channel names against the enabled
//! channel records, instantiates each through its [`plugin::ChannelPlugin`]
//! and delivers one [`RenderedMessage`] to all of them concurrently.
//! Built-in channels: webhook, Slack, email (SMTP), SMS and DingTalk.

pub mod channels;
pub mod dispatcher;
pub mod error;
pub mod plugin;
pub mod presentation;
pub mod utils;

#[cfg(test)]
mod tests;

pub use dispatcher::{Dispatcher, NotificationResult};
pub use error::{NotifyError, Result};
pub use presentation::RenderedMessage;

use async_trait::async_trait;

/// A configured delivery target for rendered alert messages.
///
/// Implementations are created by the matching [`plugin::ChannelPlugin`]
/// after the channel's config has been validated.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Delivers `message` once. Implementations do not retry.
    async fn send(&self, message: &RenderedMessage) -> Result<()>;

    /// Returns the channel type name (e.g., `"email"`, `"webhook"`).
    fn channel_type(&self) -> &str;

    /// The channel record id this instance was created for.
    fn instance_id(&self) -> &str;
}
