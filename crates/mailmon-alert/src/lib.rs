//! Rule evaluation, debounce/cooldown tracking and auto-remediation.
//!
//! A rule pass re-reads enabled rules, decodes each condition once
//! ([`condition`]), evaluates it against the snapshot source
//! ([`evaluator`]), and feeds the result through the per-rule state machine
//! ([`state`]) which decides whether to fire, resolve or wait. Fired and
//! resolved events are handed to an [`AlertNotifier`] and published on the
//! live feed ([`publish`]). The [`remediation`] module runs the
//! consecutive-observation pause/restore policy on its own cadence.

pub mod condition;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod publish;
pub mod remediation;
pub mod retry;
pub mod rule;
pub mod state;


use async_trait::async_trait;
use mailmon_common::types::AlertEvent;

pub use error::{AlertError, Result};

/// Delivers an alert event to named notification channels.
///
/// Implementations attempt every channel and record that an attempt was
/// made; delivery failures are theirs to report, not the caller's.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, event: &AlertEvent, channels: &[String]);
}

/// Notifier that drops every event, for deployments without channels.
pub struct NoopNotifier;

#[async_trait]
impl AlertNotifier for NoopNotifier {
    async fn notify(&self, _event: &AlertEvent, _channels: &[String]) {}
}
