//! Storage interfaces consumed by the alert engine, dispatcher and remediator.
//!
//! Each external system the engine talks to is a trait here: the metric
//! snapshot source, the durable rule-state key/value store, the alert event
//! store, the rule and channel records, the observation history and the
//! remediation targets. [`sqlite::SqliteStore`] implements all of them on a
//! single WAL-mode SQLite database; [`memory::MemoryStore`] implements them
//! in process for tests and dry runs.

pub mod error;
pub mod memory;
pub mod retry;
pub mod sqlite;


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailmon_common::metrics::MetricName;
use mailmon_common::types::{
    AlertEvent, ChannelRecord, MetricSnapshot, MetricSource, Observation, RemediationTarget,
    RuleRecord, TargetStatus,
};

pub use error::{Result, StorageError};
pub use retry::{with_retry, RetryPolicy};

/// Read-only "latest value per entity in a window" query surface over the
/// time-series store.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Latest snapshot per entity for `metric` reported at or after `since`.
    async fn latest_per_entity(
        &self,
        metric: &MetricName,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSnapshot>>;

    /// Last report time of every entity the source has ever seen.
    async fn last_seen(&self, source: MetricSource) -> Result<Vec<(String, DateTime<Utc>)>>;

    /// Number of events reported for a counter metric at or after `since`.
    ///
    /// Counter samples carry the number of events since the previous sample,
    /// so the count is the sum of sample values across all entities.
    async fn event_count(&self, metric: &MetricName, since: DateTime<Utc>) -> Result<u64>;
}

/// Durable per-key timestamp store with expiry, used for rule runtime state.
///
/// Keys are independent; no operation spans more than one key.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the value if the key exists and has not expired at `now`.
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>>;

    /// Writes the value unconditionally.
    async fn set(&self, key: &str, value: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<()>;

    /// Writes the value only if the key is absent or expired at `now`.
    /// Returns whether the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Removes keys expired at `now`. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Cheap liveness probe used at startup.
    async fn ping(&self) -> Result<()>;
}

/// Append-mostly record of alert lifecycles.
#[async_trait]
pub trait AlertEventStore: Send + Sync {
    async fn insert_event(&self, event: &AlertEvent) -> Result<()>;

    async fn get_event(&self, event_id: &str) -> Result<Option<AlertEvent>>;

    /// The open (firing) event for a rule, if any.
    async fn open_event_for_rule(&self, rule_id: &str) -> Result<Option<AlertEvent>>;

    /// The open event for a rule raised against one entity, if any.
    async fn open_event_for_entity(
        &self,
        rule_id: &str,
        node_id: &str,
    ) -> Result<Option<AlertEvent>>;

    /// Resolves the event if it is still firing. Returns false when the event
    /// was already resolved or does not exist.
    async fn resolve_event(&self, event_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Bumps the escalation level of a firing event, returning the new level.
    async fn escalate_event(&self, event_id: &str) -> Result<Option<u32>>;

    /// Records that a notification attempt was made for the event.
    async fn mark_notified(&self, event_id: &str) -> Result<bool>;

    async fn list_open_events(&self, limit: usize) -> Result<Vec<AlertEvent>>;
}

/// Rule records, owned by the external management surface.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_enabled_rules(&self) -> Result<Vec<RuleRecord>>;

    async fn upsert_rule(&self, rule: &RuleRecord) -> Result<()>;
}

/// Notification channel records, owned by the external management surface.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn list_enabled_channels(&self) -> Result<Vec<ChannelRecord>>;

    async fn upsert_channel(&self, channel: &ChannelRecord) -> Result<()>;
}

/// Raw observation history for the remediator.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    async fn record_observation(&self, observation: &Observation) -> Result<()>;

    /// The `limit` most recent observations for the pair, newest first.
    async fn recent_observations(
        &self,
        target_id: &str,
        source: &str,
        limit: usize,
    ) -> Result<Vec<Observation>>;

    /// Distinct `(target_id, source)` pairs observed in `tier` at or after `since`.
    async fn observed_pairs(
        &self,
        tier: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>>;

    async fn purge_observations_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Managed resources the remediator may pause and restore.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn get_target(&self, target_id: &str) -> Result<Option<RemediationTarget>>;

    /// Moves the target from `from` to `to` and appends `note` to its audit
    /// trail, only if its status is still `from`. Returns whether it moved.
    async fn transition_target(
        &self,
        target_id: &str,
        from: TargetStatus,
        to: TargetStatus,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn upsert_target(&self, target: &RemediationTarget) -> Result<()>;
}

/// Appends `note` to an audit trail, one note per line.
pub(crate) fn append_note(notes: &str, note: &str) -> String {
    if notes.is_empty() {
        note.to_string()
    } else {
        format!("{notes}\n{note}")
    }
}
