//! In-process implementation of every store trait.
//!
//! Used by engine tests and by dry runs without a data directory. Two knobs
//! simulate backend trouble: [`MemoryStore::set_source_unavailable`] makes
//! snapshot queries fail, and [`MemoryStore::fail_next_writes`] makes the
//! next N state/event writes fail.

use crate::error::{Result, StorageError};
use crate::{
    append_note, AlertEventStore, ChannelStore, ObservationStore, RuleStore, SnapshotSource,
    StateStore, TargetStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailmon_common::metrics::MetricName;
use mailmon_common::types::{
    AlertEvent, AlertStatus, ChannelRecord, MetricSnapshot, MetricSource, Observation,
    RemediationTarget, RuleRecord, TargetStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    snapshots: Vec<MetricSnapshot>,
    last_seen: HashMap<(MetricSource, String), DateTime<Utc>>,
    state: HashMap<String, (DateTime<Utc>, DateTime<Utc>)>,
    events: BTreeMap<String, AlertEvent>,
    rules: BTreeMap<String, RuleRecord>,
    channels: BTreeMap<String, ChannelRecord>,
    observations: Vec<Observation>,
    targets: HashMap<String, RemediationTarget>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    source_unavailable: AtomicBool,
    failing_writes: AtomicU32,
    snapshot_queries: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write_snapshots(&self, batch: &[MetricSnapshot]) -> usize {
        let mut inner = self.lock();
        for snapshot in batch {
            let key = (snapshot.source, snapshot.entity_id.clone());
            let seen = inner.last_seen.entry(key).or_insert(snapshot.timestamp);
            if snapshot.timestamp > *seen {
                *seen = snapshot.timestamp;
            }
            inner.snapshots.push(snapshot.clone());
        }
        batch.len()
    }

    /// Makes every snapshot query fail with [`StorageError::Unavailable`].
    pub fn set_source_unavailable(&self, unavailable: bool) {
        self.source_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next `n` state and alert event writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Number of snapshot queries served so far.
    pub fn snapshot_queries(&self) -> usize {
        self.snapshot_queries.load(Ordering::SeqCst)
    }

    /// Every alert event ever stored, oldest first.
    pub fn all_events(&self) -> Vec<AlertEvent> {
        let mut events: Vec<_> = self.lock().events.values().cloned().collect();
        events.sort_by_key(|e| e.fired_at);
        events
    }

    fn check_source(&self) -> Result<()> {
        self.snapshot_queries.fetch_add(1, Ordering::SeqCst);
        if self.source_unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("snapshot source offline".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        let took = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if took.is_ok() {
            return Err(StorageError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for MemoryStore {
    async fn latest_per_entity(
        &self,
        metric: &MetricName,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSnapshot>> {
        self.check_source()?;
        let inner = self.lock();
        let mut latest: BTreeMap<&str, &MetricSnapshot> = BTreeMap::new();
        for snapshot in inner.snapshots.iter().filter(|s| {
            s.source == metric.source() && s.metric == metric.as_str() && s.timestamp >= since
        }) {
            match latest.get(snapshot.entity_id.as_str()) {
                Some(existing) if existing.timestamp > snapshot.timestamp => {}
                _ => {
                    latest.insert(&snapshot.entity_id, snapshot);
                }
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn last_seen(&self, source: MetricSource) -> Result<Vec<(String, DateTime<Utc>)>> {
        self.check_source()?;
        let inner = self.lock();
        let mut seen: Vec<_> = inner
            .last_seen
            .iter()
            .filter(|((s, _), _)| *s == source)
            .map(|((_, entity), ts)| (entity.clone(), *ts))
            .collect();
        seen.sort();
        Ok(seen)
    }

    async fn event_count(&self, metric: &MetricName, since: DateTime<Utc>) -> Result<u64> {
        self.check_source()?;
        let inner = self.lock();
        let total: f64 = inner
            .snapshots
            .iter()
            .filter(|s| {
                s.source == metric.source() && s.metric == metric.as_str() && s.timestamp >= since
            })
            .map(|s| s.value)
            .sum();
        Ok(total.max(0.0) as u64)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let inner = self.lock();
        Ok(inner
            .state
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| *value))
    }

    async fn set(&self, key: &str, value: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<()> {
        self.check_write()?;
        self.lock().state.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_write()?;
        let mut inner = self.lock();
        match inner.state.get(key) {
            Some((_, existing_expiry)) if *existing_expiry > now => Ok(false),
            _ => {
                inner.state.insert(key.to_string(), (value, expires_at));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_write()?;
        self.lock().state.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.state.len();
        inner.state.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - inner.state.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl AlertEventStore for MemoryStore {
    async fn insert_event(&self, event: &AlertEvent) -> Result<()> {
        self.check_write()?;
        self.lock().events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<AlertEvent>> {
        Ok(self.lock().events.get(event_id).cloned())
    }

    async fn open_event_for_rule(&self, rule_id: &str) -> Result<Option<AlertEvent>> {
        Ok(self
            .lock()
            .events
            .values()
            .filter(|e| e.rule_id == rule_id && e.is_open())
            .max_by_key(|e| e.fired_at)
            .cloned())
    }

    async fn open_event_for_entity(
        &self,
        rule_id: &str,
        node_id: &str,
    ) -> Result<Option<AlertEvent>> {
        Ok(self
            .lock()
            .events
            .values()
            .filter(|e| e.rule_id == rule_id && e.node_id.as_deref() == Some(node_id))
            .filter(|e| e.is_open())
            .max_by_key(|e| e.fired_at)
            .cloned())
    }

    async fn resolve_event(&self, event_id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.check_write()?;
        let mut inner = self.lock();
        match inner.events.get_mut(event_id) {
            Some(event) if event.is_open() => {
                event.status = AlertStatus::Resolved;
                event.resolved_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn escalate_event(&self, event_id: &str) -> Result<Option<u32>> {
        self.check_write()?;
        let mut inner = self.lock();
        match inner.events.get_mut(event_id) {
            Some(event) if event.is_open() => {
                event.escalation_level += 1;
                Ok(Some(event.escalation_level))
            }
            _ => Ok(None),
        }
    }

    async fn mark_notified(&self, event_id: &str) -> Result<bool> {
        self.check_write()?;
        let mut inner = self.lock();
        match inner.events.get_mut(event_id) {
            Some(event) => {
                event.notified = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_open_events(&self, limit: usize) -> Result<Vec<AlertEvent>> {
        let mut open: Vec<_> = self
            .lock()
            .events
            .values()
            .filter(|e| e.is_open())
            .cloned()
            .collect();
        open.sort_by(|a, b| b.fired_at.cmp(&a.fired_at));
        open.truncate(limit);
        Ok(open)
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn list_enabled_rules(&self) -> Result<Vec<RuleRecord>> {
        Ok(self
            .lock()
            .rules
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }

    async fn upsert_rule(&self, rule: &RuleRecord) -> Result<()> {
        self.lock().rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn list_enabled_channels(&self) -> Result<Vec<ChannelRecord>> {
        Ok(self
            .lock()
            .channels
            .values()
            .filter(|c| c.enabled)
            .cloned()
            .collect())
    }

    async fn upsert_channel(&self, channel: &ChannelRecord) -> Result<()> {
        self.lock()
            .channels
            .insert(channel.id.clone(), channel.clone());
        Ok(())
    }
}

#[async_trait]
impl ObservationStore for MemoryStore {
    async fn record_observation(&self, observation: &Observation) -> Result<()> {
        self.lock().observations.push(observation.clone());
        Ok(())
    }

    async fn recent_observations(
        &self,
        target_id: &str,
        source: &str,
        limit: usize,
    ) -> Result<Vec<Observation>> {
        let inner = self.lock();
        // Stable sort keeps insertion order for equal timestamps; reversing
        // puts the newest write first.
        let mut matching: Vec<_> = inner
            .observations
            .iter()
            .filter(|o| o.target_id == target_id && o.source == source)
            .cloned()
            .collect();
        matching.sort_by_key(|o| o.timestamp);
        matching.reverse();
        matching.truncate(limit);
        Ok(matching)
    }

    async fn observed_pairs(
        &self,
        tier: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>> {
        let inner = self.lock();
        let mut pairs: Vec<_> = inner
            .observations
            .iter()
            .filter(|o| o.tier == tier && o.timestamp >= since)
            .map(|o| (o.target_id.clone(), o.source.clone()))
            .collect();
        pairs.sort();
        pairs.dedup();
        Ok(pairs)
    }

    async fn purge_observations_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.observations.len();
        inner.observations.retain(|o| o.timestamp >= cutoff);
        Ok((before - inner.observations.len()) as u64)
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn get_target(&self, target_id: &str) -> Result<Option<RemediationTarget>> {
        Ok(self.lock().targets.get(target_id).cloned())
    }

    async fn transition_target(
        &self,
        target_id: &str,
        from: TargetStatus,
        to: TargetStatus,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        match inner.targets.get_mut(target_id) {
            Some(target) if target.status == from => {
                target.status = to;
                target.notes = append_note(&target.notes, note);
                target.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_target(&self, target: &RemediationTarget) -> Result<()> {
        self.lock()
            .targets
            .insert(target.id.clone(), target.clone());
        Ok(())
    }
}
