//! Consecutive-observation (K-of-K) auto-remediation.
//!
//! The adverse streak is never stored. Each reconcile reads the last K raw
//! observations for a (target, source) pair and acts only when all K agree.
//! An automatic pause stamps the target's notes with
//! `[auto-pause:{remediator}:{source}]`; a restore only happens when the
//! latest note carries exactly that tag, so manual pauses and pauses caused
//! by another source are left alone.
//!
//! The status change and the alert event are separate writes. Reconcile
//! compares both against the observations every time, so an event write
//! that failed after a status change is completed by a later pass.

use crate::error::{AlertError, Result};
use crate::publish::{EventPublisher, LiveEvent, TOPIC_ALERT_RESOLVED, TOPIC_REMEDIATION_APPLIED};
use crate::retry::{retry_persistence, RetryPolicy};
use crate::AlertNotifier;
use chrono::{DateTime, Duration, Utc};
use mailmon_common::types::{AlertEvent, AlertStatus, Observation, Severity, TargetStatus};
use mailmon_storage::{AlertEventStore, ObservationStore, TargetStore};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// How far back a tier pass looks for pairs to reconcile.
const PAIR_LOOKBACK_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq)]
pub enum RemediationAction {
    Paused(AlertEvent),
    /// Restored to active; carries the resolved event if one was open.
    Restored(Option<AlertEvent>),
    AlreadyPaused,
    /// Paused, but not by this remediator for this source.
    NotOurPause,
    /// Observation from a tier that never acts automatically.
    Advisory,
    InsufficientHistory,
    /// The last K observations disagree.
    Mixed,
    NoChange,
    UnknownTarget,
}

#[derive(Debug, Clone)]
pub struct RemediatorConfig {
    /// Name stamped into audit tags.
    pub name: String,
    /// K: consecutive matching observations required to act.
    pub consecutive: usize,
    /// The only tier allowed to act automatically.
    pub automated_tier: String,
    pub channels: Vec<String>,
    pub max_concurrent: usize,
}

impl Default for RemediatorConfig {
    fn default() -> Self {
        Self {
            name: "auto-remediator".to_string(),
            consecutive: 2,
            automated_tier: "critical".to_string(),
            channels: Vec::new(),
            max_concurrent: 8,
        }
    }
}

pub fn pause_tag(remediator: &str, source: &str) -> String {
    format!("[auto-pause:{remediator}:{source}]")
}

pub fn restore_tag(remediator: &str, source: &str) -> String {
    format!("[auto-restore:{remediator}:{source}]")
}

/// Rule id under which remediation alerts for `source` are recorded.
pub fn remediation_rule_id(source: &str) -> String {
    format!("remediation:{source}")
}

#[derive(Clone)]
pub struct Remediator {
    observations: Arc<dyn ObservationStore>,
    targets: Arc<dyn TargetStore>,
    events: Arc<dyn AlertEventStore>,
    notifier: Arc<dyn AlertNotifier>,
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
    config: Arc<RemediatorConfig>,
}

impl Remediator {
    pub fn new(
        observations: Arc<dyn ObservationStore>,
        targets: Arc<dyn TargetStore>,
        events: Arc<dyn AlertEventStore>,
        notifier: Arc<dyn AlertNotifier>,
        publisher: Arc<dyn EventPublisher>,
        retry: RetryPolicy,
        config: RemediatorConfig,
    ) -> Self {
        Self {
            observations,
            targets,
            events,
            notifier,
            publisher,
            retry,
            config: Arc::new(config),
        }
    }

    /// Records an observation, then reconciles its (target, source) pair.
    pub async fn on_observation(&self, observation: Observation) -> Result<RemediationAction> {
        retry_persistence(self.retry, "record observation", || {
            self.observations.record_observation(&observation)
        })
        .await?;
        self.reconcile(
            &observation.target_id,
            &observation.source,
            &observation.tier,
            observation.timestamp,
        )
        .await
    }

    /// Applies the K-of-K policy to one (target, source) pair.
    pub async fn reconcile(
        &self,
        target_id: &str,
        source: &str,
        tier: &str,
        now: DateTime<Utc>,
    ) -> Result<RemediationAction> {
        if tier != self.config.automated_tier {
            tracing::debug!(target_id, source, tier, "Advisory-only tier, no action");
            return Ok(RemediationAction::Advisory);
        }

        let k = self.config.consecutive.max(1);
        let recent = self
            .observations
            .recent_observations(target_id, source, k)
            .await
            .map_err(|e| AlertError::TransientSource(e.to_string()))?;
        if recent.len() < k {
            return Ok(RemediationAction::InsufficientHistory);
        }

        let all_adverse = recent.iter().all(|o| o.adverse);
        let all_clear = recent.iter().all(|o| !o.adverse);
        if !all_adverse && !all_clear {
            tracing::debug!(target_id, source, "Mixed observations, no action");
            return Ok(RemediationAction::Mixed);
        }

        let Some(target) = self.targets.get_target(target_id).await? else {
            tracing::warn!(target_id, source, "Observation for unknown remediation target");
            return Ok(RemediationAction::UnknownTarget);
        };

        let ours = target
            .latest_note()
            .is_some_and(|note| note.contains(&pause_tag(&self.config.name, source)));

        if all_adverse {
            match target.status {
                TargetStatus::Active => self.pause(target_id, source, now).await,
                TargetStatus::Paused if ours => {
                    self.ensure_pause_event(target_id, source, now).await
                }
                TargetStatus::Paused => Ok(RemediationAction::AlreadyPaused),
                TargetStatus::Disabled => Ok(RemediationAction::NoChange),
            }
        } else {
            match target.status {
                TargetStatus::Paused if ours => self.restore(target_id, source, now).await,
                TargetStatus::Paused => {
                    tracing::info!(
                        target_id,
                        source,
                        "Target paused by someone else; leaving it paused"
                    );
                    Ok(RemediationAction::NotOurPause)
                }
                TargetStatus::Active => {
                    match self.resolve_open_event(target_id, source, now).await? {
                        Some(event) => {
                            tracing::info!(
                                target_id,
                                source,
                                event_id = %event.id,
                                "Closed remediation event left open by an earlier restore"
                            );
                            Ok(RemediationAction::Restored(Some(event)))
                        }
                        None => Ok(RemediationAction::NoChange),
                    }
                }
                TargetStatus::Disabled => Ok(RemediationAction::NoChange),
            }
        }
    }

    /// Reconciles every pair observed in `tier` recently, on a bounded pool.
    pub async fn run_tier_pass(
        &self,
        tier: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, String, RemediationAction)>> {
        let since = now - Duration::hours(PAIR_LOOKBACK_HOURS);
        let pairs = self
            .observations
            .observed_pairs(tier, since)
            .await
            .map_err(|e| AlertError::TransientSource(e.to_string()))?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut handles = Vec::with_capacity(pairs.len());
        for (target_id, source) in pairs {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AlertError::Configuration(format!("worker pool closed: {e}")))?;
            let remediator = self.clone();
            let tier_name = tier.to_string();
            handles.push(tokio::spawn(async move {
                let action = remediator
                    .reconcile(&target_id, &source, &tier_name, now)
                    .await;
                drop(permit);
                (target_id, source, action)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((target_id, source, Ok(action))) => results.push((target_id, source, action)),
                Ok((target_id, source, Err(e))) => {
                    tracing::warn!(target_id = %target_id, source = %source, error = %e, "Reconcile failed");
                }
                Err(e) => tracing::error!(error = %e, "Reconcile task panicked"),
            }
        }
        Ok(results)
    }

    async fn pause(&self, target_id: &str, source: &str, now: DateTime<Utc>) -> Result<RemediationAction> {
        let k = self.config.consecutive.max(1);
        let note = format!(
            "{} paused after {k} consecutive adverse results at {}",
            pause_tag(&self.config.name, source),
            now.to_rfc3339()
        );
        let moved = retry_persistence(self.retry, "pause target", || {
            self.targets
                .transition_target(target_id, TargetStatus::Active, TargetStatus::Paused, &note, now)
        })
        .await?;
        if !moved {
            // Another pass paused it first.
            return Ok(RemediationAction::AlreadyPaused);
        }

        let event = self.raise_pause_event(target_id, source, now).await?;
        tracing::warn!(target_id, source, event_id = %event.id, "Target auto-paused");
        Ok(RemediationAction::Paused(event))
    }

    /// A pause of ours with no open event means the event write failed after
    /// the status change; raise it now.
    async fn ensure_pause_event(
        &self,
        target_id: &str,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<RemediationAction> {
        let rule_id = remediation_rule_id(source);
        let open = retry_persistence(self.retry, "read remediation event", || {
            self.events.open_event_for_entity(&rule_id, target_id)
        })
        .await?;
        if open.is_some() {
            return Ok(RemediationAction::AlreadyPaused);
        }
        let event = self.raise_pause_event(target_id, source, now).await?;
        tracing::warn!(target_id, source, event_id = %event.id, "Raised missing auto-pause event");
        Ok(RemediationAction::Paused(event))
    }

    async fn raise_pause_event(
        &self,
        target_id: &str,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<AlertEvent> {
        let k = self.config.consecutive.max(1);
        let event = AlertEvent::firing(
            remediation_rule_id(source),
            format!("Auto-pause: {source}"),
            Severity::Critical,
            format!("{target_id} paused: {k} consecutive adverse results from {source}"),
            serde_json::json!({
                "target_id": target_id,
                "source": source,
                "consecutive": k,
                "remediator": self.config.name,
            }),
            Some(target_id.to_string()),
            now,
        );
        retry_persistence(self.retry, "insert remediation event", || {
            self.events.insert_event(&event)
        })
        .await?;

        self.notifier.notify(&event, &self.config.channels).await;
        self.publisher.publish(
            TOPIC_REMEDIATION_APPLIED,
            LiveEvent::RemediationApplied {
                target_id: target_id.to_string(),
                source: source.to_string(),
                status: TargetStatus::Paused,
                event: Some(event.clone()),
            },
        );
        Ok(event)
    }

    async fn restore(&self, target_id: &str, source: &str, now: DateTime<Utc>) -> Result<RemediationAction> {
        let note = format!(
            "{} restored after {} consecutive clear results at {}",
            restore_tag(&self.config.name, source),
            self.config.consecutive.max(1),
            now.to_rfc3339()
        );
        let moved = retry_persistence(self.retry, "restore target", || {
            self.targets
                .transition_target(target_id, TargetStatus::Paused, TargetStatus::Active, &note, now)
        })
        .await?;
        if !moved {
            return Ok(RemediationAction::NoChange);
        }

        let resolved = self.resolve_open_event(target_id, source, now).await?;

        tracing::info!(target_id, source, "Target auto-restored");
        self.publisher.publish(
            TOPIC_REMEDIATION_APPLIED,
            LiveEvent::RemediationApplied {
                target_id: target_id.to_string(),
                source: source.to_string(),
                status: TargetStatus::Active,
                event: resolved.clone(),
            },
        );
        Ok(RemediationAction::Restored(resolved))
    }

    /// Resolves the open remediation event for (target, source), if any.
    async fn resolve_open_event(
        &self,
        target_id: &str,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertEvent>> {
        let rule_id = remediation_rule_id(source);
        let open = retry_persistence(self.retry, "read remediation event", || {
            self.events.open_event_for_entity(&rule_id, target_id)
        })
        .await?;
        let Some(mut event) = open else {
            return Ok(None);
        };
        let closed = retry_persistence(self.retry, "resolve remediation event", || {
            self.events.resolve_event(&event.id, now)
        })
        .await?;
        if !closed {
            return Ok(None);
        }
        event.status = AlertStatus::Resolved;
        event.resolved_at = Some(now);
        self.notifier.notify(&event, &self.config.channels).await;
        self.publisher.publish(
            TOPIC_ALERT_RESOLVED,
            LiveEvent::AlertResolved {
                event: event.clone(),
            },
        );
        Ok(Some(event))
    }
}
