use crate::condition::{
    CompareOp, Condition, SpecialCheck, Window, DEFERRAL_MIN_MESSAGES, DEFERRAL_RATIO_LIMIT,
    REPLICATION_LAG_LIMIT_SECS,
};
use crate::error::{AlertError, Result};
use crate::rule::{CompiledCondition, Rule};
use chrono::{DateTime, Duration, Utc};
use mailmon_common::metrics::MetricName;
use mailmon_common::types::{MetricSnapshot, MetricSource};
use mailmon_storage::SnapshotSource;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

/// Result of evaluating one rule against current snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// At least one entity satisfies the condition.
    Triggered {
        /// First offending entity; `None` for source-wide counts.
        entity_id: Option<String>,
        value: f64,
        message: String,
        details: serde_json::Value,
    },
    Clear,
    /// The rule cannot be evaluated as written. Treated as not triggered.
    Misconfigured { reason: String },
}

impl Evaluation {
    pub fn is_triggered(&self) -> bool {
        matches!(self, Evaluation::Triggered { .. })
    }
}

/// Read-only executor of rule conditions against a [`SnapshotSource`].
#[derive(Clone)]
pub struct Evaluator {
    source: Arc<dyn SnapshotSource>,
    lookback: Duration,
    timeout: std::time::Duration,
}

impl Evaluator {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        lookback: Duration,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            source,
            lookback,
            timeout,
        }
    }

    /// Evaluates `rule` at `now`.
    ///
    /// Source failures and timeouts are returned as
    /// [`AlertError::TransientSource`], never folded into [`Evaluation::Clear`].
    pub async fn evaluate(&self, rule: &Rule, now: DateTime<Utc>) -> Result<Evaluation> {
        let condition = match &rule.condition {
            CompiledCondition::Valid(condition) => condition,
            CompiledCondition::Invalid { raw, error } => {
                return Ok(Evaluation::Misconfigured {
                    reason: format!("invalid condition '{raw}': {error}"),
                });
            }
        };

        match condition {
            Condition::Threshold { metric, op, value } => {
                self.threshold(rule, metric, *op, *value, now).await
            }
            Condition::Absence { source, window } => {
                self.absence(rule, *source, *window, now).await
            }
            Condition::Count {
                metric,
                window,
                threshold,
            } => self.count(metric, *window, *threshold, now).await,
            Condition::Special(check) => self.special(rule, check, now).await,
        }
    }

    async fn threshold(
        &self,
        rule: &Rule,
        metric: &MetricName,
        op: CompareOp,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let snapshots = self.latest(rule, metric, now).await?;
        let offenders: Vec<&MetricSnapshot> = snapshots
            .iter()
            .filter(|s| op.check(s.value, threshold))
            .collect();
        let Some(first) = offenders.first() else {
            return Ok(Evaluation::Clear);
        };

        let mut message = format!(
            "{} {} {op} {threshold} on {}",
            metric.as_str(),
            first.value,
            first.entity_id
        );
        if offenders.len() > 1 {
            message.push_str(&format!(" (+{} more)", offenders.len() - 1));
        }
        Ok(Evaluation::Triggered {
            entity_id: Some(first.entity_id.clone()),
            value: first.value,
            message,
            details: serde_json::json!({
                "metric": metric.to_string(),
                "operator": op.to_string(),
                "threshold": threshold,
                "entities": offenders
                    .iter()
                    .map(|s| serde_json::json!({ "entity_id": s.entity_id, "value": s.value }))
                    .collect::<Vec<_>>(),
            }),
        })
    }

    async fn absence(
        &self,
        rule: &Rule,
        source: MetricSource,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let seen = self.call(self.source.last_seen(source)).await?;
        let cutoff = now - window.duration();
        let silent: Vec<(String, DateTime<Utc>)> = seen
            .into_iter()
            .filter(|(entity, _)| rule.matches_entity(entity))
            .filter(|(_, last)| *last < cutoff)
            .collect();
        let Some((entity, last)) = silent.first() else {
            return Ok(Evaluation::Clear);
        };

        let silent_secs = (now - *last).num_seconds();
        let mut message = format!("{source} {entity} has not reported for {silent_secs}s (window {window})");
        if silent.len() > 1 {
            message.push_str(&format!(" (+{} more)", silent.len() - 1));
        }
        Ok(Evaluation::Triggered {
            entity_id: Some(entity.clone()),
            value: silent_secs as f64,
            message,
            details: serde_json::json!({
                "source": source.as_str(),
                "window_secs": window.as_secs(),
                "entities": silent
                    .iter()
                    .map(|(id, ts)| serde_json::json!({ "entity_id": id, "last_seen": ts }))
                    .collect::<Vec<_>>(),
            }),
        })
    }

    async fn count(
        &self,
        metric: &MetricName,
        window: Window,
        threshold: u64,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let since = now - window.duration();
        let count = self.call(self.source.event_count(metric, since)).await?;
        if count <= threshold {
            return Ok(Evaluation::Clear);
        }
        Ok(Evaluation::Triggered {
            entity_id: None,
            value: count as f64,
            message: format!(
                "{count} {} events in the last {window} (limit {threshold})",
                metric.as_str()
            ),
            details: serde_json::json!({
                "metric": metric.to_string(),
                "window_secs": window.as_secs(),
                "count": count,
                "threshold": threshold,
            }),
        })
    }

    async fn special(
        &self,
        rule: &Rule,
        check: &SpecialCheck,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let (a, b) = match check {
            SpecialCheck::QueueStalled {
                queue_size,
                delivery_rate,
            } => (queue_size, delivery_rate),
            SpecialCheck::DeferralRatioHigh {
                deferred,
                delivered,
            } => (deferred, delivered),
            SpecialCheck::ReplicationBroken { running, lag } => (running, lag),
        };
        let first = by_entity(self.latest(rule, a, now).await?);
        let second = by_entity(self.latest(rule, b, now).await?);
        let entities: BTreeSet<&String> = first.keys().chain(second.keys()).collect();

        for entity in entities {
            let x = first.get(entity).copied();
            let y = second.get(entity).copied();
            if let Some((value, message)) = special_trips(check, x, y) {
                let mut details = serde_json::Map::new();
                details.insert("check".into(), check.name().into());
                details.insert("entity_id".into(), entity.clone().into());
                details.insert(a.as_str().to_string(), x.into());
                details.insert(b.as_str().to_string(), y.into());
                return Ok(Evaluation::Triggered {
                    entity_id: Some(entity.clone()),
                    value,
                    message: format!("{} on {entity}: {message}", check.name()),
                    details: serde_json::Value::Object(details),
                });
            }
        }
        Ok(Evaluation::Clear)
    }

    async fn latest(
        &self,
        rule: &Rule,
        metric: &MetricName,
        now: DateTime<Utc>,
    ) -> Result<Vec<MetricSnapshot>> {
        let since = now - self.lookback;
        let snapshots = self
            .call(self.source.latest_per_entity(metric, since))
            .await?;
        Ok(snapshots
            .into_iter()
            .filter(|s| rule.matches_entity(&s.entity_id))
            .collect())
    }

    async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = mailmon_storage::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(AlertError::TransientSource(e.to_string())),
            Err(_) => Err(AlertError::TransientSource(format!(
                "snapshot query timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

fn by_entity(snapshots: Vec<MetricSnapshot>) -> BTreeMap<String, f64> {
    snapshots
        .into_iter()
        .map(|s| (s.entity_id, s.value))
        .collect()
}

/// Returns the reported value and a description if an entity's pair of
/// latest values trips `check`. Queue and deferral checks need both series;
/// replication trips on either one alone.
fn special_trips(check: &SpecialCheck, x: Option<f64>, y: Option<f64>) -> Option<(f64, String)> {
    match check {
        SpecialCheck::QueueStalled { .. } => {
            let (queued, rate) = (x?, y?);
            (queued > 0.0 && rate == 0.0)
                .then(|| (queued, format!("{queued} queued, nothing delivered")))
        }
        SpecialCheck::DeferralRatioHigh { .. } => {
            let (deferred, delivered) = (x?, y?);
            let total = deferred + delivered;
            if total < DEFERRAL_MIN_MESSAGES {
                return None;
            }
            let ratio = deferred / total;
            (ratio > DEFERRAL_RATIO_LIMIT)
                .then(|| (ratio, format!("{:.0}% of {total} messages deferred", ratio * 100.0)))
        }
        SpecialCheck::ReplicationBroken { .. } => match (x, y) {
            (Some(running), lag) if running == 0.0 => {
                Some((lag.unwrap_or(0.0), "replication stopped".to_string()))
            }
            (_, Some(lag)) if lag > REPLICATION_LAG_LIMIT_SECS => {
                Some((lag, format!("replication lag {lag}s")))
            }
            _ => None,
        },
    }
}
