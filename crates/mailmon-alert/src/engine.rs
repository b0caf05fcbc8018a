use crate::error::{AlertError, Result};
use crate::evaluator::{Evaluation, Evaluator};
use crate::publish::{EventPublisher, LiveEvent, TOPIC_ALERT_FIRED, TOPIC_ALERT_RESOLVED};
use crate::rule::{CompiledCondition, Rule};
use crate::state::{RuleStateTracker, StateChange};
use crate::AlertNotifier;
use chrono::{DateTime, Utc};
use mailmon_common::metrics::MetricWhitelist;
use mailmon_common::types::{AlertEvent, RuleRecord, Severity};
use mailmon_storage::RuleStore;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// What one rule did during a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Fired(AlertEvent),
    Escalated(AlertEvent),
    Resolved(AlertEvent),
    Pending,
    CooldownSuppressed,
    Idle,
    /// The snapshot source failed or timed out; no transition was applied.
    NotEvaluable(String),
    /// The condition cannot be evaluated as written.
    Misconfigured(String),
    /// State writes kept failing; the next pass recomputes.
    PersistenceFailed(String),
}

/// Dashboard status of a rule after its latest pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Healthy,
    Pending,
    Firing,
    Cooldown,
    NotEvaluable,
    Misconfigured,
}

#[derive(Debug, Clone)]
pub struct RuleReport {
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub outcome: RuleOutcome,
    /// The rule has an open event after the pass.
    pub firing: bool,
}

impl RuleReport {
    /// Maps the outcome to a dashboard status. "Could not evaluate" and
    /// "healthy" are never folded together.
    pub fn status(&self) -> RuleStatus {
        match &self.outcome {
            RuleOutcome::NotEvaluable(_) | RuleOutcome::PersistenceFailed(_) => {
                RuleStatus::NotEvaluable
            }
            RuleOutcome::Misconfigured(_) => RuleStatus::Misconfigured,
            _ if self.firing => RuleStatus::Firing,
            RuleOutcome::Pending => RuleStatus::Pending,
            RuleOutcome::CooldownSuppressed => RuleStatus::Cooldown,
            _ => RuleStatus::Healthy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub rules: Vec<RuleReport>,
}

impl PassReport {
    pub fn count(&self, f: impl Fn(&RuleOutcome) -> bool) -> usize {
        self.rules.iter().filter(|r| f(&r.outcome)).count()
    }
}

/// Runs fixed-cadence rule passes.
#[derive(Clone)]
pub struct RuleEngine {
    rules: Arc<dyn RuleStore>,
    whitelist: Arc<MetricWhitelist>,
    evaluator: Evaluator,
    tracker: RuleStateTracker,
    notifier: Arc<dyn AlertNotifier>,
    publisher: Arc<dyn EventPublisher>,
    max_concurrent: usize,
    /// (rule id, raw condition) pairs already reported as invalid.
    warned: Arc<Mutex<HashSet<(String, String)>>>,
}

impl RuleEngine {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        whitelist: Arc<MetricWhitelist>,
        evaluator: Evaluator,
        tracker: RuleStateTracker,
        notifier: Arc<dyn AlertNotifier>,
        publisher: Arc<dyn EventPublisher>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            rules,
            whitelist,
            evaluator,
            tracker,
            notifier,
            publisher,
            max_concurrent: max_concurrent.max(1),
            warned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Evaluates every enabled rule once.
    ///
    /// Rules are re-read from the rule store on each pass and evaluated
    /// concurrently on a bounded pool. Fails only if the rule list itself
    /// cannot be read.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let records = self
            .rules
            .list_enabled_rules()
            .await
            .map_err(|e| AlertError::TransientSource(format!("cannot load rules: {e}")))?;

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(records.len());

        for record in records {
            let rule = self.compile(record);
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AlertError::Configuration(format!("worker pool closed: {e}")))?;
            let engine = self.clone();
            let rule_id = rule.id.clone();
            let rule_name = rule.name.clone();
            let severity = rule.severity;

            let handle = tokio::spawn(async move {
                let report = engine.run_rule(&rule, now).await;
                drop(permit);
                report
            });
            handles.push((rule_id, rule_name, severity, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (rule_id, rule_name, severity, handle) in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!(rule_id = %rule_id, error = %e, "Rule evaluation task panicked");
                    reports.push(RuleReport {
                        rule_id,
                        rule_name,
                        severity,
                        outcome: RuleOutcome::NotEvaluable(format!("evaluation task failed: {e}")),
                        firing: false,
                    });
                }
            }
        }

        let report = PassReport {
            started_at: now,
            rules: reports,
        };
        tracing::info!(
            rules = report.rules.len(),
            fired = report.count(|o| matches!(o, RuleOutcome::Fired(_) | RuleOutcome::Escalated(_))),
            resolved = report.count(|o| matches!(o, RuleOutcome::Resolved(_))),
            not_evaluable = report.count(|o| matches!(o, RuleOutcome::NotEvaluable(_))),
            misconfigured = report.count(|o| matches!(o, RuleOutcome::Misconfigured(_))),
            "Rule pass complete"
        );
        Ok(report)
    }

    fn compile(&self, record: RuleRecord) -> Rule {
        let rule = Rule::compile(record, &self.whitelist);
        if let CompiledCondition::Invalid { raw, error } = &rule.condition {
            let mut warned = self
                .warned
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if warned.insert((rule.id.clone(), raw.clone())) {
                tracing::warn!(
                    rule_id = %rule.id,
                    condition = %raw,
                    error = %error,
                    "Invalid rule condition; rule will not trigger"
                );
            }
        }
        rule
    }

    async fn run_rule(&self, rule: &Rule, now: DateTime<Utc>) -> RuleReport {
        let (outcome, firing) = self.evaluate_and_apply(rule, now).await;
        RuleReport {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            outcome,
            firing,
        }
    }

    async fn evaluate_and_apply(&self, rule: &Rule, now: DateTime<Utc>) -> (RuleOutcome, bool) {
        let evaluation = match self.evaluator.evaluate(rule, now).await {
            Ok(evaluation) => evaluation,
            Err(e) => {
                tracing::warn!(rule_id = %rule.id, error = %e, "Rule not evaluable this cycle");
                let firing = self
                    .tracker
                    .load(&rule.id, now)
                    .await
                    .map(|(state, _)| state.has_open_event)
                    .unwrap_or(false);
                return (RuleOutcome::NotEvaluable(e.to_string()), firing);
            }
        };

        let update = match self.tracker.apply(rule, &evaluation, now).await {
            Ok(update) => update,
            Err(e) => {
                tracing::error!(rule_id = %rule.id, error = %e, "Rule state update failed");
                return (RuleOutcome::PersistenceFailed(e.to_string()), false);
            }
        };

        let outcome = match update.change {
            StateChange::Fired(event) => {
                tracing::info!(
                    rule_id = %rule.id,
                    event_id = %event.id,
                    severity = %event.severity,
                    node_id = ?event.node_id,
                    "Alert fired"
                );
                self.notifier.notify(&event, &rule.channels).await;
                self.publisher.publish(
                    TOPIC_ALERT_FIRED,
                    LiveEvent::AlertFired {
                        event: event.clone(),
                    },
                );
                RuleOutcome::Fired(event)
            }
            StateChange::Escalated(event) => {
                tracing::info!(
                    rule_id = %rule.id,
                    event_id = %event.id,
                    level = event.escalation_level,
                    "Alert escalated"
                );
                self.notifier.notify(&event, &rule.channels).await;
                self.publisher.publish(
                    TOPIC_ALERT_FIRED,
                    LiveEvent::AlertFired {
                        event: event.clone(),
                    },
                );
                RuleOutcome::Escalated(event)
            }
            StateChange::Resolved(event) => {
                tracing::info!(rule_id = %rule.id, event_id = %event.id, "Alert resolved");
                self.notifier.notify(&event, &rule.channels).await;
                self.publisher.publish(
                    TOPIC_ALERT_RESOLVED,
                    LiveEvent::AlertResolved {
                        event: event.clone(),
                    },
                );
                RuleOutcome::Resolved(event)
            }
            StateChange::Pending => RuleOutcome::Pending,
            StateChange::CooldownSuppressed => RuleOutcome::CooldownSuppressed,
            StateChange::Idle => RuleOutcome::Idle,
        };

        // A misconfigured rule was applied as not triggered; report why.
        let outcome = match (evaluation, outcome) {
            (Evaluation::Misconfigured { reason }, RuleOutcome::Idle) => {
                RuleOutcome::Misconfigured(reason)
            }
            (_, outcome) => outcome,
        };
        (outcome, update.firing)
    }
}
