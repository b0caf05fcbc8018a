//! Per-rule debounce and cooldown tracking.
//!
//! [`decide`] is the pure transition function; [`RuleStateTracker`] loads
//! the durable state, applies the decided transition and writes back.
//! Rule state lives in two independent keys of a [`StateStore`]:
//!
//! - `rule:{id}:first_true_at`, kept for the rule's duration plus the
//!   pending TTL, so a crashed or paused process cannot leave a rule
//!   permanently about to fire;
//! - `rule:{id}:last_fired_at`, kept for the cooldown plus the pending TTL.

use crate::error::Result;
use crate::evaluator::Evaluation;
use crate::retry::{retry_persistence, RetryPolicy};
use crate::rule::Rule;
use chrono::{DateTime, Duration, Utc};
use mailmon_common::types::{AlertEvent, AlertStatus};
use mailmon_storage::{AlertEventStore, StateStore};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleRuntimeState {
    /// Set while the condition has been continuously true since this instant.
    pub first_true_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Whether the event store holds a firing event for the rule.
    pub has_open_event: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Idle -> Pending: record the first true instant.
    StartPending,
    StillPending { elapsed: Duration },
    Fire,
    /// Duration reached but the previous fire is too recent.
    CooldownSuppressed { remaining: Duration },
    /// Condition false: clear pending state and close any open event.
    Resolve,
    Idle,
}

/// Decides the next transition for a rule.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, Utc};
/// use mailmon_alert::state::{decide, RuleRuntimeState, Transition};
///
/// let now = Utc::now();
/// let pending = RuleRuntimeState {
///     first_true_at: Some(now - Duration::minutes(5)),
///     ..Default::default()
/// };
/// let t = decide(&pending, true, now, Duration::minutes(5), Duration::minutes(30));
/// assert_eq!(t, Transition::Fire);
/// ```
pub fn decide(
    state: &RuleRuntimeState,
    triggered: bool,
    now: DateTime<Utc>,
    duration: Duration,
    cooldown: Duration,
) -> Transition {
    if !triggered {
        return if state.first_true_at.is_some() || state.has_open_event {
            Transition::Resolve
        } else {
            Transition::Idle
        };
    }

    let elapsed = now - state.first_true_at.unwrap_or(now);
    if elapsed < duration {
        return match state.first_true_at {
            None => Transition::StartPending,
            Some(_) => Transition::StillPending { elapsed },
        };
    }

    match state.last_fired_at {
        Some(last) if now - last < cooldown => Transition::CooldownSuppressed {
            remaining: cooldown - (now - last),
        },
        _ => Transition::Fire,
    }
}

/// What applying a transition changed.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Fired(AlertEvent),
    /// Re-fire while the previous event was still open.
    Escalated(AlertEvent),
    Resolved(AlertEvent),
    Pending,
    CooldownSuppressed,
    Idle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub change: StateChange,
    /// The rule has an open event after this update.
    pub firing: bool,
}

#[derive(Clone)]
pub struct RuleStateTracker {
    state: Arc<dyn StateStore>,
    events: Arc<dyn AlertEventStore>,
    pending_ttl: Duration,
    retry: RetryPolicy,
}

fn first_true_key(rule_id: &str) -> String {
    format!("rule:{rule_id}:first_true_at")
}

fn last_fired_key(rule_id: &str) -> String {
    format!("rule:{rule_id}:last_fired_at")
}

impl RuleStateTracker {
    pub fn new(
        state: Arc<dyn StateStore>,
        events: Arc<dyn AlertEventStore>,
        pending_ttl: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            state,
            events,
            pending_ttl,
            retry,
        }
    }

    /// Loads the durable state of `rule_id` and its open event, if any.
    pub async fn load(
        &self,
        rule_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(RuleRuntimeState, Option<AlertEvent>)> {
        let first_key = first_true_key(rule_id);
        let fired_key = last_fired_key(rule_id);
        let first_true_at =
            retry_persistence(self.retry, "read first_true_at", || self.state.get(&first_key, now))
                .await?;
        let last_fired_at =
            retry_persistence(self.retry, "read last_fired_at", || self.state.get(&fired_key, now))
                .await?;
        let open = retry_persistence(self.retry, "read open event", || {
            self.events.open_event_for_rule(rule_id)
        })
        .await?;
        Ok((
            RuleRuntimeState {
                first_true_at,
                last_fired_at,
                has_open_event: open.is_some(),
            },
            open,
        ))
    }

    /// Applies one evaluation result for `rule`.
    ///
    /// [`Evaluation::Misconfigured`] is applied as not triggered.
    pub async fn apply(
        &self,
        rule: &Rule,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> Result<StateUpdate> {
        let (state, open) = self.load(&rule.id, now).await?;
        let transition = decide(
            &state,
            evaluation.is_triggered(),
            now,
            rule.duration(),
            rule.cooldown(),
        );

        let change = match transition {
            Transition::StartPending => {
                let key = first_true_key(&rule.id);
                let expires = now + rule.duration() + self.pending_ttl;
                let set = retry_persistence(self.retry, "set first_true_at", || {
                    self.state.set_if_absent(&key, now, expires, now)
                })
                .await?;
                tracing::debug!(rule_id = %rule.id, started = set, "Rule pending");
                StateChange::Pending
            }
            Transition::StillPending { elapsed } => {
                tracing::debug!(
                    rule_id = %rule.id,
                    elapsed_secs = elapsed.num_seconds(),
                    duration_secs = rule.duration_secs,
                    "Rule still pending"
                );
                StateChange::Pending
            }
            Transition::CooldownSuppressed { remaining } => {
                tracing::debug!(
                    rule_id = %rule.id,
                    remaining_secs = remaining.num_seconds(),
                    "Alert suppressed (cooldown)"
                );
                StateChange::CooldownSuppressed
            }
            Transition::Fire => self.fire(rule, evaluation, open, now).await?,
            Transition::Resolve => self.resolve(rule, &state, open, now).await?,
            Transition::Idle => StateChange::Idle,
        };

        let firing = match &change {
            StateChange::Fired(_) | StateChange::Escalated(_) => true,
            StateChange::Resolved(_) => false,
            _ => state.has_open_event && transition != Transition::Resolve,
        };
        Ok(StateUpdate { change, firing })
    }

    async fn fire(
        &self,
        rule: &Rule,
        evaluation: &Evaluation,
        open: Option<AlertEvent>,
        now: DateTime<Utc>,
    ) -> Result<StateChange> {
        let (entity_id, message, details) = match evaluation {
            Evaluation::Triggered {
                entity_id,
                message,
                details,
                ..
            } => (entity_id.clone(), message.clone(), details.clone()),
            _ => (None, String::new(), serde_json::Value::Null),
        };

        let mut escalated = None;
        if let Some(mut event) = open {
            let level = retry_persistence(self.retry, "escalate event", || {
                self.events.escalate_event(&event.id)
            })
            .await?;
            if let Some(level) = level {
                event.escalation_level = level;
                event.message = message.clone();
                escalated = Some(event);
            }
        }

        let change = match escalated {
            Some(event) => StateChange::Escalated(event),
            None => {
                let event = AlertEvent::firing(
                    &rule.id,
                    &rule.name,
                    rule.severity,
                    message,
                    details,
                    entity_id,
                    now,
                );
                retry_persistence(self.retry, "insert event", || self.events.insert_event(&event))
                    .await?;
                StateChange::Fired(event)
            }
        };

        let fired_key = last_fired_key(&rule.id);
        let fired_expires = now + rule.cooldown() + self.pending_ttl;
        retry_persistence(self.retry, "set last_fired_at", || {
            self.state.set(&fired_key, now, fired_expires)
        })
        .await?;
        // Duration is re-measured from scratch after every fire.
        let first_key = first_true_key(&rule.id);
        retry_persistence(self.retry, "clear first_true_at", || self.state.delete(&first_key))
            .await?;
        Ok(change)
    }

    async fn resolve(
        &self,
        rule: &Rule,
        state: &RuleRuntimeState,
        open: Option<AlertEvent>,
        now: DateTime<Utc>,
    ) -> Result<StateChange> {
        if state.first_true_at.is_some() {
            let key = first_true_key(&rule.id);
            retry_persistence(self.retry, "clear first_true_at", || self.state.delete(&key))
                .await?;
        }
        let Some(mut event) = open else {
            return Ok(StateChange::Idle);
        };
        let resolved = retry_persistence(self.retry, "resolve event", || {
            self.events.resolve_event(&event.id, now)
        })
        .await?;
        if !resolved {
            return Ok(StateChange::Idle);
        }
        event.status = AlertStatus::Resolved;
        event.resolved_at = Some(now);
        Ok(StateChange::Resolved(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(mins: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default() + Duration::minutes(mins)
    }

    fn five() -> Duration {
        Duration::minutes(5)
    }

    fn thirty() -> Duration {
        Duration::minutes(30)
    }

    #[test]
    fn idle_true_starts_pending() {
        let t = decide(&RuleRuntimeState::default(), true, at(0), five(), thirty());
        assert_eq!(t, Transition::StartPending);
    }

    #[test]
    fn pending_waits_for_duration() {
        let state = RuleRuntimeState {
            first_true_at: Some(at(0)),
            ..Default::default()
        };
        assert_eq!(
            decide(&state, true, at(4), five(), thirty()),
            Transition::StillPending {
                elapsed: Duration::minutes(4)
            }
        );
        assert_eq!(decide(&state, true, at(5), five(), thirty()), Transition::Fire);
    }

    #[test]
    fn cooldown_suppresses_eligible_rule() {
        let state = RuleRuntimeState {
            first_true_at: Some(at(10)),
            last_fired_at: Some(at(5)),
            has_open_event: false,
        };
        assert_eq!(
            decide(&state, true, at(15), five(), thirty()),
            Transition::CooldownSuppressed {
                remaining: Duration::minutes(20)
            }
        );
        assert_eq!(decide(&state, true, at(35), five(), thirty()), Transition::Fire);
    }

    #[test]
    fn zero_duration_fires_on_first_true() {
        let t = decide(
            &RuleRuntimeState::default(),
            true,
            at(0),
            Duration::zero(),
            thirty(),
        );
        assert_eq!(t, Transition::Fire);
    }

    #[test]
    fn false_resolves_only_when_something_to_clear() {
        assert_eq!(
            decide(&RuleRuntimeState::default(), false, at(0), five(), thirty()),
            Transition::Idle
        );
        let pending = RuleRuntimeState {
            first_true_at: Some(at(0)),
            ..Default::default()
        };
        assert_eq!(decide(&pending, false, at(1), five(), thirty()), Transition::Resolve);
        let open = RuleRuntimeState {
            has_open_event: true,
            ..Default::default()
        };
        assert_eq!(decide(&open, false, at(1), five(), thirty()), Transition::Resolve);
    }
}
