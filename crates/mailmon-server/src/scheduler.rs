use crate::state::StatusBoard;
use chrono::{DateTime, Utc};
use mailmon_alert::engine::{PassReport, RuleEngine, RuleOutcome};
use mailmon_alert::remediation::{RemediationAction, Remediator};
use mailmon_storage::sqlite::SqliteStore;
use mailmon_storage::{ObservationStore, StateStore};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Runs rule passes on a fixed cadence. Passes never overlap: a pass that
/// outlasts the interval delays the next tick instead of stacking.
pub struct RuleScheduler {
    engine: RuleEngine,
    status: Arc<StatusBoard>,
    interval_secs: u64,
}

impl RuleScheduler {
    pub fn new(engine: RuleEngine, status: Arc<StatusBoard>, interval_secs: u64) -> Self {
        Self {
            engine,
            status,
            interval_secs,
        }
    }

    pub async fn run(&self) {
        tracing::info!(interval_secs = self.interval_secs, "Rule scheduler started");

        let mut tick = interval(Duration::from_secs(self.interval_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            self.run_once(Utc::now()).await;
        }
    }

    /// One pass at `now`; the outcome is published on the status board.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Option<PassReport> {
        match self.engine.run_pass(now).await {
            Ok(report) => {
                let persistence_failed =
                    report.count(|o| matches!(o, RuleOutcome::PersistenceFailed(_)));
                if persistence_failed > 0 {
                    tracing::warn!(
                        persistence_failed,
                        "Some rule states were not saved; the next pass recomputes them"
                    );
                }
                self.status.record(&report);
                Some(report)
            }
            Err(e) => {
                tracing::error!(error = %e, "Rule pass failed");
                self.status.record_failure(&e.to_string());
                None
            }
        }
    }
}

/// Reconciles one remediation tier on its own cadence.
pub struct RemediationScheduler {
    remediator: Remediator,
    tier: String,
    interval_secs: u64,
}

impl RemediationScheduler {
    pub fn new(remediator: Remediator, tier: &str, interval_secs: u64) -> Self {
        Self {
            remediator,
            tier: tier.to_string(),
            interval_secs,
        }
    }

    pub async fn run(&self) {
        tracing::info!(
            tier = %self.tier,
            interval_secs = self.interval_secs,
            "Remediation scheduler started"
        );

        let mut tick = interval(Duration::from_secs(self.interval_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            match self.remediator.run_tier_pass(&self.tier, Utc::now()).await {
                Ok(actions) => {
                    let applied = actions
                        .iter()
                        .filter(|(_, _, a)| {
                            matches!(a, RemediationAction::Paused(_) | RemediationAction::Restored(_))
                        })
                        .count();
                    tracing::info!(
                        tier = %self.tier,
                        pairs = actions.len(),
                        applied,
                        "Remediation pass complete"
                    );
                }
                Err(e) => {
                    tracing::error!(tier = %self.tier, error = %e, "Remediation pass failed");
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub state_keys: u64,
    pub snapshots: u64,
    pub observations: u64,
}

/// Removes expired state keys plus snapshots and observations older than
/// `retention_days`. Each purge is independent; one failing does not skip
/// the others.
pub async fn cleanup_once(store: &SqliteStore, retention_days: u32, now: DateTime<Utc>) -> CleanupReport {
    let cutoff = now - chrono::Duration::days(i64::from(retention_days));
    let mut report = CleanupReport::default();

    match store.purge_expired(now).await {
        Ok(n) => report.state_keys = n,
        Err(e) => tracing::error!(error = %e, "State key cleanup failed"),
    }
    match store.purge_snapshots_before(cutoff) {
        Ok(n) => report.snapshots = n,
        Err(e) => tracing::error!(error = %e, "Snapshot cleanup failed"),
    }
    match store.purge_observations_before(cutoff).await {
        Ok(n) => report.observations = n,
        Err(e) => tracing::error!(error = %e, "Observation cleanup failed"),
    }
    report
}

/// Hourly cleanup loop.
pub async fn run_cleanup(store: Arc<SqliteStore>, retention_days: u32) {
    let mut tick = interval(Duration::from_secs(3600));
    loop {
        tick.tick().await;
        let report = cleanup_once(&store, retention_days, Utc::now()).await;
        if report != CleanupReport::default() {
            tracing::info!(
                state_keys = report.state_keys,
                snapshots = report.snapshots,
                observations = report.observations,
                "Cleaned up expired data"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailmon_common::types::{MetricSnapshot, MetricSource, Observation};
    use mailmon_storage::SnapshotSource;

    #[tokio::test]
    async fn cleanup_purges_only_expired_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        let now = Utc::now();
        let old = now - chrono::Duration::days(10);

        let snapshot = |ts| MetricSnapshot {
            entity_id: "node-a".to_string(),
            source: MetricSource::Node,
            metric: "cpu_percent".to_string(),
            value: 10.0,
            timestamp: ts,
        };
        store.write_snapshots(&[snapshot(old), snapshot(now)]).unwrap();

        let observation = |ts| Observation {
            target_id: "ip-1".to_string(),
            source: "rbl".to_string(),
            tier: "critical".to_string(),
            adverse: false,
            timestamp: ts,
        };
        store.record_observation(&observation(old)).await.unwrap();
        store.record_observation(&observation(now)).await.unwrap();

        store
            .set("rule:r1:first_true_at", old, now - chrono::Duration::seconds(1))
            .await
            .unwrap();
        store
            .set("rule:r2:first_true_at", now, now + chrono::Duration::hours(1))
            .await
            .unwrap();

        let report = cleanup_once(&store, 7, now).await;
        assert_eq!(
            report,
            CleanupReport {
                state_keys: 1,
                snapshots: 1,
                observations: 1,
            }
        );
        assert!(store.get("rule:r2:first_true_at", now).await.unwrap().is_some());
        // Last-seen survives for absence detection.
        let seen = store.last_seen(MetricSource::Node).await.unwrap();
        assert_eq!(seen.len(), 1);
    }
}
