use crate::config::ServerConfig;
use crate::notifier::DispatchNotifier;
use chrono::{DateTime, Duration, Utc};
use mailmon_alert::engine::{PassReport, RuleEngine, RuleOutcome, RuleStatus};
use mailmon_alert::evaluator::Evaluator;
use mailmon_alert::publish::BroadcastPublisher;
use mailmon_alert::remediation::Remediator;
use mailmon_alert::state::RuleStateTracker;
use mailmon_alert::AlertNotifier;
use mailmon_common::types::Severity;
use mailmon_notify::plugin::ChannelRegistry;
use mailmon_notify::Dispatcher;
use mailmon_storage::sqlite::SqliteStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Live feed buffer per subscriber before it starts lagging.
const LIVE_FEED_CAPACITY: usize = 256;

/// Dashboard view of one rule after the latest pass.
#[derive(Debug, Clone, Serialize)]
pub struct RuleStatusView {
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub status: RuleStatus,
    pub firing: bool,
    /// Why the rule could not be evaluated, when it could not.
    pub detail: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Default)]
struct BoardInner {
    last_pass_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    rules: BTreeMap<String, RuleStatusView>,
}

/// Latest pass result per rule, shared between the scheduler and the API.
#[derive(Default)]
pub struct StatusBoard {
    inner: Mutex<BoardInner>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the board with `report`; rules missing from it were removed
    /// or disabled and drop off.
    pub fn record(&self, report: &PassReport) {
        let rules = report
            .rules
            .iter()
            .map(|r| {
                let detail = match &r.outcome {
                    RuleOutcome::NotEvaluable(msg)
                    | RuleOutcome::Misconfigured(msg)
                    | RuleOutcome::PersistenceFailed(msg) => Some(msg.clone()),
                    _ => None,
                };
                let view = RuleStatusView {
                    rule_id: r.rule_id.clone(),
                    rule_name: r.rule_name.clone(),
                    severity: r.severity,
                    status: r.status(),
                    firing: r.firing,
                    detail,
                    evaluated_at: report.started_at,
                };
                (r.rule_id.clone(), view)
            })
            .collect();

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.last_pass_at = Some(report.started_at);
        inner.last_error = None;
        inner.rules = rules;
    }

    /// Records a pass that could not start. Per-rule views are kept.
    pub fn record_failure(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.last_error = Some(error.to_string());
    }

    pub fn last_pass_at(&self) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last_pass_at
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last_error
            .clone()
    }

    pub fn rules(&self) -> Vec<RuleStatusView> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .rules
            .values()
            .cloned()
            .collect()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    /// `None` when remediation is disabled; observations are then only recorded.
    pub remediator: Option<Remediator>,
    pub publisher: Arc<BroadcastPublisher>,
    pub status: Arc<StatusBoard>,
    pub start_time: DateTime<Utc>,
    pub config: Arc<ServerConfig>,
}

/// Everything `run_server` wires together.
pub struct Components {
    pub state: AppState,
    pub engine: RuleEngine,
}

/// Wires the store, dispatcher, engine and remediator from configuration.
pub fn build_components(config: ServerConfig, store: Arc<SqliteStore>) -> anyhow::Result<Components> {
    let whitelist = Arc::new(config.metric_whitelist()?);
    let retry = config.retry_policy();

    let dispatcher = Dispatcher::new(
        store.clone(),
        store.clone(),
        ChannelRegistry::default(),
        config.send_timeout(),
    )
    .with_write_retry(retry);
    let notifier: Arc<dyn AlertNotifier> = Arc::new(DispatchNotifier(Arc::new(dispatcher)));
    let publisher = Arc::new(BroadcastPublisher::new(LIVE_FEED_CAPACITY));

    let evaluator = Evaluator::new(
        store.clone(),
        Duration::seconds(config.evaluation.lookback_secs as i64),
        std::time::Duration::from_secs(config.evaluation.source_timeout_secs),
    );
    let tracker = RuleStateTracker::new(
        store.clone(),
        store.clone(),
        Duration::seconds(config.evaluation.pending_ttl_secs as i64),
        retry,
    );
    let engine = RuleEngine::new(
        store.clone(),
        whitelist,
        evaluator,
        tracker,
        notifier.clone(),
        publisher.clone(),
        config.evaluation.max_concurrent,
    );

    let remediator = config.remediation.enabled.then(|| {
        Remediator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            notifier.clone(),
            publisher.clone(),
            retry,
            config.remediator_config(),
        )
    });

    let state = AppState {
        store,
        remediator,
        publisher,
        status: Arc::new(StatusBoard::new()),
        start_time: Utc::now(),
        config: Arc::new(config),
    };
    Ok(Components { state, engine })
}
