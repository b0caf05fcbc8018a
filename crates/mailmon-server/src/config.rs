use mailmon_alert::remediation::RemediatorConfig;
use mailmon_alert::condition::MAX_SPAN_SECS;
use mailmon_alert::retry::RetryPolicy;
use mailmon_common::metrics::MetricWhitelist;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Raw snapshots and observations older than this are purged hourly.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub remediation: RemediationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            data_dir: default_data_dir(),
            retention_days: default_retention_days(),
            evaluation: EvaluationConfig::default(),
            persistence: PersistenceConfig::default(),
            notification: NotificationConfig::default(),
            remediation: RemediationConfig::default(),
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_retention_days() -> u32 {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_evaluation_interval_secs")]
    pub interval_secs: u64,
    /// How far back "latest value per entity" looks.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    /// Upper bound on how long a rule may sit in pending without refresh.
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
    #[serde(default = "default_source_timeout_secs")]
    pub source_timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Additional `source:metric` entries allowed in conditions.
    #[serde(default)]
    pub extra_metrics: Vec<String>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_evaluation_interval_secs(),
            lookback_secs: default_lookback_secs(),
            pending_ttl_secs: default_pending_ttl_secs(),
            source_timeout_secs: default_source_timeout_secs(),
            max_concurrent: default_max_concurrent(),
            extra_metrics: Vec::new(),
        }
    }
}

fn default_evaluation_interval_secs() -> u64 {
    60
}

fn default_lookback_secs() -> u64 {
    120
}

fn default_pending_ttl_secs() -> u64 {
    3600
}

fn default_source_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            write_attempts: default_write_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_write_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

fn default_send_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationConfig {
    #[serde(default = "default_remediation_enabled")]
    pub enabled: bool,
    /// Name stamped into pause/restore audit tags.
    #[serde(default = "default_remediator")]
    pub remediator: String,
    #[serde(default = "default_consecutive")]
    pub consecutive: usize,
    /// The only tier whose observations pause and restore automatically.
    #[serde(default = "default_automated_tier")]
    pub automated_tier: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierSchedule>,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            enabled: default_remediation_enabled(),
            remediator: default_remediator(),
            consecutive: default_consecutive(),
            automated_tier: default_automated_tier(),
            channels: Vec::new(),
            max_concurrent: default_max_concurrent(),
            tiers: default_tiers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSchedule {
    pub name: String,
    #[serde(default = "default_tier_interval_secs")]
    pub interval_secs: u64,
}

fn default_remediation_enabled() -> bool {
    true
}

fn default_remediator() -> String {
    "auto-remediator".to_string()
}

fn default_consecutive() -> usize {
    2
}

fn default_automated_tier() -> String {
    "critical".to_string()
}

fn default_tier_interval_secs() -> u64 {
    300
}

fn default_tiers() -> Vec<TierSchedule> {
    vec![TierSchedule {
        name: default_automated_tier(),
        interval_secs: default_tier_interval_secs(),
    }]
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would stall a scheduler or disable every retry.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.evaluation.interval_secs == 0 {
            anyhow::bail!("evaluation.interval_secs must be greater than 0");
        }
        for (key, secs) in [
            ("evaluation.lookback_secs", self.evaluation.lookback_secs),
            ("evaluation.pending_ttl_secs", self.evaluation.pending_ttl_secs),
        ] {
            if secs > MAX_SPAN_SECS {
                anyhow::bail!("{key} must be at most {MAX_SPAN_SECS}");
            }
        }
        if self.persistence.write_attempts == 0 {
            anyhow::bail!("persistence.write_attempts must be at least 1");
        }
        if self.remediation.consecutive == 0 {
            anyhow::bail!("remediation.consecutive must be at least 1");
        }
        if let Some(tier) = self.remediation.tiers.iter().find(|t| t.interval_secs == 0) {
            anyhow::bail!("remediation tier '{}' has interval_secs = 0", tier.name);
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.persistence.write_attempts,
            backoff: Duration::from_millis(self.persistence.retry_backoff_ms),
        }
    }

    /// Built-in metric whitelist plus `evaluation.extra_metrics`.
    pub fn metric_whitelist(&self) -> anyhow::Result<MetricWhitelist> {
        MetricWhitelist::builtin()
            .with_extra(&self.evaluation.extra_metrics)
            .map_err(|e| anyhow::anyhow!("evaluation.extra_metrics: {e}"))
    }

    pub fn remediator_config(&self) -> RemediatorConfig {
        RemediatorConfig {
            name: self.remediation.remediator.clone(),
            consecutive: self.remediation.consecutive,
            automated_tier: self.remediation.automated_tier.clone(),
            channels: self.remediation.channels.clone(),
            max_concurrent: self.remediation.max_concurrent,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.notification.send_timeout_secs)
    }
}
