use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert severity level, ordered from lowest to highest.
///
/// # Examples
///
/// ```
/// use mailmon_common::types::Severity;
///
/// let sev: Severity = "warning".parse().unwrap();
/// assert_eq!(sev, Severity::Warning);
/// assert_eq!(sev.to_string(), "warning");
/// assert!(Severity::Critical > Severity::Info);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// Lifecycle status of an [`AlertEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Firing => "firing",
            AlertStatus::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firing" => Ok(AlertStatus::Firing),
            "resolved" => Ok(AlertStatus::Resolved),
            _ => Err(format!("unknown alert status: {s}")),
        }
    }
}

/// One firing/resolved lifecycle of a rule (or of an automatic remediation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: String,
    pub rule_id: String,
    /// Human-readable rule name, used by senders when rendering.
    pub rule_name: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub message: String,
    /// Opaque payload describing what tripped the rule.
    pub details: serde_json::Value,
    /// Entity that tripped the rule (node, MTA, database or sending IP).
    pub node_id: Option<String>,
    pub fired_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// An attempt to notify was made; per-channel outcomes live in the dispatch result.
    pub notified: bool,
    pub escalation_level: u32,
}

impl AlertEvent {
    /// Builds a new firing event with a fresh id.
    pub fn firing(
        rule_id: impl Into<String>,
        rule_name: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        details: serde_json::Value,
        node_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: crate::id::next_id(),
            rule_id: rule_id.into(),
            rule_name: rule_name.into(),
            severity,
            status: AlertStatus::Firing,
            message: message.into(),
            details,
            node_id,
            fired_at: now,
            resolved_at: None,
            notified: false,
            escalation_level: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == AlertStatus::Firing
    }
}

/// Family of entities a metric series is reported for.
///
/// # Examples
///
/// ```
/// use mailmon_common::types::MetricSource;
///
/// let source: MetricSource = "mta".parse().unwrap();
/// assert_eq!(source, MetricSource::Mta);
/// assert!("smtp".parse::<MetricSource>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricSource {
    Node,
    Mta,
    Database,
    Ip,
}

impl MetricSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricSource::Node => "node",
            MetricSource::Mta => "mta",
            MetricSource::Database => "database",
            MetricSource::Ip => "ip",
        }
    }
}

impl std::fmt::Display for MetricSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(MetricSource::Node),
            "mta" => Ok(MetricSource::Mta),
            "database" => Ok(MetricSource::Database),
            "ip" => Ok(MetricSource::Ip),
            _ => Err(format!("unknown metric source: {s}")),
        }
    }
}

/// Latest observed value of one metric for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub entity_id: String,
    pub source: MetricSource,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// One result of an external periodic check against a remediation target
/// (e.g. a blacklist lookup for a sending IP).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub target_id: String,
    /// Checker that produced the observation (e.g. `"spamhaus-zen"`).
    pub source: String,
    /// Priority bucket of the checker (e.g. `"critical"`, `"high"`).
    pub tier: String,
    pub adverse: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Active,
    Paused,
    Disabled,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Active => "active",
            TargetStatus::Paused => "paused",
            TargetStatus::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TargetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TargetStatus::Active),
            "paused" => Ok(TargetStatus::Paused),
            "disabled" => Ok(TargetStatus::Disabled),
            _ => Err(format!("unknown target status: {s}")),
        }
    }
}

/// A managed resource the remediator may pause and restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationTarget {
    pub id: String,
    pub status: TargetStatus,
    /// Audit trail; automatic pauses carry a tag naming remediator and source.
    pub notes: String,
    pub updated_at: DateTime<Utc>,
}

impl RemediationTarget {
    /// The most recent audit note line, if any.
    pub fn latest_note(&self) -> Option<&str> {
        self.notes.lines().rev().find(|line| !line.trim().is_empty())
    }
}

/// Alert rule as stored by the external management surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    /// Raw condition text, e.g. `cpu_percent > 85`.
    pub condition: String,
    /// Minimum continuous-true time before firing.
    pub duration_secs: u64,
    /// Minimum time between fires.
    pub cooldown_secs: u64,
    pub channels: Vec<String>,
    /// Glob over entity ids; `*` watches every entity.
    #[serde(default = "default_entity_pattern")]
    pub entity_pattern: String,
    pub enabled: bool,
}

fn default_entity_pattern() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Webhook,
    Slack,
    Email,
    Sms,
    DingTalk,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Webhook => "webhook",
            ChannelType::Slack => "slack",
            ChannelType::Email => "email",
            ChannelType::Sms => "sms",
            ChannelType::DingTalk => "dingtalk",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "webhook" => Ok(ChannelType::Webhook),
            "slack" => Ok(ChannelType::Slack),
            "email" => Ok(ChannelType::Email),
            "sms" => Ok(ChannelType::Sms),
            "dingtalk" => Ok(ChannelType::DingTalk),
            _ => Err(format!("unknown channel type: {s}")),
        }
    }
}

/// Notification channel as stored by the external management surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: String,
    pub name: String,
    pub channel_type: ChannelType,
    /// Sender-specific configuration, validated by the channel plugin.
    pub config: serde_json::Value,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&ChannelType::DingTalk).unwrap();
        assert_eq!(json, "\"dingtalk\"");
        let parsed: ChannelType = "DingTalk".parse().unwrap();
        assert_eq!(parsed, ChannelType::DingTalk);
    }

    #[test]
    fn rule_record_defaults_entity_pattern() {
        let record: RuleRecord = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "name": "High CPU",
            "severity": "critical",
            "condition": "cpu_percent > 85",
            "duration_secs": 300,
            "cooldown_secs": 1800,
            "channels": ["ops"],
            "enabled": true
        }))
        .unwrap();
        assert_eq!(record.entity_pattern, "*");
        assert_eq!(record.severity, Severity::Critical);
    }

    #[test]
    fn firing_event_starts_open_and_unnotified() {
        let event = AlertEvent::firing(
            "r1",
            "High CPU",
            Severity::Warning,
            "cpu high",
            serde_json::Value::Null,
            Some("node-a".into()),
            Utc::now(),
        );
        assert!(event.is_open());
        assert!(!event.notified);
        assert_eq!(event.escalation_level, 0);
        assert!(event.resolved_at.is_none());
    }
}
