//! JSON seed files for the `init-rules` and `init-channels` subcommands.
//!
//! Seeding is additive: records whose name already exists are skipped,
//! never overwritten.

use mailmon_alert::condition;
use mailmon_common::metrics::MetricWhitelist;
use mailmon_common::types::{ChannelRecord, ChannelType, RuleRecord, Severity};
use mailmon_notify::plugin::ChannelRegistry;
use mailmon_storage::sqlite::SqliteStore;
use mailmon_storage::{ChannelStore, RuleStore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesSeedFile {
    #[serde(default)]
    pub rules: Vec<SeedRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRule {
    pub name: String,
    pub condition: String,
    #[serde(default = "default_seed_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default = "default_seed_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_entity_pattern")]
    pub entity_pattern: String,
    #[serde(default = "default_seed_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsSeedFile {
    #[serde(default)]
    pub channels: Vec<SeedChannel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedChannel {
    pub name: String,
    pub channel_type: ChannelType,
    pub config: serde_json::Value,
    #[serde(default = "default_seed_enabled")]
    pub enabled: bool,
}

fn default_seed_severity() -> Severity {
    Severity::Info
}

fn default_seed_cooldown_secs() -> u64 {
    300
}

fn default_entity_pattern() -> String {
    "*".to_string()
}

fn default_seed_enabled() -> bool {
    true
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub created: u32,
    pub skipped: u32,
    pub invalid: u32,
}

pub fn load_seed<T: DeserializeOwned>(seed_path: &str) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(seed_path)
        .map_err(|e| anyhow::anyhow!("Failed to read seed file '{}': {}", seed_path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse seed file '{}': {}", seed_path, e))
}

/// Inserts seed rules whose names are not taken yet.
///
/// A condition that does not parse is still inserted; the engine reports
/// the rule as misconfigured until it is fixed.
pub async fn init_rules(
    store: &SqliteStore,
    whitelist: &MetricWhitelist,
    seed: &RulesSeedFile,
) -> anyhow::Result<SeedReport> {
    let mut existing: HashSet<String> = store.rule_names()?;
    let mut report = SeedReport::default();

    for r in &seed.rules {
        if !existing.insert(r.name.clone()) {
            tracing::warn!(name = %r.name, "Alert rule already exists, skipping");
            report.skipped += 1;
            continue;
        }
        if let Err(e) = condition::parse(&r.condition, whitelist) {
            tracing::warn!(name = %r.name, condition = %r.condition, error = %e, "Seeded rule condition is invalid");
        }

        let record = RuleRecord {
            id: mailmon_common::id::next_id(),
            name: r.name.clone(),
            severity: r.severity,
            condition: r.condition.clone(),
            duration_secs: r.duration_secs,
            cooldown_secs: r.cooldown_secs,
            channels: r.channels.clone(),
            entity_pattern: r.entity_pattern.clone(),
            enabled: r.enabled,
        };
        match store.upsert_rule(&record).await {
            Ok(()) => {
                tracing::info!(name = %r.name, id = %record.id, "Alert rule created");
                report.created += 1;
            }
            Err(e) => {
                tracing::error!(name = %r.name, error = %e, "Failed to create alert rule");
            }
        }
    }
    Ok(report)
}

/// Inserts seed channels whose names are not taken and whose configuration
/// passes the channel type's validation.
pub async fn init_channels(
    store: &SqliteStore,
    registry: &ChannelRegistry,
    seed: &ChannelsSeedFile,
) -> anyhow::Result<SeedReport> {
    let mut existing: HashSet<String> = store.channel_names()?;
    let mut report = SeedReport::default();

    for ch in &seed.channels {
        if existing.contains(&ch.name) {
            tracing::warn!(name = %ch.name, "Channel already exists, skipping");
            report.skipped += 1;
            continue;
        }

        let type_name = ch.channel_type.as_str();
        let validation = match registry.get_plugin(type_name) {
            Some(plugin) => plugin.validate_config(&ch.config).map_err(|e| e.to_string()),
            None => Err(format!("no plugin for channel type '{type_name}'")),
        };
        if let Err(error) = validation {
            tracing::error!(
                name = %ch.name,
                channel_type = type_name,
                config = %registry.redact_config(type_name, &ch.config),
                error = %error,
                "Channel config invalid, skipping"
            );
            report.invalid += 1;
            continue;
        }

        let record = ChannelRecord {
            id: mailmon_common::id::next_id(),
            name: ch.name.clone(),
            channel_type: ch.channel_type,
            config: ch.config.clone(),
            enabled: ch.enabled,
        };
        match store.upsert_channel(&record).await {
            Ok(()) => {
                tracing::info!(name = %ch.name, id = %record.id, "Channel created");
                existing.insert(ch.name.clone());
                report.created += 1;
            }
            Err(e) => {
                tracing::error!(name = %ch.name, error = %e, "Failed to create channel");
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules_seed() -> RulesSeedFile {
        serde_json::from_value(serde_json::json!({
            "rules": [
                {
                    "name": "High CPU",
                    "condition": "cpu_percent > 85",
                    "severity": "critical",
                    "duration_secs": 300,
                    "channels": ["ops"]
                },
                { "name": "Queue backlog", "condition": "mta:queue_size > 5000" },
                { "name": "High CPU", "condition": "cpu_percent > 95" },
                { "name": "Broken", "condition": "cpu_percent >> 1" }
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn init_rules_skips_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        let whitelist = MetricWhitelist::builtin();

        let report = init_rules(&store, &whitelist, &rules_seed()).await.unwrap();
        assert_eq!(report.created, 3);
        assert_eq!(report.skipped, 1);

        let rules = store.list_enabled_rules().await.unwrap();
        let cpu = rules.iter().find(|r| r.name == "High CPU").unwrap();
        assert_eq!(cpu.condition, "cpu_percent > 85");
        assert_eq!(cpu.severity, Severity::Critical);
        let backlog = rules.iter().find(|r| r.name == "Queue backlog").unwrap();
        assert_eq!(backlog.severity, Severity::Info);
        assert_eq!(backlog.cooldown_secs, 300);
        assert_eq!(backlog.entity_pattern, "*");

        // A second run creates nothing.
        let again = init_rules(&store, &whitelist, &rules_seed()).await.unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.skipped, 4);
    }

    #[tokio::test]
    async fn init_channels_validates_before_insert() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        let seed: ChannelsSeedFile = serde_json::from_value(serde_json::json!({
            "channels": [
                {
                    "name": "ops",
                    "channel_type": "slack",
                    "config": { "webhook_url": "https://hooks.slack.com/services/T/B/X" }
                },
                {
                    "name": "robot",
                    "channel_type": "dingtalk",
                    "config": { "webhook_url": "ftp://nope" }
                },
                {
                    "name": "paging",
                    "channel_type": "webhook",
                    "config": { "url": "https://hooks.example.com/a" },
                    "enabled": false
                }
            ]
        }))
        .unwrap();

        let registry = ChannelRegistry::default();
        let report = init_channels(&store, &registry, &seed).await.unwrap();
        assert_eq!(report, SeedReport { created: 2, skipped: 0, invalid: 1 });

        let enabled = store.list_enabled_channels().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "ops");
        assert_eq!(enabled[0].channel_type, ChannelType::Slack);

        let again = init_channels(&store, &registry, &seed).await.unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.skipped, 2);
    }
}
