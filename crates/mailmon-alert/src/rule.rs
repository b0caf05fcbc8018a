use crate::condition::{self, span, Condition, ParseError, MAX_SPAN_SECS};
use mailmon_common::metrics::MetricWhitelist;
use mailmon_common::types::{RuleRecord, Severity};

/// Outcome of decoding a rule's raw condition.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledCondition {
    Valid(Condition),
    /// The raw text did not parse; the rule evaluates as not triggered.
    Invalid { raw: String, error: ParseError },
}

/// A rule record with its condition decoded once.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    pub condition: CompiledCondition,
    pub duration_secs: u64,
    pub cooldown_secs: u64,
    pub channels: Vec<String>,
    pub entity_pattern: String,
}

impl Rule {
    /// Decodes the condition. Out-of-range duration or cooldown values make
    /// the rule invalid as a whole.
    pub fn compile(record: RuleRecord, whitelist: &MetricWhitelist) -> Self {
        let parsed = check_span("duration_secs", record.duration_secs)
            .and_then(|()| check_span("cooldown_secs", record.cooldown_secs))
            .and_then(|()| condition::parse(&record.condition, whitelist));
        let condition = match parsed {
            Ok(parsed) => CompiledCondition::Valid(parsed),
            Err(error) => CompiledCondition::Invalid {
                raw: record.condition.clone(),
                error,
            },
        };
        Self {
            id: record.id,
            name: record.name,
            severity: record.severity,
            condition,
            duration_secs: record.duration_secs,
            cooldown_secs: record.cooldown_secs,
            channels: record.channels,
            entity_pattern: record.entity_pattern,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        span(self.duration_secs)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        span(self.cooldown_secs)
    }

    pub fn matches_entity(&self, entity_id: &str) -> bool {
        entity_matches(&self.entity_pattern, entity_id)
    }
}

fn check_span(field: &'static str, secs: u64) -> Result<(), ParseError> {
    if secs > MAX_SPAN_SECS {
        return Err(ParseError::SpanTooLong { field, secs });
    }
    Ok(())
}

fn entity_matches(pattern: &str, entity_id: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    glob_match::glob_match(pattern, entity_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(condition: &str, pattern: &str) -> RuleRecord {
        RuleRecord {
            id: "r1".into(),
            name: "rule".into(),
            severity: Severity::Warning,
            condition: condition.into(),
            duration_secs: 60,
            cooldown_secs: 600,
            channels: vec![],
            entity_pattern: pattern.into(),
            enabled: true,
        }
    }

    #[test]
    fn compile_keeps_invalid_conditions_as_data() {
        let rule = Rule::compile(record("cpu_percent >>> 1", "*"), &MetricWhitelist::builtin());
        match rule.condition {
            CompiledCondition::Invalid { raw, error } => {
                assert_eq!(raw, "cpu_percent >>> 1");
                assert_eq!(error, ParseError::UnknownOperator(">>>".into()));
            }
            other => panic!("expected invalid condition, got {other:?}"),
        }
    }

    #[test]
    fn oversized_cooldown_makes_rule_invalid() {
        let mut oversized = record("cpu_percent > 1", "*");
        oversized.cooldown_secs = u64::MAX;
        let rule = Rule::compile(oversized, &MetricWhitelist::builtin());
        assert!(matches!(
            rule.condition,
            CompiledCondition::Invalid {
                error: ParseError::SpanTooLong { field: "cooldown_secs", .. },
                ..
            }
        ));
        assert_eq!(rule.cooldown(), chrono::Duration::seconds(MAX_SPAN_SECS as i64));
    }

    #[test]
    fn entity_pattern_globs() {
        let rule = Rule::compile(record("cpu_percent > 1", "mx-*"), &MetricWhitelist::builtin());
        assert!(rule.matches_entity("mx-01"));
        assert!(!rule.matches_entity("db-01"));
        let all = Rule::compile(record("cpu_percent > 1", "*"), &MetricWhitelist::builtin());
        assert!(all.matches_entity("anything"));
    }
}
