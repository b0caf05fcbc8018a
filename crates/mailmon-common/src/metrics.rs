//! Whitelisted metric names.
//!
//! A [`MetricName`] can only be obtained from [`MetricWhitelist::resolve`],
//! and every snapshot query takes a `&MetricName`, so a name that was never
//! whitelisted cannot become an identifier in a metrics query.

use crate::types::MetricSource;
use std::collections::{HashMap, HashSet};

const BUILTIN: &[(MetricSource, &str)] = &[
    (MetricSource::Node, "cpu_percent"),
    (MetricSource::Node, "memory_percent"),
    (MetricSource::Node, "disk_percent"),
    (MetricSource::Node, "load_1m"),
    (MetricSource::Mta, "queue_size"),
    (MetricSource::Mta, "deferred_count"),
    (MetricSource::Mta, "delivered_count"),
    (MetricSource::Mta, "bounce_count"),
    (MetricSource::Mta, "delivery_rate"),
    (MetricSource::Mta, "connection_errors"),
    (MetricSource::Database, "replication_lag_seconds"),
    (MetricSource::Database, "replication_running"),
    (MetricSource::Database, "connections_used_percent"),
    (MetricSource::Database, "slow_queries"),
    (MetricSource::Ip, "blacklist_listed"),
    (MetricSource::Ip, "complaint_rate"),
    (MetricSource::Ip, "bounce_rate"),
];

/// A metric name that passed the whitelist, bound to its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricName {
    source: MetricSource,
    name: String,
}

impl MetricName {
    pub fn source(&self) -> MetricSource {
        self.source
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for MetricName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.name)
    }
}

/// The explicit set of metrics conditions may reference.
///
/// # Examples
///
/// ```
/// use mailmon_common::metrics::MetricWhitelist;
/// use mailmon_common::types::MetricSource;
///
/// let whitelist = MetricWhitelist::builtin();
/// let cpu = whitelist.resolve(None, "cpu_percent").unwrap();
/// assert_eq!(cpu.source(), MetricSource::Node);
/// assert!(whitelist.resolve(None, "cpu_percent; DROP TABLE x").is_none());
/// assert!(whitelist.resolve(Some(MetricSource::Ip), "cpu_percent").is_none());
/// ```
#[derive(Debug, Clone)]
pub struct MetricWhitelist {
    allowed: HashSet<(MetricSource, String)>,
    defaults: HashMap<String, MetricSource>,
}

impl MetricWhitelist {
    pub fn empty() -> Self {
        Self {
            allowed: HashSet::new(),
            defaults: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut whitelist = Self::empty();
        for (source, name) in BUILTIN {
            // Built-in names are valid identifiers.
            let _ = whitelist.allow(*source, name);
        }
        whitelist
    }

    /// Adds `source:metric` entries (e.g. from configuration).
    pub fn with_extra(mut self, entries: &[String]) -> Result<Self, String> {
        for entry in entries {
            let (source, name) = entry
                .split_once(':')
                .ok_or_else(|| format!("metric whitelist entry must be source:metric, got '{entry}'"))?;
            let source: MetricSource = source.trim().parse()?;
            self.allow(source, name.trim())?;
        }
        Ok(self)
    }

    /// Allows `name` under `source`. The first source registered for a name
    /// becomes its default when a condition omits the source.
    pub fn allow(&mut self, source: MetricSource, name: &str) -> Result<(), String> {
        if !is_identifier(name) {
            return Err(format!("invalid metric name '{name}'"));
        }
        self.allowed.insert((source, name.to_string()));
        self.defaults.entry(name.to_string()).or_insert(source);
        Ok(())
    }

    /// Resolves a name against the whitelist, inferring the source if absent.
    pub fn resolve(&self, source: Option<MetricSource>, name: &str) -> Option<MetricName> {
        let source = match source {
            Some(source) => source,
            None => *self.defaults.get(name)?,
        };
        if self.allowed.contains(&(source, name.to_string())) {
            Some(MetricName {
                source,
                name: name.to_string(),
            })
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

impl Default for MetricWhitelist {
    fn default() -> Self {
        Self::builtin()
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_covers_every_source() {
        let whitelist = MetricWhitelist::builtin();
        for source in [
            MetricSource::Node,
            MetricSource::Mta,
            MetricSource::Database,
            MetricSource::Ip,
        ] {
            assert!(BUILTIN.iter().any(|(s, _)| *s == source));
        }
        assert_eq!(whitelist.len(), BUILTIN.len());
    }

    #[test]
    fn extra_entries_extend_whitelist() {
        let whitelist = MetricWhitelist::builtin()
            .with_extra(&["mta:tls_failures".to_string()])
            .unwrap();
        let name = whitelist.resolve(None, "tls_failures").unwrap();
        assert_eq!(name.source(), MetricSource::Mta);
        assert_eq!(name.to_string(), "mta:tls_failures");
    }

    #[test]
    fn extra_entries_reject_bad_names() {
        assert!(MetricWhitelist::builtin()
            .with_extra(&["mta:Queue-Size".to_string()])
            .is_err());
        assert!(MetricWhitelist::builtin()
            .with_extra(&["queue_size".to_string()])
            .is_err());
        assert!(MetricWhitelist::builtin()
            .with_extra(&["smtp:queue_size".to_string()])
            .is_err());
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        let whitelist = MetricWhitelist::builtin();
        assert!(whitelist.resolve(None, "users").is_none());
        assert!(whitelist.resolve(None, "").is_none());
    }
}
