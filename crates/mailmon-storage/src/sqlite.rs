use crate::error::{Result, StorageError};
use crate::{
    append_note, AlertEventStore, ChannelStore, ObservationStore, RuleStore, SnapshotSource,
    StateStore, TargetStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailmon_common::metrics::MetricName;
use mailmon_common::types::{
    AlertEvent, AlertStatus, ChannelRecord, ChannelType, MetricSnapshot, MetricSource,
    Observation, RemediationTarget, RuleRecord, Severity, TargetStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const SNAPSHOTS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metric_snapshots (
    entity_id TEXT NOT NULL,
    source TEXT NOT NULL,
    metric TEXT NOT NULL,
    value REAL NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_metric_time
    ON metric_snapshots(source, metric, timestamp);
CREATE INDEX IF NOT EXISTS idx_snapshots_time
    ON metric_snapshots(timestamp);
CREATE TABLE IF NOT EXISTS entity_last_seen (
    source TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    last_seen INTEGER NOT NULL,
    PRIMARY KEY (source, entity_id)
);
";

const STATE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS state_keys (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_state_expires ON state_keys(expires_at);
";

const ALERTS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS alert_events (
    id TEXT PRIMARY KEY,
    rule_id TEXT NOT NULL,
    rule_name TEXT NOT NULL,
    severity TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT 'null',
    node_id TEXT,
    fired_at INTEGER NOT NULL,
    resolved_at INTEGER,
    notified INTEGER NOT NULL DEFAULT 0,
    escalation_level INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_alerts_rule_status ON alert_events(rule_id, status);
CREATE INDEX IF NOT EXISTS idx_alerts_fired ON alert_events(fired_at);
";

const CONFIG_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS alert_rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    severity TEXT NOT NULL,
    condition TEXT NOT NULL,
    duration_secs INTEGER NOT NULL,
    cooldown_secs INTEGER NOT NULL,
    channels TEXT NOT NULL DEFAULT '[]',
    entity_pattern TEXT NOT NULL DEFAULT '*',
    enabled INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS notification_channels (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    channel_type TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1
);
";

const REMEDIATION_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_id TEXT NOT NULL,
    source TEXT NOT NULL,
    tier TEXT NOT NULL,
    adverse INTEGER NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_observations_pair
    ON observations(target_id, source, timestamp);
CREATE INDEX IF NOT EXISTS idx_observations_tier_time
    ON observations(tier, timestamp);
CREATE TABLE IF NOT EXISTS remediation_targets (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    notes TEXT NOT NULL DEFAULT '',
    updated_at INTEGER NOT NULL
);
";

const ALERT_COLUMNS: &str = "id, rule_id, rule_name, severity, status, message, details, \
     node_id, fired_at, resolved_at, notified, escalation_level";

/// All stores on one WAL-mode SQLite database file.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) `mailmon.db` under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| StorageError::Unavailable(format!("{}: {e}", data_dir.display())))?;
        let db_path = data_dir.join("mailmon.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SNAPSHOTS_SCHEMA)?;
        conn.execute_batch(STATE_SCHEMA)?;
        conn.execute_batch(ALERTS_SCHEMA)?;
        conn.execute_batch(CONFIG_SCHEMA)?;
        conn.execute_batch(REMEDIATION_SCHEMA)?;
        tracing::info!(path = %db_path.display(), "Initialized mailmon store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection, recovering from a poisoned Mutex if necessary.
    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        lock(&self.conn)
    }

    /// Runs a read on the blocking pool so callers can time it out without
    /// stalling the runtime. A timed-out read still finishes in the
    /// background and keeps the connection until then.
    async fn read_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut lock(&conn)))
            .await
            .map_err(|e| StorageError::Other(format!("snapshot read task failed: {e}")))?
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        let mut conn = self.lock_conn();
        f(&mut conn)
    }

    /// Appends a batch of snapshots and refreshes entity last-seen times.
    pub fn write_snapshots(&self, batch: &[MetricSnapshot]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut insert = tx.prepare_cached(
                    "INSERT INTO metric_snapshots (entity_id, source, metric, value, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                let mut seen = tx.prepare_cached(
                    "INSERT INTO entity_last_seen (source, entity_id, last_seen)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(source, entity_id)
                     DO UPDATE SET last_seen = MAX(last_seen, excluded.last_seen)",
                )?;
                for snapshot in batch {
                    let ts = snapshot.timestamp.timestamp_millis();
                    insert.execute(params![
                        snapshot.entity_id,
                        snapshot.source.as_str(),
                        snapshot.metric,
                        snapshot.value,
                        ts,
                    ])?;
                    seen.execute(params![snapshot.source.as_str(), snapshot.entity_id, ts])?;
                }
            }
            tx.commit()?;
            Ok(batch.len())
        })
    }

    /// Deletes raw snapshots older than `cutoff`. Last-seen times are kept.
    pub fn purge_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM metric_snapshots WHERE timestamp < ?1",
                params![cutoff.timestamp_millis()],
            )?;
            Ok(n as u64)
        })
    }

    /// Names of every stored rule, enabled or not.
    pub fn rule_names(&self) -> Result<HashSet<String>> {
        self.names_in("SELECT name FROM alert_rules")
    }

    /// Names of every stored notification channel, enabled or not.
    pub fn channel_names(&self) -> Result<HashSet<String>> {
        self.names_in("SELECT name FROM notification_channels")
    }

    fn names_in(&self, sql: &str) -> Result<HashSet<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok(names)
        })
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_column<T: std::str::FromStr<Err = String>>(column: &'static str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|reason| StorageError::InvalidColumn { column, reason })
}

/// Raw alert_events row; converted outside the rusqlite row closure so that
/// enum and JSON decoding errors surface as [`StorageError`].
struct AlertRow {
    id: String,
    rule_id: String,
    rule_name: String,
    severity: String,
    status: String,
    message: String,
    details: String,
    node_id: Option<String>,
    fired_at: i64,
    resolved_at: Option<i64>,
    notified: bool,
    escalation_level: i64,
}

impl AlertRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            rule_id: row.get(1)?,
            rule_name: row.get(2)?,
            severity: row.get(3)?,
            status: row.get(4)?,
            message: row.get(5)?,
            details: row.get(6)?,
            node_id: row.get(7)?,
            fired_at: row.get(8)?,
            resolved_at: row.get(9)?,
            notified: row.get(10)?,
            escalation_level: row.get(11)?,
        })
    }

    fn into_event(self) -> Result<AlertEvent> {
        Ok(AlertEvent {
            id: self.id,
            rule_id: self.rule_id,
            rule_name: self.rule_name,
            severity: parse_column::<Severity>("severity", &self.severity)?,
            status: parse_column::<AlertStatus>("status", &self.status)?,
            message: self.message,
            details: serde_json::from_str(&self.details)?,
            node_id: self.node_id,
            fired_at: from_millis(self.fired_at),
            resolved_at: self.resolved_at.map(from_millis),
            notified: self.notified,
            escalation_level: self.escalation_level.max(0) as u32,
        })
    }
}

#[async_trait]
impl SnapshotSource for SqliteStore {
    async fn latest_per_entity(
        &self,
        metric: &MetricName,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSnapshot>> {
        let metric = metric.clone();
        self.read_blocking(move |conn| {
            // SQLite returns the bare columns from the row holding MAX(timestamp).
            let mut stmt = conn.prepare_cached(
                "SELECT entity_id, value, MAX(timestamp) FROM metric_snapshots
                 WHERE source = ?1 AND metric = ?2 AND timestamp >= ?3
                 GROUP BY entity_id
                 ORDER BY entity_id",
            )?;
            let rows = stmt.query_map(
                params![
                    metric.source().as_str(),
                    metric.as_str(),
                    since.timestamp_millis()
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )?;
            let mut out = Vec::new();
            for row in rows {
                let (entity_id, value, ts) = row?;
                out.push(MetricSnapshot {
                    entity_id,
                    source: metric.source(),
                    metric: metric.as_str().to_string(),
                    value,
                    timestamp: from_millis(ts),
                });
            }
            Ok(out)
        })
        .await
    }

    async fn last_seen(&self, source: MetricSource) -> Result<Vec<(String, DateTime<Utc>)>> {
        self.read_blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT entity_id, last_seen FROM entity_last_seen
                 WHERE source = ?1 ORDER BY entity_id",
            )?;
            let rows = stmt.query_map(params![source.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (entity_id, ts) = row?;
                out.push((entity_id, from_millis(ts)));
            }
            Ok(out)
        })
        .await
    }

    async fn event_count(&self, metric: &MetricName, since: DateTime<Utc>) -> Result<u64> {
        let metric = metric.clone();
        self.read_blocking(move |conn| {
            let total: f64 = conn.query_row(
                "SELECT COALESCE(SUM(value), 0) FROM metric_snapshots
                 WHERE source = ?1 AND metric = ?2 AND timestamp >= ?3",
                params![
                    metric.source().as_str(),
                    metric.as_str(),
                    since.timestamp_millis()
                ],
                |row| row.get(0),
            )?;
            Ok(total.max(0.0) as u64)
        })
        .await
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let value: Option<i64> = conn
                .query_row(
                    "SELECT value FROM state_keys WHERE key = ?1 AND expires_at > ?2",
                    params![key, now.timestamp_millis()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.map(from_millis))
        })
    }

    async fn set(&self, key: &str, value: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO state_keys (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                expires_at = excluded.expires_at",
                params![key, value.timestamp_millis(), expires_at.timestamp_millis()],
            )?;
            Ok(())
        })
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO state_keys (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                expires_at = excluded.expires_at
                 WHERE state_keys.expires_at <= ?4",
                params![
                    key,
                    value.timestamp_millis(),
                    expires_at.timestamp_millis(),
                    now.timestamp_millis()
                ],
            )?;
            Ok(changed > 0)
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM state_keys WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM state_keys WHERE expires_at <= ?1",
                params![now.timestamp_millis()],
            )?;
            Ok(n as u64)
        })
    }

    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }
}

#[async_trait]
impl AlertEventStore for SqliteStore {
    async fn insert_event(&self, event: &AlertEvent) -> Result<()> {
        let details = serde_json::to_string(&event.details)?;
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO alert_events ({ALERT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    event.id,
                    event.rule_id,
                    event.rule_name,
                    event.severity.to_string(),
                    event.status.as_str(),
                    event.message,
                    details,
                    event.node_id,
                    event.fired_at.timestamp_millis(),
                    event.resolved_at.map(|t| t.timestamp_millis()),
                    event.notified,
                    event.escalation_level as i64,
                ],
            )?;
            Ok(())
        })
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<AlertEvent>> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {ALERT_COLUMNS} FROM alert_events WHERE id = ?1"),
                    params![event_id],
                    AlertRow::from_row,
                )
                .optional()?)
        })?;
        row.map(AlertRow::into_event).transpose()
    }

    async fn open_event_for_rule(&self, rule_id: &str) -> Result<Option<AlertEvent>> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {ALERT_COLUMNS} FROM alert_events
                         WHERE rule_id = ?1 AND status = 'firing'
                         ORDER BY fired_at DESC LIMIT 1"
                    ),
                    params![rule_id],
                    AlertRow::from_row,
                )
                .optional()?)
        })?;
        row.map(AlertRow::into_event).transpose()
    }

    async fn open_event_for_entity(
        &self,
        rule_id: &str,
        node_id: &str,
    ) -> Result<Option<AlertEvent>> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {ALERT_COLUMNS} FROM alert_events
                         WHERE rule_id = ?1 AND node_id = ?2 AND status = 'firing'
                         ORDER BY fired_at DESC LIMIT 1"
                    ),
                    params![rule_id, node_id],
                    AlertRow::from_row,
                )
                .optional()?)
        })?;
        row.map(AlertRow::into_event).transpose()
    }

    async fn resolve_event(&self, event_id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE alert_events SET status = 'resolved', resolved_at = ?2
                 WHERE id = ?1 AND status = 'firing'",
                params![event_id, at.timestamp_millis()],
            )?;
            Ok(n > 0)
        })
    }

    async fn escalate_event(&self, event_id: &str) -> Result<Option<u32>> {
        self.with_conn(|conn| {
            let level: Option<i64> = conn
                .query_row(
                    "UPDATE alert_events SET escalation_level = escalation_level + 1
                     WHERE id = ?1 AND status = 'firing'
                     RETURNING escalation_level",
                    params![event_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(level.map(|l| l.max(0) as u32))
        })
    }

    async fn mark_notified(&self, event_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE alert_events SET notified = 1 WHERE id = ?1",
                params![event_id],
            )?;
            Ok(n > 0)
        })
    }

    async fn list_open_events(&self, limit: usize) -> Result<Vec<AlertEvent>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ALERT_COLUMNS} FROM alert_events
                 WHERE status = 'firing' ORDER BY fired_at DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], AlertRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(AlertRow::into_event).collect()
    }
}

#[async_trait]
impl RuleStore for SqliteStore {
    async fn list_enabled_rules(&self) -> Result<Vec<RuleRecord>> {
        type RawRule = (String, String, String, String, i64, i64, String, String);
        let rows: Vec<RawRule> = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, name, severity, condition, duration_secs, cooldown_secs,
                        channels, entity_pattern
                 FROM alert_rules WHERE enabled = 1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut rules = Vec::with_capacity(rows.len());
        for (id, name, severity, condition, duration, cooldown, channels, pattern) in rows {
            // A single corrupt record must not hide the remaining rules.
            let severity = match parse_column::<Severity>("severity", &severity) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(rule_id = %id, error = %e, "Skipping rule with invalid severity");
                    continue;
                }
            };
            let channels: Vec<String> = match serde_json::from_str(&channels) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(rule_id = %id, error = %e, "Skipping rule with invalid channel list");
                    continue;
                }
            };
            rules.push(RuleRecord {
                id,
                name,
                severity,
                condition,
                duration_secs: duration.max(0) as u64,
                cooldown_secs: cooldown.max(0) as u64,
                channels,
                entity_pattern: pattern,
                enabled: true,
            });
        }
        Ok(rules)
    }

    async fn upsert_rule(&self, rule: &RuleRecord) -> Result<()> {
        let channels = serde_json::to_string(&rule.channels)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alert_rules (id, name, severity, condition, duration_secs,
                                          cooldown_secs, channels, entity_pattern, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name, severity = excluded.severity,
                    condition = excluded.condition, duration_secs = excluded.duration_secs,
                    cooldown_secs = excluded.cooldown_secs, channels = excluded.channels,
                    entity_pattern = excluded.entity_pattern, enabled = excluded.enabled",
                params![
                    rule.id,
                    rule.name,
                    rule.severity.to_string(),
                    rule.condition,
                    rule.duration_secs as i64,
                    rule.cooldown_secs as i64,
                    channels,
                    rule.entity_pattern,
                    rule.enabled,
                ],
            )?;
            Ok(())
        })
    }
}

#[async_trait]
impl ChannelStore for SqliteStore {
    async fn list_enabled_channels(&self) -> Result<Vec<ChannelRecord>> {
        let rows: Vec<(String, String, String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, name, channel_type, config FROM notification_channels
                 WHERE enabled = 1 ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut channels = Vec::with_capacity(rows.len());
        for (id, name, channel_type, config) in rows {
            let channel_type = match parse_column::<ChannelType>("channel_type", &channel_type) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(channel = %name, error = %e, "Skipping channel with unknown type");
                    continue;
                }
            };
            let config = match serde_json::from_str(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(channel = %name, error = %e, "Skipping channel with invalid config JSON");
                    continue;
                }
            };
            channels.push(ChannelRecord {
                id,
                name,
                channel_type,
                config,
                enabled: true,
            });
        }
        Ok(channels)
    }

    async fn upsert_channel(&self, channel: &ChannelRecord) -> Result<()> {
        let config = serde_json::to_string(&channel.config)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notification_channels (id, name, channel_type, config, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name, channel_type = excluded.channel_type,
                    config = excluded.config, enabled = excluded.enabled",
                params![
                    channel.id,
                    channel.name,
                    channel.channel_type.as_str(),
                    config,
                    channel.enabled,
                ],
            )?;
            Ok(())
        })
    }
}

#[async_trait]
impl ObservationStore for SqliteStore {
    async fn record_observation(&self, observation: &Observation) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO observations (target_id, source, tier, adverse, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    observation.target_id,
                    observation.source,
                    observation.tier,
                    observation.adverse,
                    observation.timestamp.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }

    async fn recent_observations(
        &self,
        target_id: &str,
        source: &str,
        limit: usize,
    ) -> Result<Vec<Observation>> {
        self.with_conn(|conn| {
            // Insertion order breaks timestamp ties so the newest write wins.
            let mut stmt = conn.prepare_cached(
                "SELECT target_id, source, tier, adverse, timestamp FROM observations
                 WHERE target_id = ?1 AND source = ?2
                 ORDER BY timestamp DESC, id DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![target_id, source, limit as i64], |row| {
                    Ok(Observation {
                        target_id: row.get(0)?,
                        source: row.get(1)?,
                        tier: row.get(2)?,
                        adverse: row.get(3)?,
                        timestamp: from_millis(row.get(4)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn observed_pairs(
        &self,
        tier: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT target_id, source FROM observations
                 WHERE tier = ?1 AND timestamp >= ?2
                 ORDER BY target_id, source",
            )?;
            let rows = stmt
                .query_map(params![tier, since.timestamp_millis()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn purge_observations_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM observations WHERE timestamp < ?1",
                params![cutoff.timestamp_millis()],
            )?;
            Ok(n as u64)
        })
    }
}

#[async_trait]
impl TargetStore for SqliteStore {
    async fn get_target(&self, target_id: &str) -> Result<Option<RemediationTarget>> {
        let row: Option<(String, String, String, i64)> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, status, notes, updated_at FROM remediation_targets WHERE id = ?1",
                    params![target_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?)
        })?;
        row.map(|(id, status, notes, updated_at)| {
            Ok(RemediationTarget {
                id,
                status: parse_column::<TargetStatus>("status", &status)?,
                notes,
                updated_at: from_millis(updated_at),
            })
        })
        .transpose()
    }

    async fn transition_target(
        &self,
        target_id: &str,
        from: TargetStatus,
        to: TargetStatus,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let notes: Option<String> = tx
                .query_row(
                    "SELECT notes FROM remediation_targets WHERE id = ?1 AND status = ?2",
                    params![target_id, from.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(notes) = notes else {
                return Ok(false);
            };
            let n = tx.execute(
                "UPDATE remediation_targets SET status = ?3, notes = ?4, updated_at = ?5
                 WHERE id = ?1 AND status = ?2",
                params![
                    target_id,
                    from.as_str(),
                    to.as_str(),
                    append_note(&notes, note),
                    at.timestamp_millis()
                ],
            )?;
            tx.commit()?;
            Ok(n > 0)
        })
    }

    async fn upsert_target(&self, target: &RemediationTarget) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO remediation_targets (id, status, notes, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status,
                    notes = excluded.notes, updated_at = excluded.updated_at",
                params![
                    target.id,
                    target.status.as_str(),
                    target.notes,
                    target.updated_at.timestamp_millis()
                ],
            )?;
            Ok(())
        })
    }
}
