//! Typed rule conditions and their parser.
//!
//! ```text
//! threshold := [source ":"] metric op number       cpu_percent > 85
//! absence   := absent([source ","] window)         absent(mta, 10m)
//! count     := count([source ":"] metric, window) > integer
//! special   := special(name)                       special(queue_stalled)
//! ```
//!
//! Every metric is resolved against a [`MetricWhitelist`] while parsing, so
//! a parsed [`Condition`] only ever carries whitelisted [`MetricName`]s.

use mailmon_common::metrics::{MetricName, MetricWhitelist};
use mailmon_common::types::MetricSource;
use std::str::FromStr;

/// Longest window, duration or cooldown a rule may use (ten years).
pub const MAX_SPAN_SECS: u64 = 10 * 366 * 86_400;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty condition")]
    Empty,

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unknown operator '{0}' (expected >, >=, <, <=, == or =)")]
    UnknownOperator(String),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("invalid window '{0}' (expected e.g. 30s, 5m, 1h)")]
    InvalidWindow(String),

    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error("metric '{0}' is not whitelisted")]
    MetricNotAllowed(String),

    #[error("unknown special check '{0}'")]
    UnknownSpecial(String),

    #[error("metric '{metric}' is not reported by source '{requested}'")]
    SourceMismatch {
        metric: String,
        requested: MetricSource,
    },

    #[error("{field} of {secs}s exceeds the {MAX_SPAN_SECS}s limit")]
    SpanTooLong { field: &'static str, secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    GreaterThan,
    GreaterEqual,
    LessThan,
    LessEqual,
    Equal,
}

impl FromStr for CompareOp {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">" => Ok(Self::GreaterThan),
            ">=" => Ok(Self::GreaterEqual),
            "<" => Ok(Self::LessThan),
            "<=" => Ok(Self::LessEqual),
            "==" | "=" => Ok(Self::Equal),
            _ => Err(ParseError::UnknownOperator(s.to_string())),
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GreaterThan => write!(f, ">"),
            Self::GreaterEqual => write!(f, ">="),
            Self::LessThan => write!(f, "<"),
            Self::LessEqual => write!(f, "<="),
            Self::Equal => write!(f, "=="),
        }
    }
}

impl CompareOp {
    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessEqual => value <= threshold,
            Self::Equal => value == threshold,
        }
    }
}

/// A trailing time window, e.g. `5m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    secs: u64,
}

impl Window {
    pub fn from_secs(secs: u64) -> Self {
        Self { secs }
    }

    pub fn as_secs(&self) -> u64 {
        self.secs
    }

    pub fn duration(&self) -> chrono::Duration {
        span(self.secs)
    }
}

/// Converts seconds to a [`chrono::Duration`], saturating at [`MAX_SPAN_SECS`].
pub fn span(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_SPAN_SECS) as i64)
}

impl FromStr for Window {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ParseError::InvalidWindow(s.to_string());
        let unit_start = s.char_indices().last().map(|(i, _)| i).unwrap_or(0);
        let (digits, unit) = s.split_at(unit_start);
        let n: u64 = digits.parse().map_err(|_| invalid())?;
        let scale = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            _ => return Err(invalid()),
        };
        if n == 0 {
            return Err(invalid());
        }
        let secs = n
            .checked_mul(scale)
            .filter(|secs| *secs <= MAX_SPAN_SECS)
            .ok_or_else(invalid)?;
        Ok(Self { secs })
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.secs % 3600 == 0 {
            write!(f, "{}h", self.secs / 3600)
        } else if self.secs % 60 == 0 {
            write!(f, "{}m", self.secs / 60)
        } else {
            write!(f, "{}s", self.secs)
        }
    }
}

/// Named composite checks, each existential over the latest value per entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialCheck {
    /// An MTA holds queued mail but delivers nothing.
    QueueStalled {
        queue_size: MetricName,
        delivery_rate: MetricName,
    },
    /// An MTA defers more than a quarter of a meaningful message volume.
    DeferralRatioHigh {
        deferred: MetricName,
        delivered: MetricName,
    },
    /// A database replica stopped replicating or fell far behind.
    ReplicationBroken {
        running: MetricName,
        lag: MetricName,
    },
}

/// Share of deferred messages above which `deferral_ratio_high` trips.
pub const DEFERRAL_RATIO_LIMIT: f64 = 0.25;
/// Messages an MTA must have handled before its deferral ratio counts.
pub const DEFERRAL_MIN_MESSAGES: f64 = 20.0;
/// Replication lag beyond which `replication_broken` trips.
pub const REPLICATION_LAG_LIMIT_SECS: f64 = 300.0;

impl SpecialCheck {
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueueStalled { .. } => "queue_stalled",
            Self::DeferralRatioHigh { .. } => "deferral_ratio_high",
            Self::ReplicationBroken { .. } => "replication_broken",
        }
    }

    fn parse(name: &str, whitelist: &MetricWhitelist) -> Result<Self, ParseError> {
        let metric = |source, name| resolve_metric(whitelist, Some(source), name);
        match name {
            "queue_stalled" => Ok(Self::QueueStalled {
                queue_size: metric(MetricSource::Mta, "queue_size")?,
                delivery_rate: metric(MetricSource::Mta, "delivery_rate")?,
            }),
            "deferral_ratio_high" => Ok(Self::DeferralRatioHigh {
                deferred: metric(MetricSource::Mta, "deferred_count")?,
                delivered: metric(MetricSource::Mta, "delivered_count")?,
            }),
            "replication_broken" => Ok(Self::ReplicationBroken {
                running: metric(MetricSource::Database, "replication_running")?,
                lag: metric(MetricSource::Database, "replication_lag_seconds")?,
            }),
            other => Err(ParseError::UnknownSpecial(other.to_string())),
        }
    }
}

/// A rule predicate, decoded once per rule load.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Threshold {
        metric: MetricName,
        op: CompareOp,
        value: f64,
    },
    /// A previously reporting entity of `source` went quiet for `window`.
    Absence { source: MetricSource, window: Window },
    /// More than `threshold` events of `metric` within `window`.
    Count {
        metric: MetricName,
        window: Window,
        threshold: u64,
    },
    Special(SpecialCheck),
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Threshold { metric, op, value } => write!(f, "{metric} {op} {value}"),
            Self::Absence { source, window } => write!(f, "absent({source}, {window})"),
            Self::Count {
                metric,
                window,
                threshold,
            } => write!(f, "count({metric}, {window}) > {threshold}"),
            Self::Special(check) => write!(f, "special({})", check.name()),
        }
    }
}

/// Parses a raw condition, resolving every metric against `whitelist`.
///
/// # Examples
///
/// ```
/// use mailmon_alert::condition::{parse, Condition, ParseError};
/// use mailmon_common::metrics::MetricWhitelist;
///
/// let whitelist = MetricWhitelist::builtin();
/// let cond = parse("mta:queue_size >= 5000", &whitelist).unwrap();
/// assert!(matches!(cond, Condition::Threshold { .. }));
///
/// let err = parse("users > 1", &whitelist).unwrap_err();
/// assert_eq!(err, ParseError::MetricNotAllowed("users".into()));
/// ```
pub fn parse(raw: &str, whitelist: &MetricWhitelist) -> Result<Condition, ParseError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }

    if let Some((args, rest)) = split_call(text, "absent")? {
        expect_end(rest)?;
        return parse_absence(args);
    }
    if let Some((args, rest)) = split_call(text, "special")? {
        expect_end(rest)?;
        return Ok(Condition::Special(SpecialCheck::parse(args.trim(), whitelist)?));
    }
    if let Some((args, rest)) = split_call(text, "count")? {
        return parse_count(args, rest, whitelist);
    }
    parse_threshold(text, whitelist)
}

/// Splits `name(args) rest` into `(args, rest)`; `None` if `text` is not a
/// call of `name`.
fn split_call<'a>(text: &'a str, name: &str) -> Result<Option<(&'a str, &'a str)>, ParseError> {
    let Some(after) = text.strip_prefix(name) else {
        return Ok(None);
    };
    let Some(inner) = after.trim_start().strip_prefix('(') else {
        return Ok(None);
    };
    let close = inner
        .find(')')
        .ok_or_else(|| ParseError::Syntax(format!("missing ')' in {name}(...)")))?;
    Ok(Some((&inner[..close], &inner[close + 1..])))
}

fn expect_end(rest: &str) -> Result<(), ParseError> {
    if rest.trim().is_empty() {
        Ok(())
    } else {
        Err(ParseError::Syntax(format!(
            "unexpected trailing input '{}'",
            rest.trim()
        )))
    }
}

fn parse_absence(args: &str) -> Result<Condition, ParseError> {
    let parts: Vec<&str> = args.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [window] => Ok(Condition::Absence {
            source: MetricSource::Node,
            window: window.parse()?,
        }),
        [source, window] => Ok(Condition::Absence {
            source: parse_source(source)?,
            window: window.parse()?,
        }),
        _ => Err(ParseError::Syntax(
            "absent() takes ([source,] window)".to_string(),
        )),
    }
}

fn parse_count(
    args: &str,
    rest: &str,
    whitelist: &MetricWhitelist,
) -> Result<Condition, ParseError> {
    let (metric, window) = args
        .split_once(',')
        .ok_or_else(|| ParseError::Syntax("count() takes (metric, window)".to_string()))?;
    let metric = parse_metric_ref(metric, whitelist)?;
    let window: Window = window.parse()?;

    let rest = rest.trim();
    let (op, number) = split_operator(rest)
        .ok_or_else(|| ParseError::Syntax("count() must be compared with '>'".to_string()))?;
    if op != ">" {
        return Err(ParseError::UnknownOperator(op.to_string()));
    }
    let number = number.trim();
    let threshold: u64 = number
        .parse()
        .map_err(|_| ParseError::InvalidNumber(number.to_string()))?;
    Ok(Condition::Count {
        metric,
        window,
        threshold,
    })
}

fn parse_threshold(text: &str, whitelist: &MetricWhitelist) -> Result<Condition, ParseError> {
    let start = text
        .find(is_operator_char)
        .ok_or_else(|| ParseError::Syntax(format!("no comparison operator in '{text}'")))?;
    let lhs = &text[..start];
    let (op, number) = split_operator(&text[start..])
        .ok_or_else(|| ParseError::Syntax(format!("no comparison operator in '{text}'")))?;
    if lhs.trim().is_empty() {
        return Err(ParseError::Syntax("missing metric name".to_string()));
    }

    let op: CompareOp = op.parse()?;
    let metric = parse_metric_ref(lhs, whitelist)?;
    let number = number.trim();
    let value: f64 = number
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| ParseError::InvalidNumber(number.to_string()))?;
    Ok(Condition::Threshold { metric, op, value })
}

fn is_operator_char(c: char) -> bool {
    matches!(c, '<' | '>' | '=' | '!')
}

/// Splits `<op><rest>` where op is the leading run of operator characters.
fn split_operator(text: &str) -> Option<(&str, &str)> {
    let end = text
        .find(|c: char| !is_operator_char(c))
        .unwrap_or(text.len());
    if end == 0 {
        return None;
    }
    Some((&text[..end], &text[end..]))
}

fn parse_source(raw: &str) -> Result<MetricSource, ParseError> {
    raw.trim()
        .parse()
        .map_err(|_| ParseError::UnknownSource(raw.trim().to_string()))
}

fn parse_metric_ref(raw: &str, whitelist: &MetricWhitelist) -> Result<MetricName, ParseError> {
    let raw = raw.trim();
    match raw.split_once(':') {
        Some((source, name)) => {
            let source = parse_source(source)?;
            resolve_metric(whitelist, Some(source), name.trim())
        }
        None => resolve_metric(whitelist, None, raw),
    }
}

fn resolve_metric(
    whitelist: &MetricWhitelist,
    source: Option<MetricSource>,
    name: &str,
) -> Result<MetricName, ParseError> {
    if let Some(metric) = whitelist.resolve(source, name) {
        return Ok(metric);
    }
    match source {
        Some(requested) if whitelist.resolve(None, name).is_some() => {
            Err(ParseError::SourceMismatch {
                metric: name.to_string(),
                requested,
            })
        }
        _ => Err(ParseError::MetricNotAllowed(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wl() -> MetricWhitelist {
        MetricWhitelist::builtin()
    }

    #[test]
    fn parses_threshold_with_inferred_source() {
        let cond = parse("cpu_percent > 85", &wl()).unwrap();
        match cond {
            Condition::Threshold { metric, op, value } => {
                assert_eq!(metric.source(), MetricSource::Node);
                assert_eq!(metric.as_str(), "cpu_percent");
                assert_eq!(op, CompareOp::GreaterThan);
                assert_eq!(value, 85.0);
            }
            other => panic!("unexpected condition: {other:?}"),
        }
    }

    #[test]
    fn accepts_every_operator() {
        for (text, op) in [
            ("load_1m>2", CompareOp::GreaterThan),
            ("load_1m >= 2", CompareOp::GreaterEqual),
            ("load_1m < 2", CompareOp::LessThan),
            ("load_1m<=2", CompareOp::LessEqual),
            ("load_1m == 2", CompareOp::Equal),
            ("load_1m = 2", CompareOp::Equal),
        ] {
            match parse(text, &wl()).unwrap() {
                Condition::Threshold { op: parsed, .. } => assert_eq!(parsed, op, "{text}"),
                other => panic!("unexpected condition: {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_unknown_operators() {
        assert_eq!(
            parse("cpu_percent != 5", &wl()).unwrap_err(),
            ParseError::UnknownOperator("!=".into())
        );
        assert_eq!(
            parse("cpu_percent => 5", &wl()).unwrap_err(),
            ParseError::UnknownOperator("=>".into())
        );
    }

    #[test]
    fn rejects_unwhitelisted_and_injected_names() {
        assert_eq!(
            parse("password > 0", &wl()).unwrap_err(),
            ParseError::MetricNotAllowed("password".into())
        );
        assert!(matches!(
            parse("cpu_percent; DROP TABLE metrics > 0", &wl()).unwrap_err(),
            ParseError::MetricNotAllowed(_)
        ));
        assert_eq!(
            parse("ip:cpu_percent > 5", &wl()).unwrap_err(),
            ParseError::SourceMismatch {
                metric: "cpu_percent".into(),
                requested: MetricSource::Ip
            }
        );
        assert_eq!(
            parse("smtp:queue_size > 5", &wl()).unwrap_err(),
            ParseError::UnknownSource("smtp".into())
        );
    }

    #[test]
    fn rejects_bad_numbers_and_empty_input() {
        assert_eq!(parse("   ", &wl()).unwrap_err(), ParseError::Empty);
        assert_eq!(
            parse("cpu_percent > lots", &wl()).unwrap_err(),
            ParseError::InvalidNumber("lots".into())
        );
        assert_eq!(
            parse("cpu_percent > NaN", &wl()).unwrap_err(),
            ParseError::InvalidNumber("NaN".into())
        );
        assert!(matches!(
            parse("cpu_percent", &wl()).unwrap_err(),
            ParseError::Syntax(_)
        ));
    }

    #[test]
    fn parses_absence() {
        assert_eq!(
            parse("absent(5m)", &wl()).unwrap(),
            Condition::Absence {
                source: MetricSource::Node,
                window: Window::from_secs(300)
            }
        );
        assert_eq!(
            parse("absent(mta, 1h)", &wl()).unwrap(),
            Condition::Absence {
                source: MetricSource::Mta,
                window: Window::from_secs(3600)
            }
        );
        assert_eq!(
            parse("absent(0m)", &wl()).unwrap_err(),
            ParseError::InvalidWindow("0m".into())
        );
        assert_eq!(
            parse("absent(5d)", &wl()).unwrap_err(),
            ParseError::InvalidWindow("5d".into())
        );
        assert_eq!(
            parse("absent(99999999999999h)", &wl()).unwrap_err(),
            ParseError::InvalidWindow("99999999999999h".into())
        );
        assert!(matches!(
            parse("absent(5m) extra", &wl()).unwrap_err(),
            ParseError::Syntax(_)
        ));
    }

    #[test]
    fn parses_count() {
        let cond = parse("count(mta:bounce_count, 10m) > 50", &wl()).unwrap();
        match &cond {
            Condition::Count {
                metric,
                window,
                threshold,
            } => {
                assert_eq!(metric.as_str(), "bounce_count");
                assert_eq!(window.as_secs(), 600);
                assert_eq!(*threshold, 50);
            }
            other => panic!("unexpected condition: {other:?}"),
        }
        assert_eq!(cond.to_string(), "count(mta:bounce_count, 10m) > 50");

        assert_eq!(
            parse("count(bounce_count, 10m) >= 50", &wl()).unwrap_err(),
            ParseError::UnknownOperator(">=".into())
        );
        assert_eq!(
            parse("count(bounce_count, 10m) > 2.5", &wl()).unwrap_err(),
            ParseError::InvalidNumber("2.5".into())
        );
        assert_eq!(
            parse("count(secret_count, 10m) > 1", &wl()).unwrap_err(),
            ParseError::MetricNotAllowed("secret_count".into())
        );
    }

    #[test]
    fn parses_specials() {
        let cond = parse("special(queue_stalled)", &wl()).unwrap();
        assert_eq!(cond.to_string(), "special(queue_stalled)");
        assert!(parse("special( replication_broken )", &wl()).is_ok());
        assert_eq!(
            parse("special(disk_on_fire)", &wl()).unwrap_err(),
            ParseError::UnknownSpecial("disk_on_fire".into())
        );
        // Specials still go through the whitelist.
        assert!(matches!(
            parse("special(queue_stalled)", &MetricWhitelist::empty()).unwrap_err(),
            ParseError::MetricNotAllowed(_)
        ));
    }

    #[test]
    fn window_display_uses_largest_unit() {
        assert_eq!("90s".parse::<Window>().unwrap().to_string(), "90s");
        assert_eq!("120s".parse::<Window>().unwrap().to_string(), "2m");
        assert_eq!("60m".parse::<Window>().unwrap().to_string(), "1h");
    }
}
