//! Severity presentation vocabulary shared by every sender.

use mailmon_common::types::{AlertEvent, AlertStatus, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presentation {
    pub icon: &'static str,
    /// Hex color, e.g. `#d32f2f`.
    pub color: &'static str,
    pub label: &'static str,
}

pub const RESOLVED: Presentation = Presentation {
    icon: "✅",
    color: "#388e3c",
    label: "RESOLVED",
};

/// Presentation of a severity level.
///
/// # Examples
///
/// ```
/// use mailmon_common::types::Severity;
/// use mailmon_notify::presentation::for_severity;
///
/// assert_eq!(for_severity(Severity::Critical).icon, "🔴");
/// assert_eq!(for_severity(Severity::Info).color, "#1976d2");
/// ```
pub fn for_severity(severity: Severity) -> Presentation {
    match severity {
        Severity::Critical => Presentation {
            icon: "🔴",
            color: "#d32f2f",
            label: "CRITICAL",
        },
        Severity::Warning => Presentation {
            icon: "🟠",
            color: "#f57c00",
            label: "WARNING",
        },
        Severity::Info => Presentation {
            icon: "🔵",
            color: "#1976d2",
            label: "INFO",
        },
    }
}

/// Presentation of an event: resolved events use [`RESOLVED`] whatever their severity.
pub fn for_event(event: &AlertEvent) -> Presentation {
    match event.status {
        AlertStatus::Resolved => RESOLVED,
        AlertStatus::Firing => for_severity(event.severity),
    }
}

/// An alert event formatted once per dispatch and handed to every sender.
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub title: String,
    /// Plain-text body, one `Key: value` pair per line.
    pub body: String,
    pub presentation: Presentation,
    pub event: AlertEvent,
}

impl RenderedMessage {
    pub fn render(event: &AlertEvent) -> Self {
        let presentation = for_event(event);
        let subject = match &event.node_id {
            Some(node) => format!("{} - {node}", event.rule_name),
            None => event.rule_name.clone(),
        };
        let title = format!(
            "{} [mailmon][{}] {subject}",
            presentation.icon, presentation.label
        );

        let mut lines = vec![
            format!("Severity: {}", event.severity),
            format!("Status: {}", event.status),
            format!("Rule: {} ({})", event.rule_name, event.rule_id),
        ];
        if let Some(node) = &event.node_id {
            lines.push(format!("Entity: {node}"));
        }
        lines.push(format!("Fired: {}", event.fired_at.to_rfc3339()));
        if let Some(resolved) = event.resolved_at {
            lines.push(format!("Resolved: {}", resolved.to_rfc3339()));
        }
        if event.escalation_level > 0 {
            lines.push(format!("Escalation: {}", event.escalation_level));
        }
        lines.push(format!("Message: {}", event.message));

        Self {
            title,
            body: lines.join("\n"),
            presentation,
            event: event.clone(),
        }
    }

    /// Markdown rendering for chat webhooks.
    pub fn markdown(&self) -> String {
        let items: Vec<String> = self
            .body
            .lines()
            .map(|line| match line.split_once(": ") {
                Some((key, value)) => format!("- **{key}**: {value}"),
                None => format!("- {line}"),
            })
            .collect();
        format!("### {}\n\n{}", self.title, items.join("\n"))
    }

    /// Single-line rendering for SMS.
    pub fn short(&self) -> String {
        format!("{} {}", self.title, self.event.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(severity: Severity) -> AlertEvent {
        AlertEvent::firing(
            "cpu",
            "High CPU",
            severity,
            "cpu_percent 91 > 85 on node-a",
            serde_json::Value::Null,
            Some("node-a".into()),
            Utc::now(),
        )
    }

    #[test]
    fn vocabulary_is_fixed_per_severity() {
        assert_eq!(for_severity(Severity::Critical).color, "#d32f2f");
        assert_eq!(for_severity(Severity::Warning).icon, "🟠");
        assert_eq!(for_severity(Severity::Warning).color, "#f57c00");
        assert_eq!(for_severity(Severity::Info).icon, "🔵");
    }

    #[test]
    fn resolved_overrides_severity() {
        let mut resolved = event(Severity::Critical);
        resolved.status = AlertStatus::Resolved;
        resolved.resolved_at = Some(Utc::now());
        let message = RenderedMessage::render(&resolved);
        assert_eq!(message.presentation, RESOLVED);
        assert!(message.title.starts_with("✅ [mailmon][RESOLVED] High CPU - node-a"));
        assert!(message.body.contains("Resolved: "));
    }

    #[test]
    fn render_includes_entity_and_message() {
        let message = RenderedMessage::render(&event(Severity::Warning));
        assert_eq!(message.title, "🟠 [mailmon][WARNING] High CPU - node-a");
        assert!(message.body.contains("Entity: node-a"));
        assert!(message.body.ends_with("Message: cpu_percent 91 > 85 on node-a"));
        assert!(message.markdown().contains("- **Entity**: node-a"));
        assert!(!message.body.contains("Escalation"));
    }
}
