use crate::error::{NotifyError, Result};
use crate::plugin::{ChannelPlugin, ChannelRegistry};
use crate::{Dispatcher, NotificationChannel, RenderedMessage};
use async_trait::async_trait;
use chrono::Utc;
use mailmon_common::types::{AlertEvent, ChannelRecord, ChannelType, Severity};
use mailmon_storage::memory::MemoryStore;
use mailmon_storage::{AlertEventStore, ChannelStore, RetryPolicy};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Plugin registry tests ──

#[test]
fn registry_default_has_all_builtin_plugins() {
    let registry = ChannelRegistry::default();
    let mut names = registry.plugin_names();
    names.sort();
    assert_eq!(names, vec!["dingtalk", "email", "slack", "sms", "webhook"]);
}

#[test]
fn registry_unknown_plugin_returns_error() {
    let registry = ChannelRegistry::default();
    let result = registry.create_channel("pager", "c1", &serde_json::json!({}));
    assert!(matches!(result, Err(NotifyError::UnknownChannelType(ref t)) if t == "pager"));
}

#[test]
fn webhook_plugin_validates_config() {
    let registry = ChannelRegistry::default();
    let valid = serde_json::json!({
        "url": "https://hooks.example.com/alerts",
        "headers": { "Authorization": "Bearer abc" }
    });
    assert!(registry.create_channel("webhook", "c1", &valid).is_ok());

    let not_http = serde_json::json!({ "url": "ftp://example.com" });
    assert!(matches!(
        registry.create_channel("webhook", "c1", &not_http),
        Err(NotifyError::InvalidConfig(_))
    ));
    assert!(registry.create_channel("webhook", "c1", &serde_json::json!({})).is_err());

    let redacted = registry.redact_config("webhook", &valid);
    assert_eq!(redacted["headers"]["Authorization"], "***");
    assert_eq!(redacted["url"], "https://hooks.example.com/alerts");
}

#[test]
fn slack_plugin_validates_config() {
    let registry = ChannelRegistry::default();
    let valid = serde_json::json!({ "webhook_url": "https://hooks.slack.com/services/T/B/X" });
    assert!(registry.create_channel("slack", "c1", &valid).is_ok());
    assert!(registry.create_channel("slack", "c1", &serde_json::json!({})).is_err());
    assert_eq!(registry.redact_config("slack", &valid)["webhook_url"], "***");
}

#[test]
fn email_plugin_validates_config() {
    let plugin = crate::channels::email::EmailPlugin;
    let valid = serde_json::json!({
        "smtp_host": "smtp.example.com",
        "smtp_port": 587,
        "smtp_username": "alerts",
        "smtp_password": "hunter2",
        "from": "mailmon <alerts@example.com>",
        "recipients": ["ops@example.com"]
    });
    assert!(plugin.validate_config(&valid).is_ok());

    let mut no_recipients = valid.clone();
    no_recipients["recipients"] = serde_json::json!([]);
    assert!(plugin.validate_config(&no_recipients).is_err());

    let mut bad_from = valid.clone();
    bad_from["from"] = Value::String("not an address".into());
    let err = plugin.validate_config(&bad_from).unwrap_err();
    assert!(err.to_string().contains("invalid address"), "error was: {err}");

    let mut half_credentials = valid.clone();
    half_credentials
        .as_object_mut()
        .unwrap()
        .remove("smtp_password");
    assert!(plugin.validate_config(&half_credentials).is_err());

    let redacted = plugin.redact_config(&valid);
    assert_eq!(redacted["smtp_password"], "***");
    assert_eq!(redacted["smtp_host"], "smtp.example.com");
}

#[test]
fn sms_plugin_validates_config() {
    let registry = ChannelRegistry::default();
    let valid = serde_json::json!({
        "gateway_url": "https://sms.example.com/send",
        "api_key": "k",
        "phone_numbers": ["+15550100"]
    });
    assert!(registry.create_channel("sms", "c1", &valid).is_ok());

    let mut no_numbers = valid.clone();
    no_numbers["phone_numbers"] = serde_json::json!([]);
    assert!(registry.create_channel("sms", "c1", &no_numbers).is_err());
    assert_eq!(registry.redact_config("sms", &valid)["api_key"], "***");
}

#[test]
fn dingtalk_plugin_validates_config() {
    let registry = ChannelRegistry::default();
    let valid = serde_json::json!({
        "webhook_url": "https://oapi.dingtalk.com/robot/send?access_token=test",
        "secret": "SEC_test"
    });
    assert!(registry.create_channel("dingtalk", "c1", &valid).is_ok());

    let valid_no_secret = serde_json::json!({
        "webhook_url": "https://oapi.dingtalk.com/robot/send?access_token=test"
    });
    assert!(registry.create_channel("dingtalk", "c1", &valid_no_secret).is_ok());

    assert!(registry
        .create_channel("dingtalk", "c1", &serde_json::json!({}))
        .is_err());
    assert_eq!(registry.redact_config("dingtalk", &valid)["secret"], "***");
}

// ── Dispatcher tests ──

/// Sender whose behavior is scripted by its config: `{"script": "ok" | "fail" | "hang"}`.
struct ScriptedChannel {
    id: String,
    script: String,
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl NotificationChannel for ScriptedChannel {
    async fn send(&self, message: &RenderedMessage) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.id, message.event.id));
        match self.script.as_str() {
            "ok" => Ok(()),
            "hang" => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
            _ => Err(NotifyError::ApiError {
                service: "scripted".into(),
                status: 503,
                body: "unavailable".into(),
            }),
        }
    }

    fn channel_type(&self) -> &str {
        "webhook"
    }

    fn instance_id(&self) -> &str {
        &self.id
    }
}

struct ScriptedPlugin {
    calls: Arc<Mutex<Vec<String>>>,
}

impl ChannelPlugin for ScriptedPlugin {
    fn name(&self) -> &str {
        "webhook"
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        match config.get("script").and_then(Value::as_str) {
            Some(_) => Ok(()),
            None => Err(NotifyError::InvalidConfig("script missing".into())),
        }
    }

    fn create_channel(&self, instance_id: &str, config: &Value) -> Result<Box<dyn NotificationChannel>> {
        Ok(Box::new(ScriptedChannel {
            id: instance_id.to_string(),
            script: config["script"].as_str().unwrap_or("ok").to_string(),
            calls: self.calls.clone(),
        }))
    }
}

fn channel(name: &str, config: Value, enabled: bool) -> ChannelRecord {
    ChannelRecord {
        id: format!("id-{name}"),
        name: name.to_string(),
        channel_type: ChannelType::Webhook,
        config,
        enabled,
    }
}

fn script(s: &str) -> Value {
    serde_json::json!({ "script": s })
}

async fn setup(records: Vec<ChannelRecord>) -> (Arc<MemoryStore>, Dispatcher, Arc<Mutex<Vec<String>>>, AlertEvent) {
    let store = Arc::new(MemoryStore::new());
    for record in &records {
        store.upsert_channel(record).await.unwrap();
    }
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ChannelRegistry::default();
    registry.register(Box::new(ScriptedPlugin {
        calls: calls.clone(),
    }));
    let dispatcher = Dispatcher::new(
        store.clone(),
        store.clone(),
        registry,
        Duration::from_millis(100),
    )
    .with_write_retry(RetryPolicy {
        attempts: 3,
        backoff: Duration::from_millis(1),
    });

    let event = AlertEvent::firing(
        "cpu",
        "High CPU",
        Severity::Critical,
        "cpu_percent 97 > 85 on node-a",
        Value::Null,
        Some("node-a".into()),
        Utc::now(),
    );
    store.insert_event(&event).await.unwrap();
    (store, dispatcher, calls, event)
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn one_failing_channel_does_not_stop_the_others() {
    let (store, dispatcher, calls, event) = setup(vec![
        channel("ops", script("ok"), true),
        channel("pager", script("fail"), true),
        channel("audit", script("ok"), true),
    ])
    .await;

    let results = dispatcher
        .dispatch(&event, &names(&["ops", "pager", "audit"]))
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(calls.lock().unwrap().len(), 3);
    let pager = results.iter().find(|r| r.channel == "pager").unwrap();
    assert!(!pager.success);
    assert!(pager.error.as_deref().unwrap().contains("status=503"));
    assert_eq!(results.iter().filter(|r| r.success).count(), 2);

    let stored = store.get_event(&event.id).await.unwrap().unwrap();
    assert!(stored.notified);
}

#[tokio::test]
async fn notified_even_when_every_channel_fails() {
    let (store, dispatcher, _calls, event) = setup(vec![
        channel("a", script("fail"), true),
        channel("b", script("fail"), true),
    ])
    .await;

    let results = dispatcher.dispatch(&event, &names(&["a", "b"])).await;
    assert!(results.iter().all(|r| !r.success));
    assert!(store.get_event(&event.id).await.unwrap().unwrap().notified);
}

#[tokio::test]
async fn disabled_and_unknown_channels_are_skipped() {
    let (_store, dispatcher, calls, event) = setup(vec![
        channel("ops", script("ok"), true),
        channel("old", script("ok"), false),
    ])
    .await;

    let results = dispatcher
        .dispatch(&event, &names(&["ops", "old", "missing"]))
        .await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].channel, "ops");
    assert_eq!(*calls.lock().unwrap(), vec![format!("id-ops:{}", event.id)]);
}

#[tokio::test]
async fn channels_match_by_id_and_are_deduplicated() {
    let (_store, dispatcher, calls, event) = setup(vec![channel("ops", script("ok"), true)]).await;

    let results = dispatcher.dispatch(&event, &names(&["ops", "id-ops"])).await;
    assert_eq!(results.len(), 1);
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn timeout_is_a_failed_result() {
    let (store, dispatcher, _calls, event) = setup(vec![
        channel("slow", script("hang"), true),
        channel("fast", script("ok"), true),
    ])
    .await;

    let started = std::time::Instant::now();
    let results = dispatcher.dispatch(&event, &names(&["slow", "fast"])).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let slow = results.iter().find(|r| r.channel == "slow").unwrap();
    assert!(!slow.success);
    assert!(slow.error.as_deref().unwrap().contains("timed out"));
    assert!(results.iter().find(|r| r.channel == "fast").unwrap().success);
    assert!(store.get_event(&event.id).await.unwrap().unwrap().notified);
}

#[tokio::test]
async fn invalid_config_fails_fast_without_sending() {
    let mut email = channel("mail", serde_json::json!({ "smtp_host": "" }), true);
    email.channel_type = ChannelType::Email;
    let (_store, dispatcher, calls, event) =
        setup(vec![email, channel("ops", serde_json::json!({}), true)]).await;

    let results = dispatcher.dispatch(&event, &names(&["mail", "ops"])).await;
    assert_eq!(results.len(), 2);
    for result in &results {
        assert!(!result.success);
        assert!(
            result
                .error
                .as_deref()
                .unwrap()
                .contains("invalid channel configuration"),
            "error was: {:?}",
            result.error
        );
    }
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn mark_notified_survives_transient_write_failures() {
    let (store, dispatcher, _calls, event) = setup(vec![channel("ops", script("ok"), true)]).await;
    store.fail_next_writes(2);

    dispatcher.dispatch(&event, &names(&["ops"])).await;
    assert!(store.get_event(&event.id).await.unwrap().unwrap().notified);
}
