mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::{
    assert_err_envelope, assert_ok_envelope, build_test_context, build_test_context_with,
    request_json, request_no_body,
};
use mailmon_common::types::{RemediationTarget, RuleRecord, Severity, TargetStatus};
use mailmon_storage::{RuleStore, TargetStore};
use serde_json::{json, Value};

fn rule(id: &str, condition: &str) -> RuleRecord {
    RuleRecord {
        id: id.to_string(),
        name: format!("rule {id}"),
        severity: Severity::Critical,
        condition: condition.to_string(),
        duration_secs: 0,
        cooldown_secs: 600,
        channels: vec![],
        entity_pattern: "*".to_string(),
        enabled: true,
    }
}

fn status_of<'a>(body: &'a Value, rule_id: &str) -> &'a Value {
    body["data"]["rules"]
        .as_array()
        .expect("rules should be an array")
        .iter()
        .find(|r| r["rule_id"] == rule_id)
        .unwrap_or_else(|| panic!("rule {rule_id} missing from status"))
}

#[tokio::test]
async fn health_should_return_ok_envelope() {
    let ctx = build_test_context().expect("test context should build");
    let (status, body, trace) = request_no_body(&ctx.app, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_ok_envelope(&body);
    assert_eq!(body["data"]["storage_status"], "ok");
    assert!(body["data"]["version"].is_string());
    assert!(body["data"]["last_pass_at"].is_null());

    let trace = trace.expect("X-Trace-Id header should be set");
    assert_eq!(trace.len(), 16);
    assert_eq!(body["trace_id"], trace.as_str());
}

#[tokio::test]
async fn snapshot_ingest_writes_batch() {
    let ctx = build_test_context().expect("test context should build");
    let (status, body, _) = request_json(
        &ctx.app,
        "POST",
        "/v1/snapshots",
        json!({
            "snapshots": [
                { "entity_id": "node-a", "source": "node", "metric": "cpu_percent", "value": 42.0 },
                { "entity_id": "mta-1", "source": "mta", "metric": "queue_size", "value": 12.0,
                  "timestamp": Utc::now().to_rfc3339() }
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ok_envelope(&body);
    assert_eq!(body["data"]["written"], 2);
}

#[tokio::test]
async fn snapshot_ingest_rejects_empty_and_incomplete_batches() {
    let ctx = build_test_context().expect("test context should build");

    let (status, body, _) =
        request_json(&ctx.app, "POST", "/v1/snapshots", json!({ "snapshots": [] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_err_envelope(&body, 1104);

    let (status, body, _) = request_json(
        &ctx.app,
        "POST",
        "/v1/snapshots",
        json!({ "snapshots": [
            { "entity_id": " ", "source": "node", "metric": "cpu_percent", "value": 1.0 }
        ] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_err_envelope(&body, 1001);
}

#[tokio::test]
async fn rules_status_distinguishes_firing_healthy_and_misconfigured() {
    let ctx = build_test_context().expect("test context should build");
    ctx.store.upsert_rule(&rule("cpu", "cpu_percent > 85")).await.unwrap();
    ctx.store.upsert_rule(&rule("queue", "mta:queue_size > 5000")).await.unwrap();
    ctx.store.upsert_rule(&rule("bad", "users > 1")).await.unwrap();

    let (status, _, _) = request_json(
        &ctx.app,
        "POST",
        "/v1/snapshots",
        json!({ "snapshots": [
            { "entity_id": "node-a", "source": "node", "metric": "cpu_percent", "value": 97.0 }
        ] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let mut live = ctx.state.publisher.subscribe();
    let report = ctx
        .scheduler
        .run_once(Utc::now())
        .await
        .expect("pass should run");
    assert_eq!(report.rules.len(), 3);

    let (status, body, _) = request_no_body(&ctx.app, "GET", "/v1/rules/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_ok_envelope(&body);
    assert!(body["data"]["last_pass_at"].is_string());

    let cpu = status_of(&body, "cpu");
    assert_eq!(cpu["status"], "firing");
    assert_eq!(cpu["firing"], true);
    assert_eq!(status_of(&body, "queue")["status"], "healthy");
    let bad = status_of(&body, "bad");
    assert_eq!(bad["status"], "misconfigured");
    assert!(bad["detail"].as_str().unwrap().contains("users"));

    let message = live.try_recv().expect("fired event should be published");
    assert_eq!(message.topic, "alerts.fired");

    let (status, body, _) = request_no_body(&ctx.app, "GET", "/v1/alerts/active").await;
    assert_eq!(status, StatusCode::OK);
    let events = body["data"].as_array().expect("events should be an array");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["rule_id"], "cpu");
    assert_eq!(events[0]["status"], "firing");
    assert_eq!(events[0]["node_id"], "node-a");
    assert_eq!(events[0]["notified"], true);
}

#[tokio::test]
async fn observations_pause_target_after_consecutive_adverse_results() {
    let ctx = build_test_context().expect("test context should build");
    let t0 = Utc::now() - Duration::minutes(10);
    ctx.store
        .upsert_target(&RemediationTarget {
            id: "ip-10".to_string(),
            status: TargetStatus::Active,
            notes: String::new(),
            updated_at: t0,
        })
        .await
        .unwrap();

    let observe = |adverse: bool, minutes: i64, tier: &str| {
        json!({
            "target_id": "ip-10",
            "source": "spamhaus-zen",
            "tier": tier,
            "adverse": adverse,
            "timestamp": (t0 + Duration::minutes(minutes)).to_rfc3339(),
        })
    };

    let (status, body, _) =
        request_json(&ctx.app, "POST", "/v1/observations", observe(true, 1, "critical")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["action"], "insufficient_history");

    let (_, body, _) =
        request_json(&ctx.app, "POST", "/v1/observations", observe(true, 2, "critical")).await;
    assert_eq!(body["data"]["action"], "paused");
    assert!(body["data"]["event_id"].is_string());

    let target = ctx.store.get_target("ip-10").await.unwrap().unwrap();
    assert_eq!(target.status, TargetStatus::Paused);
    assert!(target.notes.contains("[auto-pause:auto-remediator:spamhaus-zen]"));

    let (_, body, _) =
        request_json(&ctx.app, "POST", "/v1/observations", observe(false, 3, "high")).await;
    assert_eq!(body["data"]["action"], "advisory");

    let (_, body, _) = request_no_body(&ctx.app, "GET", "/v1/alerts/active?limit=10").await;
    let events = body["data"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["rule_id"], "remediation:spamhaus-zen");
}

#[tokio::test]
async fn observations_require_target_source_and_tier() {
    let ctx = build_test_context().expect("test context should build");
    let (status, body, _) = request_json(
        &ctx.app,
        "POST",
        "/v1/observations",
        json!({ "target_id": "", "source": "s", "tier": "critical", "adverse": true }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_err_envelope(&body, 1001);
}

#[tokio::test]
async fn observations_are_only_recorded_when_remediation_is_disabled() {
    let ctx = build_test_context_with(|c| c.remediation.enabled = false)
        .expect("test context should build");
    assert!(ctx.state.remediator.is_none());

    let (status, body, _) = request_json(
        &ctx.app,
        "POST",
        "/v1/observations",
        json!({ "target_id": "ip-1", "source": "s", "tier": "critical", "adverse": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["action"], "recorded");
}
