use crate::logging::TraceId;
use crate::state::{AppState, RuleStatusView};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use mailmon_alert::remediation::RemediationAction;
use mailmon_common::types::{MetricSnapshot, MetricSource, Observation};
use mailmon_storage::{AlertEventStore, ObservationStore, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_ALERT_LIMIT: usize = 100;
const MAX_ALERT_LIMIT: usize = 1000;

/// Response envelope shared by every endpoint.
#[derive(Serialize)]
pub struct ApiResponse<T>
where
    T: Serialize,
{
    /// 0 on success.
    pub err_code: i32,
    pub err_msg: String,
    pub trace_id: String,
    pub data: Option<T>,
}

pub fn success_response<T>(status: StatusCode, trace_id: &str, data: T) -> Response
where
    T: Serialize,
{
    (
        status,
        Json(ApiResponse {
            err_code: 0,
            err_msg: "success".to_string(),
            trace_id: trace_id.to_string(),
            data: Some(data),
        }),
    )
        .into_response()
}

fn to_custom_error_code(code: &str) -> i32 {
    match code {
        "bad_request" => 1001,
        "not_found" => 1004,
        "empty_batch" => 1104,
        "remediation_disabled" => 1201,
        "internal_error" => 1500,
        "storage_error" => 1501,
        _ => 1999,
    }
}

pub fn error_response(status: StatusCode, trace_id: &str, code: &str, msg: &str) -> Response {
    (
        status,
        Json(ApiResponse::<Value> {
            err_code: to_custom_error_code(code),
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
            data: None,
        }),
    )
        .into_response()
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/rules/status", get(rules_status))
        .route("/v1/alerts/active", get(active_alerts))
        .route("/v1/snapshots", post(ingest_snapshots))
        .route("/v1/observations", post(ingest_observation))
        .route("/v1/live", get(live))
}

#[derive(Serialize)]
struct HealthResponse {
    version: String,
    uptime_secs: i64,
    storage_status: String,
    last_pass_at: Option<DateTime<Utc>>,
    last_pass_error: Option<String>,
}

async fn health(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if let Err(e) = state.store.ping().await {
        tracing::error!(error = %e, "Health probe failed");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &trace_id,
            "storage_error",
            &e.to_string(),
        );
    }
    success_response(
        StatusCode::OK,
        &trace_id,
        HealthResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: (Utc::now() - state.start_time).num_seconds(),
            storage_status: "ok".to_string(),
            last_pass_at: state.status.last_pass_at(),
            last_pass_error: state.status.last_error(),
        },
    )
}

#[derive(Serialize)]
struct RulesStatusResponse {
    last_pass_at: Option<DateTime<Utc>>,
    rules: Vec<RuleStatusView>,
}

async fn rules_status(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    success_response(
        StatusCode::OK,
        &trace_id,
        RulesStatusResponse {
            last_pass_at: state.status.last_pass_at(),
            rules: state.status.rules(),
        },
    )
}

#[derive(Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

async fn active_alerts(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> impl IntoResponse {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_ALERT_LIMIT)
        .clamp(1, MAX_ALERT_LIMIT);
    match state.store.list_open_events(limit).await {
        Ok(events) => success_response(StatusCode::OK, &trace_id, events),
        Err(e) => {
            tracing::error!(error = %e, "Failed to list active alerts");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &trace_id,
                "storage_error",
                &e.to_string(),
            )
        }
    }
}

#[derive(Deserialize)]
struct SnapshotIn {
    entity_id: String,
    source: MetricSource,
    metric: String,
    value: f64,
    /// Defaults to the time of receipt.
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct SnapshotBatch {
    snapshots: Vec<SnapshotIn>,
}

#[derive(Serialize)]
struct WrittenResponse {
    written: usize,
}

async fn ingest_snapshots(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Json(batch): Json<SnapshotBatch>,
) -> impl IntoResponse {
    if batch.snapshots.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            &trace_id,
            "empty_batch",
            "snapshots must not be empty",
        );
    }
    if let Some(bad) = batch
        .snapshots
        .iter()
        .find(|s| s.entity_id.trim().is_empty() || s.metric.trim().is_empty())
    {
        return error_response(
            StatusCode::BAD_REQUEST,
            &trace_id,
            "bad_request",
            &format!(
                "entity_id and metric are required (entity_id='{}', metric='{}')",
                bad.entity_id, bad.metric
            ),
        );
    }

    let now = Utc::now();
    let snapshots: Vec<MetricSnapshot> = batch
        .snapshots
        .into_iter()
        .map(|s| MetricSnapshot {
            entity_id: s.entity_id,
            source: s.source,
            metric: s.metric,
            value: s.value,
            timestamp: s.timestamp.unwrap_or(now),
        })
        .collect();

    match state.store.write_snapshots(&snapshots) {
        Ok(written) => {
            tracing::debug!(written, "Snapshots ingested");
            success_response(StatusCode::OK, &trace_id, WrittenResponse { written })
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to write snapshots");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &trace_id,
                "storage_error",
                &e.to_string(),
            )
        }
    }
}

#[derive(Deserialize)]
struct ObservationIn {
    target_id: String,
    source: String,
    tier: String,
    adverse: bool,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct ObservationResponse {
    action: &'static str,
    event_id: Option<String>,
}

impl ObservationResponse {
    fn from_action(action: &RemediationAction) -> Self {
        let (name, event_id) = match action {
            RemediationAction::Paused(event) => ("paused", Some(event.id.clone())),
            RemediationAction::Restored(event) => {
                ("restored", event.as_ref().map(|e| e.id.clone()))
            }
            RemediationAction::AlreadyPaused => ("already_paused", None),
            RemediationAction::NotOurPause => ("not_our_pause", None),
            RemediationAction::Advisory => ("advisory", None),
            RemediationAction::InsufficientHistory => ("insufficient_history", None),
            RemediationAction::Mixed => ("mixed", None),
            RemediationAction::NoChange => ("no_change", None),
            RemediationAction::UnknownTarget => ("unknown_target", None),
        };
        Self {
            action: name,
            event_id,
        }
    }
}

async fn ingest_observation(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Json(body): Json<ObservationIn>,
) -> impl IntoResponse {
    if body.target_id.trim().is_empty() || body.source.trim().is_empty() || body.tier.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            &trace_id,
            "bad_request",
            "target_id, source and tier are required",
        );
    }
    let observation = Observation {
        target_id: body.target_id,
        source: body.source,
        tier: body.tier,
        adverse: body.adverse,
        timestamp: body.timestamp.unwrap_or_else(Utc::now),
    };

    let Some(remediator) = &state.remediator else {
        // Keep history so a later enable has something to reconcile.
        return match state.store.record_observation(&observation).await {
            Ok(()) => success_response(
                StatusCode::OK,
                &trace_id,
                ObservationResponse {
                    action: "recorded",
                    event_id: None,
                },
            ),
            Err(e) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &trace_id,
                "storage_error",
                &e.to_string(),
            ),
        };
    };

    match remediator.on_observation(observation).await {
        Ok(action) => success_response(
            StatusCode::OK,
            &trace_id,
            ObservationResponse::from_action(&action),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Observation handling failed");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &trace_id,
                "storage_error",
                &e.to_string(),
            )
        }
    }
}

async fn live(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| forward_live(socket, state))
}

/// Streams live messages as JSON text frames until either side goes away.
async fn forward_live(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.publisher.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            let message = match rx.recv().await {
                Ok(message) => message,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Live subscriber lagging, messages dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize live message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
    send_task.abort();
    tracing::debug!("Live connection closed");
}
