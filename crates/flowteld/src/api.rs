//! HTTP API for operators and switches.
//!
//! Read-only views (health, metrics, statistics, flows, alerts, sessions)
//! plus the switch registration handshake and policy updates.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use flowtel_collector::{
    CollectorStatistics, DigestConsumer, HealthStatus, ProtocolShare, TopFlow,
};
use flowtel_common::{FlowId, PolicyConfig};
use flowtel_rulemgr::{FlowRuleManager, RegistrationRequest, RuleManagerError, SessionState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

const DEFAULT_FLOW_LIMIT: usize = 100;
const DEFAULT_ALERT_LIMIT: usize = 50;
const TOP_FLOWS: usize = 10;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub consumer: Arc<DigestConsumer>,
    pub manager: Arc<FlowRuleManager>,
}

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn manager_error(e: &RuleManagerError) -> Response {
    let status = match e {
        RuleManagerError::InvalidRequest { .. } | RuleManagerError::Policy(_) => {
            StatusCode::BAD_REQUEST
        }
        RuleManagerError::UnknownSwitch(_) => StatusCode::NOT_FOUND,
        RuleManagerError::Session(_) => StatusCode::CONFLICT,
        RuleManagerError::Channel { .. } => StatusCode::BAD_GATEWAY,
        RuleManagerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

/// Builds the API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        .route("/flows", get(list_flows))
        .route("/flows/{switch_id}/{flow_id}", get(get_flow))
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}/ack", post(acknowledge_alert))
        .route("/switches", get(list_switches))
        .route("/switches/register", post(register_switch))
        .route("/switches/{switch_id}/heartbeat", post(switch_heartbeat))
        .route("/switches/{switch_id}", delete(deregister_switch))
        .route("/policy", get(get_policy).put(put_policy))
        .with_state(state)
}

fn state_counts(manager: &FlowRuleManager) -> BTreeMap<SessionState, usize> {
    let mut counts = manager.state_counts();
    for state in SessionState::ALL {
        counts.entry(state).or_insert(0);
    }
    counts
}

fn switches_connected(counts: &BTreeMap<SessionState, usize>) -> usize {
    counts
        .iter()
        .filter(|(state, _)| state.is_live())
        .map(|(_, n)| n)
        .sum()
}

#[derive(Serialize)]
struct HealthView {
    status: HealthStatus,
    buffer_depth: usize,
    buffer_capacity: usize,
    attached_sessions: usize,
    switches: BTreeMap<SessionState, usize>,
}

/// GET /health
async fn health(State(state): State<AppState>) -> Response {
    let status = state.consumer.health_status();
    let buffer = state.consumer.buffer();
    let view = HealthView {
        status,
        buffer_depth: buffer.len(),
        buffer_capacity: buffer.capacity(),
        attached_sessions: state.consumer.attached_sessions(),
        switches: state_counts(&state.manager),
    };
    let code = match status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, ApiResponse::ok(view)).into_response()
}

/// GET /metrics
async fn metrics(State(state): State<AppState>) -> Response {
    let metrics = state.consumer.metrics();
    for (session_state, count) in state_counts(&state.manager) {
        metrics.set_switch_sessions(session_state.as_str(), count);
    }
    metrics.set_buffer_depth(state.consumer.buffer().len());
    metrics.set_active_flows(state.consumer.registry().active_count());
    metrics.set_health_status(state.consumer.health_status());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.gather_metrics(),
    )
        .into_response()
}

#[derive(Serialize)]
struct StatsView {
    #[serde(flatten)]
    totals: CollectorStatistics,
    switches_connected: usize,
    protocol_distribution: Vec<ProtocolShare>,
    top_flows: Vec<TopFlow>,
}

/// GET /stats
async fn stats(State(state): State<AppState>) -> Response {
    let view = StatsView {
        totals: state.consumer.statistics(),
        switches_connected: switches_connected(&state.manager.state_counts()),
        protocol_distribution: state.consumer.protocol_distribution(),
        top_flows: state.consumer.top_flows(TOP_FLOWS),
    };
    ApiResponse::ok(view).into_response()
}

#[derive(Debug, Deserialize)]
struct FlowQuery {
    limit: Option<usize>,
    #[serde(default)]
    active: bool,
}

/// GET /flows?limit=N&active=true
async fn list_flows(State(state): State<AppState>, Query(query): Query<FlowQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_FLOW_LIMIT);
    ApiResponse::ok(state.consumer.flows(limit, query.active)).into_response()
}

/// GET /flows/{switch_id}/{flow_id}
async fn get_flow(
    State(state): State<AppState>,
    Path((switch_id, flow_id)): Path<(String, u32)>,
) -> Response {
    match state.consumer.flow(&switch_id, FlowId(flow_id)) {
        Some(flow) => ApiResponse::ok(flow).into_response(),
        None => error_response("flow not found", StatusCode::NOT_FOUND),
    }
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

/// GET /alerts?limit=N
async fn list_alerts(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_ALERT_LIMIT);
    ApiResponse::ok(state.consumer.recent_alerts(limit)).into_response()
}

/// POST /alerts/{id}/ack
async fn acknowledge_alert(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    if state.consumer.acknowledge_alert(id) {
        ApiResponse::ok(id).into_response()
    } else {
        error_response("alert not found", StatusCode::NOT_FOUND)
    }
}

/// GET /switches
async fn list_switches(State(state): State<AppState>) -> Response {
    ApiResponse::ok(state.manager.sessions()).into_response()
}

/// POST /switches/register
async fn register_switch(
    State(state): State<AppState>,
    Json(request): Json<RegistrationRequest>,
) -> Response {
    match state.manager.register(request).await {
        Ok(response) => (StatusCode::CREATED, ApiResponse::ok(response)).into_response(),
        Err(e) => manager_error(&e),
    }
}

#[derive(Serialize)]
struct HeartbeatView {
    switch_id: String,
    state: SessionState,
}

/// POST /switches/{switch_id}/heartbeat
async fn switch_heartbeat(
    State(state): State<AppState>,
    Path(switch_id): Path<String>,
) -> Response {
    match state.manager.heartbeat(&switch_id).await {
        Ok(session_state) => ApiResponse::ok(HeartbeatView {
            switch_id,
            state: session_state,
        })
        .into_response(),
        Err(e) => manager_error(&e),
    }
}

/// DELETE /switches/{switch_id}
async fn deregister_switch(
    State(state): State<AppState>,
    Path(switch_id): Path<String>,
) -> Response {
    match state.manager.deregister(&switch_id).await {
        Ok(()) => {
            state.consumer.detach(&switch_id);
            ApiResponse::ok(switch_id).into_response()
        }
        Err(e) => manager_error(&e),
    }
}

/// GET /policy
async fn get_policy(State(state): State<AppState>) -> Response {
    ApiResponse::ok(state.manager.desired_policy()).into_response()
}

/// PUT /policy
async fn put_policy(State(state): State<AppState>, Json(policy): Json<PolicyConfig>) -> Response {
    if let Err(e) = state.manager.update_policy(policy.clone()) {
        return manager_error(&e);
    }
    if let Err(e) = state.consumer.apply_policy(&policy) {
        // Validated above, so the two views cannot diverge here.
        warn!(error = %e, "Collector rejected policy accepted by the manager");
        return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    ApiResponse::ok(policy).into_response()
}
