//! Incoming HTTP surface: `/health`, `/metrics`, `/alerts`, `/circuit-breakers`.
//!
//! Follows the teacher's `health_handler` pattern (axum `State` extractor,
//! `Json`/`StatusCode` response pair, `serde_json::json!` bodies) generalized
//! from a single counter to the orchestrator's per-source state.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::circuit_breaker::CircuitState;
use crate::health::AlertSeverity;
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/alerts", get(alerts_handler))
        .route("/alerts/:id/resolve", post(resolve_alert_handler))
        .route("/circuit-breakers", get(circuit_breakers_handler))
        .route("/aligned-data", get(aligned_data_handler))
        .with_state(state)
}

fn circuit_state_label(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}

/// `GET /health` — liveness plus a coarse rollup, mirroring the teacher's
/// "ok vs degraded" shape but derived from circuit-breaker state rather than
/// a single consecutive-error counter.
async fn health_handler(State(state): State<ApiState>) -> (StatusCode, Json<serde_json::Value>) {
    let breakers = state.orchestrator.circuit_breaker_states().await;
    let open_count = breakers.values().filter(|s| **s == CircuitState::Open).count();

    let status = if open_count == 0 {
        "ok"
    } else if open_count < breakers.len() {
        "degraded"
    } else {
        "critical"
    };
    let http_status = if open_count == 0 {
        StatusCode::OK
    } else if open_count < breakers.len() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(json!({
            "service": "collection-alignment-engine",
            "status": status,
            "sources_tracked": breakers.len(),
            "circuits_open": open_count,
        })),
    )
}

/// `GET /metrics` — per-source health, circuit-breaker state, and active
/// recovery plans, for the operator dashboard spec.md §6 names.
async fn metrics_handler(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let health = state.orchestrator.health_snapshot().await;
    let breakers = state.orchestrator.circuit_breaker_states().await;
    let recovering = state.orchestrator.active_recovery_sources().await;
    let alert_count = state.orchestrator.alert_manager().list_active(None, None).await.len();

    let sources: serde_json::Map<String, serde_json::Value> = health
        .iter()
        .map(|(source, metrics)| {
            let circuit = breakers
                .get(source)
                .map(|s| circuit_state_label(*s))
                .unwrap_or("unknown");
            (
                source.clone(),
                json!({
                    "success_rate": metrics.success_rate,
                    "confidence_score": metrics.confidence_score,
                    "gap_hours": metrics.gap_hours,
                    "consecutive_failures": metrics.consecutive_failures,
                    "circuit_state": circuit,
                    "recovering": recovering.contains(source),
                }),
            )
        })
        .collect();

    Json(json!({
        "sources": sources,
        "active_alert_count": alert_count,
    }))
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    source: Option<String>,
    severity: Option<String>,
}

fn parse_severity(raw: &str) -> Option<AlertSeverity> {
    match raw.to_ascii_lowercase().as_str() {
        "info" => Some(AlertSeverity::Info),
        "warning" => Some(AlertSeverity::Warning),
        "critical" => Some(AlertSeverity::Critical),
        _ => None,
    }
}

/// `GET /alerts?source=..&severity=..` — active alerts, optionally filtered.
async fn alerts_handler(
    State(state): State<ApiState>,
    Query(query): Query<AlertQuery>,
) -> Json<serde_json::Value> {
    let severity = query.severity.as_deref().and_then(parse_severity);
    let alerts = state
        .orchestrator
        .alert_manager()
        .list_active(query.source.as_deref(), severity)
        .await;

    Json(json!({ "alerts": alerts }))
}

/// `POST /alerts/:id/resolve` — manual resolution, e.g. after an operator
/// acts on an `AlertManualIntervention` recovery action.
async fn resolve_alert_handler(
    State(state): State<ApiState>,
    axum::extract::Path(id): axum::extract::Path<Uuid>,
) -> (StatusCode, Json<serde_json::Value>) {
    let resolved = state
        .orchestrator
        .alert_manager()
        .resolve(id, "resolved via API")
        .await;

    if resolved {
        (StatusCode::OK, Json(json!({ "resolved": true })))
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "resolved": false })))
    }
}

#[derive(Debug, Deserialize)]
struct AlignedDataQuery {
    sources: String,
    max_age_s: f64,
    window_s: f64,
}

/// `GET /aligned-data?sources=a,b&max_age_s=60&window_s=180` — spec.md
/// §6's time-aligned data API: the best cross-source alignment within
/// `window_s`, or `null` if any source is missing or the alignment is
/// older than `max_age_s`.
async fn aligned_data_handler(
    State(state): State<ApiState>,
    Query(query): Query<AlignedDataQuery>,
) -> Json<serde_json::Value> {
    let sources: Vec<String> = query.sources.split(',').map(|s| s.trim().to_string()).collect();
    let aligned = state
        .orchestrator
        .get_time_aligned_data(&sources, query.max_age_s, query.window_s)
        .await;

    Json(json!({ "data": aligned }))
}

/// `GET /circuit-breakers` — raw per-source circuit state.
async fn circuit_breakers_handler(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let breakers = state.orchestrator.circuit_breaker_states().await;
    let labeled: serde_json::Map<String, serde_json::Value> = breakers
        .into_iter()
        .map(|(source, circuit_state)| (source, json!(circuit_state_label(circuit_state))))
        .collect();

    Json(json!({ "circuit_breakers": labeled }))
}
