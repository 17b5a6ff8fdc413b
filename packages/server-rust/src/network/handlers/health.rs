//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose server and coordinator health for orchestrators
//! (Kubernetes, load balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Returns detailed health information as JSON.
///
/// Always returns 200 -- the `state` and `coordinator` fields indicate whether
/// the server can actually provision.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.shutdown.health_state();
    let coordinator = &state.backend.coordinator;

    Json(json!({
        "state": health.as_str(),
        "coordinator": {
            "state": coordinator.state().as_str(),
            "restarts": coordinator.restarts(),
            "processed": coordinator.processed(),
        },
        "pending_completions": state.backend.pending.len(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Kubernetes liveness check -- always returns 200 OK.
///
/// A failed liveness check triggers a pod restart, so this never looks at
/// the coordinator or the store.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness check -- 200 only when the server is Ready and the
/// coordinator is running.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready
        && state.backend.coordinator.is_running()
    {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
