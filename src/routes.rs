use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::engine::{SharedStatus, StopHandle};
use crate::utils::round2;

#[derive(Clone)]
pub struct ControlState {
    pub status: SharedStatus,
    pub stop: StopHandle,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/stop", post(stop_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /status
pub async fn status_handler(State(state): State<ControlState>) -> impl IntoResponse {
    let status = state.status.read().await.clone();
    let perf = &status.performance;
    let state_name = if status.halted.is_some() {
        "halted"
    } else if status.stopped {
        "stopped"
    } else {
        "running"
    };
    (
        StatusCode::OK,
        Json(json!({
            "status": state_name,
            "mode": status.mode,
            "passes": status.passes,
            "halted": status.halted,
            "min_profit_threshold": status.min_profit_threshold,
            "failed_pairs": status.failed_pairs,
            "account": status.account,
            "last_trade": status.last_trade,
            "performance": {
                "total_trades": perf.total_trades,
                "profitable_trades": perf.profitable_trades,
                "loss_trades": perf.loss_trades,
                "win_rate": round2(perf.win_rate() * 100.0),
                "total_profit": perf.total_profit,
            },
        })),
    )
}

/// POST /stop; the engine finishes its current pass first.
pub async fn stop_handler(State(state): State<ControlState>) -> impl IntoResponse {
    state.stop.stop();
    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "stopping"})),
    )
}
