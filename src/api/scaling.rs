use crate::scaling::controller::SCALING_HISTORY_KEY;
use crate::scaling::monitor::{CURRENT_METRICS_KEY, METRICS_HISTORY_KEY};
use crate::AppState;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::Value;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/history", get(get_scaling_history))
        .route("/metrics", get(get_metrics_history))
        .route("/stats", get(get_stats))
}

/// Bounded scaling-event history for operators (newest first).
async fn get_scaling_history(State(state): State<AppState>) -> Json<Value> {
    let events: Vec<Value> = state.kv.list_entries(SCALING_HISTORY_KEY).await;
    Json(serde_json::json!({
        "events": events,
        "count": events.len(),
    }))
}

async fn get_metrics_history(State(state): State<AppState>) -> Json<Value> {
    let samples: Vec<Value> = state.kv.list_entries(METRICS_HISTORY_KEY).await;
    Json(serde_json::json!({
        "samples": samples,
        "count": samples.len(),
    }))
}

/// Control-plane snapshot: job statistics, current metrics and cluster
/// capacity.
async fn get_stats(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let stats = state.job_manager.statistics().await.map_err(|e| {
        tracing::error!("Failed to get job statistics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let current_metrics = state.kv.get(CURRENT_METRICS_KEY).await;

    Ok(Json(serde_json::json!({
        "jobs": stats,
        "current_metrics": current_metrics,
        "system": {
            "timestamp": chrono::Utc::now().timestamp_micros(),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })))
}
