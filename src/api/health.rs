use crate::bus::VIDEO_QUEUE;
use crate::AppState;
use axum::{extract::State, response::Json, routing::get, Router};
use sea_orm::{ConnectionTrait, Statement};
use serde_json::Value;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/health", get(health_check))
}

/// Liveness plus dependency checks on the store and the bus.
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let mut status = "healthy";

    let db_check = state
        .db
        .execute(Statement::from_string(
            state.db.get_database_backend(),
            "SELECT 1",
        ))
        .await;
    let database = match db_check {
        Ok(_) => "ok".to_string(),
        Err(e) => {
            status = "unhealthy";
            format!("error: {e}")
        }
    };

    let bus = match state.bus.depth(VIDEO_QUEUE).await {
        Ok(_) => "ok".to_string(),
        Err(e) => {
            status = "unhealthy";
            format!("error: {e}")
        }
    };

    Json(serde_json::json!({
        "status": status,
        "database": database,
        "bus": bus,
    }))
}
