pub mod health;
pub mod scaling;
pub mod videos;

use crate::AppState;
use axum::Router;

pub fn create_router() -> Router<AppState> {
    Router::new()
        // Health check route (no auth required)
        .merge(health::routes())
        .nest("/api", videos::routes())
        .nest("/api/billing", crate::billing::handlers::routes())
        .nest("/api/scaling", scaling::routes())
}
