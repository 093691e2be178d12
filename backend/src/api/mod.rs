pub mod intelligence;

use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use intelligence::{create_intelligence_routes, AdminApiState, ApiResponse};

pub fn create_admin_router(state: Arc<AdminApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", create_intelligence_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "token-intel-backend",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
