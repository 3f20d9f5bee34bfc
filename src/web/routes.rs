use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - REST API for programmatic access
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // The agent itself
            .route("/expert-sql", post(handlers::api::expert_sql))
            // Introspection
            .route("/status", get(handlers::api::system_status))
            .route("/catalog", get(handlers::api::catalog_info)),
    )
}
