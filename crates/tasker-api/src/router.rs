//! Route table.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/invocations", post(handlers::invoke))
        .route("/api/executions/{execution_id}/latest", get(handlers::latest_invocation))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
