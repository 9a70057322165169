pub mod admission;
mod handlers;
pub mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use self::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/mutate", post(handlers::mutate_handler))
        .route("/health", get(handlers::health_handler))
        .route("/ready", get(handlers::ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
}
