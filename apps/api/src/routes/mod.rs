pub mod apply;
pub mod health;
pub mod jobs;
pub mod rankings;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Job lifecycle (operator-facing)
        .route("/api/v1/jobs", post(jobs::handle_create_job))
        .route(
            "/api/v1/jobs/:id",
            get(jobs::handle_get_job).patch(jobs::handle_update_job),
        )
        // Public apply page
        .route("/api/v1/jobs/:id/apply", post(apply::handle_apply))
        // Quota administration and screening
        .route(
            "/api/v1/jobs/:id/quota/reset",
            post(jobs::handle_reset_quota),
        )
        .route(
            "/api/v1/jobs/:id/screen",
            post(jobs::handle_trigger_screening),
        )
        // Operator views
        .route("/api/v1/jobs/:id/rankings", get(rankings::handle_rankings))
        .route("/api/v1/jobs/:id/dashboard", get(jobs::handle_dashboard))
        .with_state(state)
}
