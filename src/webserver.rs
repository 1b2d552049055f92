use crate::state::HealthState;
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

pub async fn readiness_probe(State(health): State<HealthState>) -> impl IntoResponse {
    if health.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app(health: HealthState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .with_state(health)
}
