use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};

async fn health_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app() -> Router {
    Router::new()
        .route("/health/live", get(health_probe))
        .route("/health/ready", get(health_probe))
}
