use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use mcp_aggregator_core::health::{detailed_health, DetailLevel};

use crate::App;

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .with_state(app)
}

async fn live() -> impl IntoResponse {
    StatusCode::OK
}

async fn ready(State(app): State<Arc<App>>) -> impl IntoResponse {
    if app.config_loaded.load(std::sync::atomic::Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn health(State(app): State<Arc<App>>) -> impl IntoResponse {
    let summary = app.upstreams.summary().await;
    let statuses = app.upstreams.statuses().await;
    let level = DetailLevel::parse(&app.health_info_level);
    let report = detailed_health(
        app.config_loaded.load(std::sync::atomic::Ordering::Relaxed),
        &summary,
        &statuses,
        level,
    );
    Json(report)
}
