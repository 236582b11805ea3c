use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use searchjobs_service::metric;
use searchjobs_service::services::SearchService;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

mod cache;
mod error;
mod history;
mod metrics;
mod search;

pub use error::ResponseError;
use metrics::MetricsLayer;

use cache::{clear_cache, invalidate};
use history::{recent_history, user_history};
use search::{search_status, start_search};

pub async fn health() -> Json<Value> {
    metric!(counter("healthcheck") += 1);
    Json(json!({ "status": "healthy" }))
}

pub fn create_app(service: SearchService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer)
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(64 * 1024));
    Router::new()
        .route("/search", post(start_search))
        .route("/search/status/:task_id", get(search_status))
        .route("/cache/clear", post(clear_cache))
        .route("/cache/invalidate/:task_id", post(invalidate))
        .route("/history", get(recent_history))
        .route("/history/:user_id", get(user_history))
        .with_state(service)
        .layer(layer)
        // the health check is last, as it will bypass all the middlewares
        .route("/health", get(health))
}
