use axum::extract;
use axum::Json;
use searchjobs_service::services::SearchService;
use serde::Serialize;

use crate::endpoints::ResponseError;

#[derive(Debug, Serialize)]
pub struct CacheResponse {
    pub message: &'static str,
}

pub async fn clear_cache(
    extract::State(service): extract::State<SearchService>,
) -> Result<Json<CacheResponse>, ResponseError> {
    service.clear().await?;
    Ok(Json(CacheResponse {
        message: "Cache cleared successfully",
    }))
}

pub async fn invalidate(
    extract::State(service): extract::State<SearchService>,
    extract::Path(task_id): extract::Path<String>,
) -> Result<Json<CacheResponse>, ResponseError> {
    service.invalidate(&task_id).await?;
    Ok(Json(CacheResponse {
        message: "Cache entry invalidated",
    }))
}
