use axum::extract;
use axum::Json;
use searchjobs_service::jobs::{StartResponse, StatusResponse};
use searchjobs_service::services::SearchService;
use serde::Deserialize;

use crate::endpoints::ResponseError;

/// The body of a search request.
#[derive(Debug, Deserialize)]
pub struct SearchRequestBody {
    pub query: String,
    /// Discard a cached result and compute the search anew.
    #[serde(default)]
    pub force_refresh: bool,
}

pub async fn start_search(
    extract::State(service): extract::State<SearchService>,
    extract::Json(body): extract::Json<SearchRequestBody>,
) -> Result<Json<StartResponse>, ResponseError> {
    let response = service.start(&body.query, body.force_refresh).await?;
    Ok(Json(response))
}

pub async fn search_status(
    extract::State(service): extract::State<SearchService>,
    extract::Path(task_id): extract::Path<String>,
) -> Result<Json<StatusResponse>, ResponseError> {
    let response = service.status(&task_id).await?;
    Ok(Json(response))
}
