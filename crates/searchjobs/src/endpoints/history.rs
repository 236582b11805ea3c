use axum::extract;
use axum::Json;
use searchjobs_service::durable::SearchRecord;
use searchjobs_service::services::SearchService;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::endpoints::ResponseError;

/// Query parameters of the recent history request.
#[derive(Debug, Deserialize)]
pub struct HistoryQueryParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub total_requests: usize,
    pub recent_requests: Vec<SearchRecord>,
    pub message: String,
}

impl HistoryResponse {
    fn disabled(user_id: Option<Uuid>) -> Self {
        Self {
            user_id,
            total_requests: 0,
            recent_requests: vec![],
            message: "Search history is not enabled".into(),
        }
    }
}

pub async fn recent_history(
    extract::State(service): extract::State<SearchService>,
    extract::Query(params): extract::Query<HistoryQueryParams>,
) -> Result<Json<HistoryResponse>, ResponseError> {
    let Some(sync) = service.result_sync() else {
        return Ok(Json(HistoryResponse::disabled(None)));
    };

    let records = sync.store().recent(params.limit).await?;
    let message = if records.is_empty() {
        "No search history found".to_owned()
    } else {
        format!("Found {} recent search requests", records.len())
    };

    Ok(Json(HistoryResponse {
        user_id: None,
        total_requests: records.len(),
        recent_requests: records,
        message,
    }))
}

pub async fn user_history(
    extract::State(service): extract::State<SearchService>,
    extract::Path(user_id): extract::Path<Uuid>,
) -> Result<Json<HistoryResponse>, ResponseError> {
    let Some(sync) = service.result_sync() else {
        return Ok(Json(HistoryResponse::disabled(Some(user_id))));
    };

    let records = sync.store().for_user(user_id).await?;
    let message = if records.is_empty() {
        "No completed search history found - you're a new user!".to_owned()
    } else {
        format!("Found {} search requests", records.len())
    };

    Ok(Json(HistoryResponse {
        user_id: Some(user_id),
        total_requests: records.len(),
        recent_requests: records,
        message,
    }))
}
