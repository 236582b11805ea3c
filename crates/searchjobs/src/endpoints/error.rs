use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use searchjobs_service::caching::StoreError;
use searchjobs_service::durable::DurableError;
use searchjobs_service::services::SearchError;
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<SearchError> for ResponseError {
    fn from(err: SearchError) -> Self {
        let status = match err {
            SearchError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            SearchError::TooManySearches => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            err: err.into(),
        }
    }
}

impl From<StoreError> for ResponseError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            err: err.into(),
        }
    }
}

impl From<DurableError> for ResponseError {
    fn from(err: DurableError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
        }
    }
}

impl From<anyhow::Error> for ResponseError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };

        ApiErrorResponse { detail, causes }
    }
}
