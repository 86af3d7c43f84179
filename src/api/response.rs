//! `{data, error}` response envelope and error conversion.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::CoreError;

/// Error body nested under `error`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
}

impl From<&CoreError> for ErrorBody {
    fn from(e: &CoreError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            field: e.field(),
        }
    }
}

pub fn status_of(e: &CoreError) -> StatusCode {
    match e {
        CoreError::Validation { .. } | CoreError::InvalidCronExpression { .. } => {
            StatusCode::BAD_REQUEST
        }
        CoreError::NotFound { .. } | CoreError::ProviderNotFound(_) => StatusCode::NOT_FOUND,
        CoreError::ProviderBusy { .. } => StatusCode::CONFLICT,
        CoreError::ProviderTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        CoreError::ProviderFailure { .. } => StatusCode::BAD_GATEWAY,
        CoreError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handler error; renders as `{"data": null, "error": {...}}`.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self(CoreError::validation("body", e.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self(CoreError::validation("query", e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_of(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = json!({ "data": null, "error": ErrorBody::from(&self.0) });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult = Result<Response, ApiError>;

pub fn ok<T: Serialize>(data: T) -> Response {
    with_status(StatusCode::OK, data)
}

pub fn with_status<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(json!({ "data": data, "error": null }))).into_response()
}

pub fn with_meta<T: Serialize>(data: T, meta: Value) -> Response {
    Json(json!({ "data": data, "error": null, "meta": meta })).into_response()
}

/// Run a blocking storage call off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let out = tokio::task::spawn_blocking(f).await.map_err(CoreError::from)??;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(&CoreError::validation("name", "empty")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(&CoreError::not_found("schedule", "x")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(&CoreError::ProviderBusy { key: "iperf3".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(&CoreError::Persistence("disk full".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_body_omits_missing_field() {
        let body = serde_json::to_value(ErrorBody::from(&CoreError::not_found("schedule", "x"))).unwrap();
        assert_eq!(body["kind"], "not_found");
        assert!(body.get("field").is_none());
    }
}
