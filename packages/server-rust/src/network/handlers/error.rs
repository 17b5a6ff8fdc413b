//! Maps provisioning errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::service::provisioning::ProvisioningError;

/// HTTP status for each error kind.
#[must_use]
pub fn status_for(err: &ProvisioningError) -> StatusCode {
    match err {
        ProvisioningError::Validation(_)
        | ProvisioningError::Decode(_)
        | ProvisioningError::Conflict { .. } => StatusCode::BAD_REQUEST,
        ProvisioningError::NotFound => StatusCode::NOT_FOUND,
        ProvisioningError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ProvisioningError::Publish(_)
        | ProvisioningError::CoordinatorDown
        | ProvisioningError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        ProvisioningError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ProvisioningError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Turns an extractor rejection into a `Decode` error.
pub(crate) fn rejected(rejection: &impl std::fmt::Display) -> ProvisioningError {
    ProvisioningError::Decode(rejection.to_string())
}
