use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        match error {
            ApplicationError::Domain(err) => {
                ApiError::new(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", err.to_string())
            }
            ApplicationError::Repository(err) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
                format!("storage error: {}", err),
            ),
            ApplicationError::HubUnavailable => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "HUB_UNAVAILABLE",
                "message hub is not running",
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::DomainError;

    #[test]
    fn maps_application_errors_to_status() {
        let invalid: ApiError =
            ApplicationError::from(DomainError::invalid_argument("deviceId", "must not be empty"))
                .into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let hub: ApiError = ApplicationError::HubUnavailable.into();
        assert_eq!(hub.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
