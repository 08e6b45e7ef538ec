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

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        use application::ApplicationError as AppErr;

        match error {
            AppErr::Validation(msg) => {
                ApiError::new(StatusCode::BAD_REQUEST, "INVALID_PAYLOAD", msg)
            }
            // 权限错误不回传细节，避免泄露资源是否存在
            AppErr::PermissionDenied => {
                ApiError::new(StatusCode::FORBIDDEN, "FORBIDDEN", "forbidden")
            }
            AppErr::Infrastructure(msg) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "INFRASTRUCTURE_ERROR",
                msg,
            ),
            AppErr::PersistentData(msg) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "PERSISTENT_DATA_ERROR",
                msg,
            ),
            AppErr::LockTimeout(msg) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "LOCK_TIMEOUT", msg)
            }
            AppErr::Conflict(msg) => ApiError::new(StatusCode::CONFLICT, "CONFLICT", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
