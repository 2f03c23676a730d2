use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

use crate::credential::CredentialError;
use crate::moderation::ModerationError;
use crate::qr_login::QrError;
use crate::repo::RepoError;
use crate::storage::UploadError;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")] BadRequest(String),
    #[error("unauthorized")] Unauthorized,
    #[error("forbidden")] Forbidden,
    #[error("not found")] NotFound,
    #[error("{0}")] Conflict(String),
    #[error("payload too large")] PayloadTooLarge,
    #[error("unsupported media type")] UnsupportedMedia,
    #[error("too many requests")] TooManyRequests,
    #[error("internal error")] Internal,
    #[error("{0}")] Unavailable(String),
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ApiError::NotFound,
            RepoError::Conflict => ApiError::Conflict("conflict".into()),
            RepoError::Internal(msg) => {
                tracing::error!(error = %msg, "storage failure");
                ApiError::Internal
            }
        }
    }
}

impl From<ModerationError> for ApiError {
    fn from(e: ModerationError) -> Self {
        match e {
            ModerationError::NotFound(_) => ApiError::NotFound,
            ModerationError::InvalidTransition { .. } => ApiError::Conflict(e.to_string()),
            ModerationError::Repo(e) => e.into(),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::Cookie(_) => ApiError::BadRequest(e.to_string()),
            CredentialError::UinLocked { .. } => ApiError::Conflict(e.to_string()),
            CredentialError::NoCookieSource => ApiError::Unavailable(e.to_string()),
        }
    }
}

impl From<QrError> for ApiError {
    fn from(e: QrError) -> Self {
        ApiError::Unavailable(e.to_string())
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::TooLarge { .. } => ApiError::PayloadTooLarge,
            UploadError::Unsupported(_) => ApiError::UnsupportedMedia,
            UploadError::Io(msg) => {
                tracing::error!(error = %msg, "upload store failure");
                ApiError::Internal
            }
        }
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedMedia => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        HttpResponse::build(status).json(ApiErrorBody { error: self.to_string() })
    }
}
