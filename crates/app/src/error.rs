use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pdf_rag_core::SearchError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to bind listener on {address}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error")]
    Server(#[source] std::io::Error),

    /// Body could not be read as the expected JSON; keeps the rejection's status.
    #[error("{message}")]
    BadRequest { status: StatusCode, message: String },

    #[error("internal server error")]
    Pipeline(#[from] SearchError),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest { status, .. } => *status,
            AppError::Bind { .. } | AppError::Server(_) | AppError::Pipeline(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::Bind { .. } => "BIND_ERROR",
            AppError::Server(_) => "SERVER_ERROR",
            AppError::BadRequest { status, .. } if *status == StatusCode::UNPROCESSABLE_ENTITY => {
                "UNPROCESSABLE_ENTITY"
            }
            AppError::BadRequest { status, .. } if *status == StatusCode::UNSUPPORTED_MEDIA_TYPE => {
                "UNSUPPORTED_MEDIA_TYPE"
            }
            AppError::BadRequest { .. } => "BAD_REQUEST",
            AppError::Pipeline(_) => "INTERNAL_ERROR",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Pipeline(source) = &self {
            error!(error = %source, "question pipeline failed");
        }

        let status = self.status_code();
        let body = ErrorBody {
            error: self.error_code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}
