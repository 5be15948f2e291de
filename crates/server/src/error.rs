use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// REST surface errors, rendered as OpenAI error envelopes.
#[derive(Debug, Error)]
pub enum RestError {
    /// The requested model matches no configured model or emulated alias.
    #[error("The model '{0}' does not exist")]
    ModelNotFound(String),

    /// The executor reported a failure.
    #[error("{message}")]
    Upstream {
        message: String,
        status: u16,
        error_type: &'static str,
    },
}

impl RestError {
    pub(crate) fn model_not_found(model: &str) -> Self {
        Self::ModelNotFound(model.to_string())
    }

    pub(crate) fn upstream(message: &str) -> Self {
        Self::Upstream {
            message: message.to_string(),
            status: 502,
            error_type: "api_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream { status, .. } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::ModelNotFound(_) => "not_found_error",
            Self::Upstream { error_type, .. } => error_type,
        }
    }
}

impl From<executor::ExecutorError> for RestError {
    fn from(error: executor::ExecutorError) -> Self {
        Self::Upstream {
            message: error.to_string(),
            status: error.status_code(),
            error_type: error.error_type(),
        }
    }
}

/// Error response format compatible with the OpenAI API.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    r#type: String,
    code: u16,
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = ErrorResponse {
            error: ErrorDetails {
                message: self.to_string(),
                r#type: self.error_type().to_string(),
                code: status.as_u16(),
            },
        };

        (status, Json(body)).into_response()
    }
}
