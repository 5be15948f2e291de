use std::time::Duration;

use rate_limit::RetryClass;
use thiserror::Error;

/// Errors from the vendor plugin layer.
///
/// Plugins catch wire errors, classify them, and rethrow one of these. The
/// executor recovers `Retryable` (bounded attempts) and `ToolArgument`
/// (fed back to the model); everything else surfaces to the caller.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Missing required parameter, malformed chat history or unusable request.
    #[error("invalid input: {0}")]
    InputValidation(String),

    /// Transient failure another attempt may clear: connection resets, 429,
    /// 5xx, provider-side rate limiting, stream reset before the first byte.
    #[error("{message}")]
    Retryable {
        /// Human-readable description of the failure.
        message: String,
        /// HTTP status when the failure came with one.
        status: Option<u16>,
    },

    /// Permanent failure: schema rejection, authentication, bad request.
    #[error("{message}")]
    NonRetryable {
        /// Human-readable description of the failure.
        message: String,
        /// HTTP status when the failure came with one.
        status: Option<u16>,
    },

    /// The provider refused the content (content-filter finish).
    #[error("content filtered by the provider: {0}")]
    Refusal(String),

    /// The model emitted tool-call arguments that fail JSON parsing.
    /// Surfaced back to the model as a tool result, not fatal.
    #[error("tool arguments failed to parse: {0}")]
    ToolArgument(String),

    /// The pathway deadline expired.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
}

impl LlmError {
    /// Classify a non-success provider status into an error kind, keeping
    /// the provider's message.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            429 | 500..=599 => Self::Retryable {
                message,
                status: Some(status),
            },
            _ => Self::NonRetryable {
                message,
                status: Some(status),
            },
        }
    }

    /// Wrap a transport-level send failure.
    pub fn connection(err: reqwest::Error) -> Self {
        Self::Retryable {
            message: format!("connection error: {err}"),
            status: None,
        }
    }

    /// HTTP status to report on the REST surface.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InputValidation(_) | Self::ToolArgument(_) => 400,
            Self::Retryable { status, .. } => status.unwrap_or(502),
            Self::NonRetryable { status, .. } => status.unwrap_or(502),
            Self::Refusal(_) => 400,
            Self::Timeout(_) => 504,
            Self::Cancelled => 499,
        }
    }

    /// OpenAI-style error type string for the REST envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InputValidation(_) | Self::ToolArgument(_) => "invalid_request_error",
            Self::Retryable { status: Some(429), .. } => "rate_limit_error",
            Self::Retryable { .. } => "api_error",
            Self::NonRetryable { status: Some(401 | 403), .. } => "authentication_error",
            Self::NonRetryable { .. } => "invalid_request_error",
            Self::Refusal(_) => "content_filter_error",
            Self::Timeout(_) => "timeout_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl RetryClass for LlmError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}
