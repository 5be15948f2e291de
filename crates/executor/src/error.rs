use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the pathway executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// No pathway registered under the requested name.
    #[error("unknown pathway '{0}'")]
    UnknownPathway(String),

    /// A pathway references a model the runtime does not know.
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// Missing or malformed caller input.
    #[error("invalid input: {0}")]
    InputValidation(String),

    /// A prompt template failed to render.
    #[error("template error: {0}")]
    Template(String),

    /// Input chunking failed.
    #[error(transparent)]
    Chunk(#[from] chunker::ChunkError),

    /// The plugin layer failed.
    #[error(transparent)]
    Llm(#[from] llm::LlmError),

    /// The file substrate failed.
    #[error(transparent)]
    Files(#[from] files::FileError),

    /// The pathway deadline expired.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// HTTP status for the REST surface.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnknownPathway(_) | Self::UnknownModel(_) => 404,
            Self::InputValidation(_) | Self::Chunk(_) => 400,
            Self::Template(_) => 500,
            Self::Llm(e) => e.status_code(),
            Self::Files(_) => 500,
            Self::Timeout(_) => 504,
            Self::Cancelled => 499,
        }
    }

    /// OpenAI-style error type string for the REST envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::UnknownPathway(_) | Self::UnknownModel(_) => "not_found_error",
            Self::InputValidation(_) | Self::Chunk(_) => "invalid_request_error",
            Self::Template(_) | Self::Files(_) => "internal_error",
            Self::Llm(e) => e.error_type(),
            Self::Timeout(_) => "timeout_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the declared fallback pathway should take over.
    pub(crate) fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Self::Llm(llm::LlmError::NonRetryable { .. }) | Self::Llm(llm::LlmError::Refusal(_))
        )
    }
}
