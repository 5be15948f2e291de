use thiserror::Error;

/// Errors from the file-collection substrate.
#[derive(Debug, Error)]
pub enum FileError {
    /// Malformed argument: bad line range, empty filename, missing match.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The backing store failed.
    #[error("store error: {0}")]
    Store(String),

    /// The file-handler collaborator rejected or failed a transfer.
    #[error("file handler error: {0}")]
    Handler(String),

    /// No record with the given id.
    #[error("file '{0}' not found")]
    NotFound(String),
}
