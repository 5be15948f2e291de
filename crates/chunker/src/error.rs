use thiserror::Error;

/// Errors from the chunk engine.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// The requested chunk budget is unusable.
    #[error("invalid maximum chunk size: {0}")]
    InvalidMaxToken(usize),

    /// A markup element cannot be split and does not fit the budget.
    #[error("markup element of {tokens} tokens exceeds the chunk budget of {max}")]
    OversizedAtom { tokens: usize, max: usize },
}
