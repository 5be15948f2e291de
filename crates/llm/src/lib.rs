//! Vendor plugin layer and streaming translators.
//!
//! Every provider family implements the same execution contract over its own
//! wire format: build the outbound request from normalized chat messages,
//! classify transport failures, and translate the vendor's streaming dialect
//! into OpenAI-shaped `chat.completion.chunk` events. Callers see one chunk
//! schema and one error taxonomy regardless of the backend.

mod error;
mod http_client;
pub mod messages;
pub mod plugin;

pub use error::LlmError;

/// Result alias for plugin operations.
pub type Result<T> = std::result::Result<T, LlmError>;
