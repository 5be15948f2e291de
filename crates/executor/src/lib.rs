//! Pathway resolution and request execution.
//!
//! A pathway binds prompt templates, a model and an execution policy; the
//! executor compiles registered pathways into request handlers that assemble
//! prompts, chunk oversized input, dispatch through the rate-limited plugin
//! layer, drive tool loops, and publish incremental progress keyed by
//! request id. All shared state lives in an explicitly constructed
//! [`Runtime`]; tests build a fresh one per case.

mod agent;
mod compress;
mod error;
mod executor;
mod parser;
mod pathway;
mod progress;
mod runtime;
mod template;

pub use error::ExecutorError;
pub use executor::{OverrideContext, PathwayExecutor, PathwayInput, PathwayOverride, PathwayReply};
pub use parser::apply_output;
pub use pathway::{Pathway, PathwayRegistry};
pub use progress::{ProgressBus, ProgressEvent, ProgressSubscription};
pub use runtime::{ModelRuntime, Runtime};

/// Result alias for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;
