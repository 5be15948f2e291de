//! Per-endpoint rate limiting and model-level dispatch.
//!
//! Every endpoint owns a token bucket whose capacity equals its refill rate
//! and a monitor tracking requests, errors and in-flight calls. Dispatch for
//! a model selects the endpoint with immediate capacity (least in-flight
//! breaking ties), waits for a free token when all buckets are drained, and
//! retries retryable failures with capped exponential backoff.

mod dispatch;
mod endpoint;

pub use dispatch::{DispatchError, ModelDispatcher, RetryClass, RetryPolicy};
pub use endpoint::{CallOutcome, Endpoint, EndpointMonitor};
