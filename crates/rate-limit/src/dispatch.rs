use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{CallOutcome, Endpoint};

/// Classification hook for upstream errors: only retryable failures are
/// re-dispatched.
pub trait RetryClass {
    /// Whether another attempt may succeed.
    fn is_retryable(&self) -> bool;
}

/// Errors from model-level dispatch.
#[derive(Debug, Error)]
pub enum DispatchError<E> {
    /// The caller cancelled while waiting or retrying.
    #[error("request cancelled")]
    Cancelled,

    /// The model has no endpoints to dispatch to.
    #[error("no endpoints configured for this model")]
    NoEndpoints,

    /// The upstream call failed and retries are exhausted or not applicable.
    #[error("{0}")]
    Upstream(E),
}

/// Retry budget and backoff curve for one pathway.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt budget and the default backoff curve.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based), doubled per attempt,
    /// capped, with up to 10% jitter.
    fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));

        let capped = exponential.min(self.max_delay);

        capped + capped.mul_f64(rand::random::<f64>() * 0.1)
    }
}

/// Spreads calls for one model across its endpoints.
pub struct ModelDispatcher {
    endpoints: Vec<Arc<Endpoint>>,
    cursor: AtomicUsize,
}

impl ModelDispatcher {
    /// Build a dispatcher over the model's endpoint descriptors.
    pub fn new(endpoints: impl IntoIterator<Item = config::EndpointConfig>) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(|config| Arc::new(Endpoint::new(config))).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// The endpoints this dispatcher rotates over.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Run `call` against a selected endpoint, retrying retryable errors
    /// with exponential backoff until the policy's attempt budget runs out.
    /// Cancellation aborts token waits and backoff sleeps.
    pub async fn execute<T, E, F, Fut>(
        &self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, DispatchError<E>>
    where
        E: RetryClass,
        F: FnMut(Arc<Endpoint>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let endpoint = self.select(cancel).await?;

            endpoint.monitor().begin();
            let result = call(endpoint.clone()).await;
            attempt += 1;

            match result {
                Ok(value) => {
                    endpoint.monitor().finish(CallOutcome::Success);
                    return Ok(value);
                }
                Err(error) => {
                    endpoint.monitor().finish(CallOutcome::Error);

                    if !error.is_retryable() || attempt >= policy.max_attempts.max(1) {
                        return Err(DispatchError::Upstream(error));
                    }

                    let delay = policy.delay(attempt);
                    log::debug!(
                        "retrying against endpoint pool in {delay:?} (attempt {attempt}/{})",
                        policy.max_attempts
                    );

                    tokio::select! {
                        () = cancel.cancelled() => return Err(DispatchError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Pick an endpoint: non-tripped endpoints with an immediately available
    /// token first, least in-flight breaking ties, rotating among equals.
    /// When every bucket is drained, wait on the least loaded one.
    async fn select<E>(&self, cancel: &CancellationToken) -> Result<Arc<Endpoint>, DispatchError<E>> {
        if self.endpoints.is_empty() {
            return Err(DispatchError::NoEndpoints);
        }

        let rotation = self.cursor.fetch_add(1, Ordering::Relaxed);

        let mut candidates: Vec<(usize, &Arc<Endpoint>)> = self
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, endpoint)| !endpoint.monitor().is_tripped())
            .collect();

        // Every endpoint tripped: better to try one than to refuse outright.
        if candidates.is_empty() {
            candidates = self.endpoints.iter().enumerate().collect();
        }

        let len = candidates.len();
        candidates.sort_by_key(|(index, endpoint)| (endpoint.monitor().in_flight(), (index + rotation) % len));

        for (_, endpoint) in &candidates {
            if endpoint.try_acquire() {
                return Ok(Arc::clone(*endpoint));
            }
        }

        let endpoint = Arc::clone(candidates[0].1);

        tokio::select! {
            () = cancel.cancelled() => Err(DispatchError::Cancelled),
            () = endpoint.acquire() => Ok(endpoint),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("permanent")]
        Permanent,
    }

    impl RetryClass for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn dispatcher(endpoints: u32) -> ModelDispatcher {
        ModelDispatcher::new((0..endpoints).map(|i| config::EndpointConfig {
            name: Some(format!("ep-{i}")),
            url: format!("http://localhost:{i}"),
            api_key: None,
            headers: Default::default(),
            params: Default::default(),
            requests_per_second: 100,
        }))
    }

    #[tokio::test]
    async fn returns_the_value_on_success() {
        let dispatcher = dispatcher(2);
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();

        let value: Result<_, DispatchError<TestError>> = dispatcher
            .execute(&policy, &cancel, |_endpoint| async { Ok(7) })
            .await;

        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_the_budget() {
        let dispatcher = dispatcher(1);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = dispatcher
            .execute(&policy, &cancel, |_endpoint| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 { Err(TestError::Transient) } else { Ok(n) }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let dispatcher = dispatcher(1);
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = dispatcher
            .execute(&policy, &cancel, |_endpoint| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Permanent) }
            })
            .await;

        assert!(matches!(result, Err(DispatchError::Upstream(TestError::Permanent))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_mid_retry() {
        let dispatcher = dispatcher(1);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<u32, _> = dispatcher
            .execute(&policy, &cancel, |_endpoint| async { Err(TestError::Transient) })
            .await;

        assert!(matches!(result, Err(DispatchError::Cancelled)));
    }

    #[tokio::test]
    async fn dispatch_without_endpoints_fails() {
        let dispatcher = ModelDispatcher::new(Vec::new());
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();

        let result: Result<u32, _> = dispatcher
            .execute::<u32, TestError, _, _>(&policy, &cancel, |_endpoint| async { Ok(1) })
            .await;

        assert!(matches!(result, Err(DispatchError::NoEndpoints)));
    }
}
