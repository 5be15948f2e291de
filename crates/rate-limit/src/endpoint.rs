use std::{
    num::NonZeroU32,
    sync::{
        Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Consecutive upstream errors after which an endpoint is taken out of
/// rotation.
const TRIP_THRESHOLD: u64 = 5;

/// How long a tripped endpoint stays out of rotation.
const TRIP_COOLDOWN: Duration = Duration::from_secs(10);

/// Outcome of one upstream call, reported back to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The call completed.
    Success,
    /// The call failed at or past the wire.
    Error,
}

/// Rolling counters for one endpoint.
#[derive(Debug, Default)]
pub struct EndpointMonitor {
    requests: AtomicU64,
    errors: AtomicU64,
    consecutive_errors: AtomicU64,
    in_flight: AtomicUsize,
    tripped_until: Mutex<Option<Instant>>,
}

impl EndpointMonitor {
    /// Record the start of a call.
    pub fn begin(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a call with its outcome.
    pub fn finish(&self, outcome: CallOutcome) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            CallOutcome::Success => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
            }
            CallOutcome::Error => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                let streak = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;

                if streak >= TRIP_THRESHOLD {
                    let mut tripped = self.tripped_until.lock().unwrap_or_else(|e| e.into_inner());
                    *tripped = Some(Instant::now() + TRIP_COOLDOWN);
                }
            }
        }
    }

    /// Calls currently running against this endpoint.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Total calls admitted.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Total failed calls.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Whether the endpoint is currently out of rotation.
    pub fn is_tripped(&self) -> bool {
        let mut tripped = self.tripped_until.lock().unwrap_or_else(|e| e.into_inner());

        match *tripped {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *tripped = None;
                self.consecutive_errors.store(0, Ordering::Relaxed);
                false
            }
            None => false,
        }
    }
}

/// A runtime endpoint: its configuration, token bucket and monitor.
pub struct Endpoint {
    config: config::EndpointConfig,
    limiter: DefaultDirectRateLimiter,
    monitor: EndpointMonitor,
}

impl Endpoint {
    /// Build an endpoint from its configuration. The bucket capacity equals
    /// the refill rate.
    pub fn new(config: config::EndpointConfig) -> Self {
        let rate = NonZeroU32::new(config.requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);

        Self {
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            monitor: EndpointMonitor::default(),
            config,
        }
    }

    /// Endpoint configuration (URL, headers, per-endpoint params).
    pub fn config(&self) -> &config::EndpointConfig {
        &self.config
    }

    /// Monitor counters for this endpoint.
    pub fn monitor(&self) -> &EndpointMonitor {
        &self.monitor
    }

    /// Take a token if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.config.url)
            .field("in_flight", &self.monitor.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(rps: u32) -> Endpoint {
        Endpoint::new(config::EndpointConfig {
            name: None,
            url: "http://localhost:1".to_string(),
            api_key: None,
            headers: Default::default(),
            params: Default::default(),
            requests_per_second: rps,
        })
    }

    #[test]
    fn bucket_capacity_equals_rate() {
        let ep = endpoint(3);

        assert!(ep.try_acquire());
        assert!(ep.try_acquire());
        assert!(ep.try_acquire());
        assert!(!ep.try_acquire());
    }

    #[test]
    fn monitor_counts_and_trips() {
        let monitor = EndpointMonitor::default();

        for _ in 0..TRIP_THRESHOLD {
            monitor.begin();
            monitor.finish(CallOutcome::Error);
        }

        assert!(monitor.is_tripped());
        assert_eq!(monitor.errors(), TRIP_THRESHOLD);
        assert_eq!(monitor.in_flight(), 0);
    }

    #[test]
    fn success_resets_the_error_streak() {
        let monitor = EndpointMonitor::default();

        for _ in 0..TRIP_THRESHOLD - 1 {
            monitor.begin();
            monitor.finish(CallOutcome::Error);
        }

        monitor.begin();
        monitor.finish(CallOutcome::Success);

        monitor.begin();
        monitor.finish(CallOutcome::Error);

        assert!(!monitor.is_tripped());
    }
}
