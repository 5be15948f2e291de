//! The progress bus: per-request publish/subscribe of progress events.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Progress events retained for a finished request, so late subscribers of
/// completed work still observe the terminal event.
const TERMINAL_RETENTION: Duration = Duration::from_secs(60);

/// Broadcast buffer per request; slow subscribers drop oldest events.
const CHANNEL_CAPACITY: usize = 256;

/// One progress event for a long-running request.
///
/// `progress` is monotonically non-decreasing on `[0, 1]`; the terminal
/// event has `progress == 1` and, on success, `data` carrying the
/// JSON-encoded final result. `data` and `info`, when present, are always
/// JSON-encoded strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub request_id: String,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl ProgressEvent {
    /// A non-terminal progress marker.
    pub fn marker(request_id: impl Into<String>, progress: f64) -> Self {
        Self {
            request_id: request_id.into(),
            progress,
            data: None,
            info: None,
        }
    }

    /// The terminal success event carrying the JSON-encoded result.
    pub fn terminal(request_id: impl Into<String>, data: String) -> Self {
        Self {
            request_id: request_id.into(),
            progress: 1.0,
            data: Some(data),
            info: None,
        }
    }

    /// The terminal failure event; `info` is the JSON-encoded error
    /// descriptor, starting with `ERROR:`.
    pub fn failed(request_id: impl Into<String>, error: &str) -> Self {
        Self {
            request_id: request_id.into(),
            progress: 1.0,
            data: None,
            info: Some(serde_json::json!(format!("ERROR: {error}")).to_string()),
        }
    }

    /// Whether this is the last event for its request.
    pub fn is_terminal(&self) -> bool {
        self.progress >= 1.0
    }
}

/// A subscription to one request's progress.
pub struct ProgressSubscription {
    /// The retained terminal event, when the request already finished.
    pub initial: Option<ProgressEvent>,
    /// Live events.
    pub receiver: broadcast::Receiver<ProgressEvent>,
}

/// In-process publish/subscribe channel keyed by request id.
pub struct ProgressBus {
    channels: DashMap<String, broadcast::Sender<ProgressEvent>>,
    floor: DashMap<String, f64>,
    terminals: mini_moka::sync::Cache<String, ProgressEvent>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            floor: DashMap::new(),
            terminals: mini_moka::sync::Cache::builder()
                .time_to_live(TERMINAL_RETENTION)
                .build(),
        }
    }

    /// Publish an event. Progress is clamped so subscribers never observe a
    /// decrease; the terminal event tears the channel down and is retained
    /// briefly for late subscribers.
    pub fn publish(&self, mut event: ProgressEvent) {
        let request_id = event.request_id.clone();

        {
            let mut floor = self.floor.entry(request_id.clone()).or_insert(0.0);

            if event.progress < *floor {
                event.progress = *floor;
            } else {
                *floor = event.progress;
            }
        }

        let terminal = event.is_terminal();

        if terminal {
            self.terminals.insert(request_id.clone(), event.clone());
        }

        if let Some(sender) = self.channels.get(&request_id) {
            // Send fails only when every subscriber is gone.
            let _ = sender.send(event);
        }

        if terminal {
            self.channels.remove(&request_id);
            self.floor.remove(&request_id);
        }
    }

    /// Subscribe to a request's events. A request that already finished
    /// yields its retained terminal event as `initial`.
    pub fn subscribe(&self, request_id: &str) -> ProgressSubscription {
        let initial = self.terminals.get(&request_id.to_string());

        let receiver = self
            .channels
            .entry(request_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        ProgressSubscription { initial, receiver }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order_and_monotonic() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe("r1");

        bus.publish(ProgressEvent::marker("r1", 0.2));
        bus.publish(ProgressEvent::marker("r1", 0.1));
        bus.publish(ProgressEvent::terminal("r1", "\"done\"".to_string()));

        let first = sub.receiver.recv().await.unwrap();
        let second = sub.receiver.recv().await.unwrap();
        let third = sub.receiver.recv().await.unwrap();

        assert_eq!(first.progress, 0.2);
        // The regressing publish was clamped up to the floor.
        assert_eq!(second.progress, 0.2);
        assert!(third.is_terminal());
        assert_eq!(third.data.as_deref(), Some("\"done\""));
    }

    #[tokio::test]
    async fn late_subscribers_see_the_retained_terminal() {
        let bus = ProgressBus::new();

        bus.publish(ProgressEvent::terminal("r2", "\"result\"".to_string()));

        let sub = bus.subscribe("r2");
        let initial = sub.initial.unwrap();
        assert!(initial.is_terminal());
        assert_eq!(initial.data.as_deref(), Some("\"result\""));
    }

    #[tokio::test]
    async fn failure_info_is_json_encoded_and_prefixed() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe("r3");

        bus.publish(ProgressEvent::failed("r3", "boom"));

        let event = sub.receiver.recv().await.unwrap();
        assert!(event.is_terminal());

        let info: String = serde_json::from_str(event.info.as_deref().unwrap()).unwrap();
        assert!(info.starts_with("ERROR:"));
        assert!(info.contains("boom"));
    }

    #[tokio::test]
    async fn exactly_one_terminal_event_per_request() {
        let bus = ProgressBus::new();
        let mut sub = bus.subscribe("r4");

        bus.publish(ProgressEvent::marker("r4", 0.5));
        bus.publish(ProgressEvent::terminal("r4", "\"a\"".to_string()));
        // The channel is torn down; a second terminal has no subscribers.
        bus.publish(ProgressEvent::terminal("r4", "\"b\"".to_string()));

        let mut terminals = 0;
        while let Ok(event) = sub.receiver.try_recv() {
            if event.is_terminal() {
                terminals += 1;
            }
        }

        assert_eq!(terminals, 1);
    }
}
