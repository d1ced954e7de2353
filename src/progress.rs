use crate::models::ProgressEvent;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================
// Progress bus: in-process fan-out with optional broker mirror
// ============================================================
//
// Publishing never blocks: a slow subscriber lags and loses events
// rather than stalling the workers. Delivery is at-most-once.
//
// In multi-process mode every event also goes out on a Redis pub/sub
// channel tagged with this process's source id; a mirror task
// re-emits events published by *other* processes into the local bus.

/// Broker pub/sub channel carrying cross-process progress events.
pub const PROGRESS_CHANNEL: &str = "detect:progress";

/// Events buffered per subscriber before it starts lagging.
const BUS_CAPACITY: usize = 256;

/// Wire envelope for mirrored events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    source_id: String,
    #[serde(flatten)]
    event: ProgressEvent,
}

pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
    source_id: String,
    broker: Option<ConnectionManager>,
}

impl ProgressBus {
    pub fn new(broker: Option<ConnectionManager>) -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            source_id: format!("proc_{}", uuid::Uuid::new_v4()),
            broker,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// New subscription; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Fan out locally and, in multi-process mode, across the broker.
    pub async fn publish(&self, event: ProgressEvent) {
        // A send error just means nobody is listening right now
        let _ = self.tx.send(event.clone());

        if let Some(broker) = &self.broker {
            let wire = WireEvent {
                source_id: self.source_id.clone(),
                event,
            };
            match serde_json::to_string(&wire) {
                Ok(payload) => {
                    let mut con = broker.clone();
                    if let Err(e) = redis::cmd("PUBLISH")
                        .arg(PROGRESS_CHANNEL)
                        .arg(payload)
                        .query_async::<_, ()>(&mut con)
                        .await
                    {
                        tracing::warn!("Progress broker publish failed: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Progress event serialization failed: {}", e),
            }
        }
    }

    /// Emit into the local bus only; used by the mirror for foreign events.
    fn local_emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// Whether a mirrored payload should be re-emitted locally.
fn should_reemit(wire: &WireEvent, own_source_id: &str) -> bool {
    wire.source_id != own_source_id
}

/// Long-running mirror: subscribe to the broker channel and re-emit
/// events from other processes. Reconnects with a delay on broker loss.
pub async fn run_mirror(bus: std::sync::Arc<ProgressBus>, client: redis::Client) {
    use futures::StreamExt;

    loop {
        let connection = match client.get_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Progress mirror connect failed: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };
        let mut pubsub = connection.into_pubsub();
        if let Err(e) = pubsub.subscribe(PROGRESS_CHANNEL).await {
            tracing::warn!("Progress mirror subscribe failed: {}", e);
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        }
        tracing::info!("Progress mirror attached to {}", PROGRESS_CHANNEL);

        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(p) => p,
                Err(_) => continue,
            };
            match serde_json::from_str::<WireEvent>(&payload) {
                Ok(wire) if should_reemit(&wire, bus.source_id()) => {
                    bus.local_emit(wire.event);
                }
                Ok(_) => {} // our own echo
                Err(e) => tracing::debug!("Ignoring malformed progress payload: {}", e),
            }
        }
        tracing::warn!("Progress mirror stream ended; reconnecting");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EndpointKind, ProbeStatus};
    use chrono::Utc;

    fn test_event(model_id: &str) -> ProgressEvent {
        ProgressEvent {
            channel_id: "ch_1".to_string(),
            model_id: model_id.to_string(),
            model_name: "gpt-4".to_string(),
            endpoint_kind: EndpointKind::Chat,
            status: ProbeStatus::Success,
            latency_ms: 50,
            timestamp: Utc::now(),
            is_model_complete: false,
        }
    }

    mod bus_tests {
        use super::*;

        #[tokio::test]
        async fn subscribers_receive_published_events() {
            let bus = ProgressBus::new(None);
            let mut rx = bus.subscribe();
            bus.publish(test_event("m1")).await;
            let event = rx.recv().await.unwrap();
            assert_eq!(event.model_id, "m1");
        }

        #[tokio::test]
        async fn every_subscriber_gets_every_event() {
            let bus = ProgressBus::new(None);
            let mut rx1 = bus.subscribe();
            let mut rx2 = bus.subscribe();
            bus.publish(test_event("m1")).await;
            assert_eq!(rx1.recv().await.unwrap().model_id, "m1");
            assert_eq!(rx2.recv().await.unwrap().model_id, "m1");
        }

        #[tokio::test]
        async fn publishing_without_subscribers_is_fine() {
            let bus = ProgressBus::new(None);
            bus.publish(test_event("m1")).await;
        }

        #[tokio::test]
        async fn dropped_subscriber_unsubscribes() {
            let bus = ProgressBus::new(None);
            let rx = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
            drop(rx);
            assert_eq!(bus.subscriber_count(), 0);
        }

        #[tokio::test]
        async fn slow_subscriber_lags_instead_of_blocking() {
            let bus = ProgressBus::new(None);
            let mut rx = bus.subscribe();
            // Overflow the per-subscriber buffer
            for i in 0..(BUS_CAPACITY + 16) {
                bus.publish(test_event(&format!("m{}", i))).await;
            }
            // First recv reports the lag; the publisher never stalled
            match rx.recv().await {
                Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
                other => panic!("expected lag, got {:?}", other.map(|e| e.model_id)),
            }
        }
    }

    mod mirror_tests {
        use super::*;

        #[test]
        fn own_events_are_not_reemitted() {
            let wire = WireEvent {
                source_id: "proc_a".to_string(),
                event: test_event("m1"),
            };
            assert!(!should_reemit(&wire, "proc_a"));
            assert!(should_reemit(&wire, "proc_b"));
        }

        #[test]
        fn wire_envelope_flattens_the_event() {
            let wire = WireEvent {
                source_id: "proc_a".to_string(),
                event: test_event("m1"),
            };
            let json = serde_json::to_string(&wire).unwrap();
            assert!(json.contains("\"sourceId\":\"proc_a\""));
            assert!(json.contains("\"modelId\":\"m1\""));
            let parsed: WireEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed.event.model_id, "m1");
        }
    }
}
