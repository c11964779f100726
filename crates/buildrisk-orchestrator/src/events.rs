//! In-process event bus for scenario/repo/build/scan status fan-out.
//!
//! Publish-only from the Orchestrator's point of view: nothing downstream of
//! this crate pushes state back through it. Wraps `tokio::sync::broadcast`
//! rather than reaching for a message-queue crate, since every subscriber
//! lives in the same process (the CLI calls the orchestrator in-process; the
//! daemon hosts the consumers).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventTopic {
    RepoUpdate,
    BuildUpdate,
    ScenarioUpdate,
    ScanUpdate,
    EnrichmentUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub topic: EventTopic,
    pub scenario_id: Option<Uuid>,
    pub entity_id: Uuid,
    pub payload: serde_json::Value,
}

pub trait EventBus: Send + Sync {
    fn publish(&self, event: EventEnvelope);
    fn subscribe(&self) -> BroadcastStream<EventEnvelope>;
}

pub struct BroadcastEventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: EventEnvelope) {
        // No subscribers is a normal, expected state (e.g. CLI-only
        // one-shot invocations); dropping the event is correct there.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> BroadcastStream<EventEnvelope> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = BroadcastEventBus::new(8);
        let mut stream = bus.subscribe();
        bus.publish(EventEnvelope {
            topic: EventTopic::ScenarioUpdate,
            scenario_id: Some(Uuid::new_v4()),
            entity_id: Uuid::new_v4(),
            payload: serde_json::json!({"status": "filtering"}),
        });
        let received = stream.next().await.unwrap().unwrap();
        assert!(matches!(received.topic, EventTopic::ScenarioUpdate));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = BroadcastEventBus::new(8);
        bus.publish(EventEnvelope {
            topic: EventTopic::RepoUpdate,
            scenario_id: None,
            entity_id: Uuid::new_v4(),
            payload: serde_json::Value::Null,
        });
    }
}
