use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use amux_protocol::{SessionEvent, SessionId};

const CHANNEL_CAPACITY: usize = 256;

/// Per-session broadcast channels for activity/process-status notifications.
/// Only genuine state changes are published; terminal bytes are polled from
/// the buffer, never pushed here.
pub struct EventBroker {
    channels: Mutex<HashMap<SessionId, broadcast::Sender<SessionEvent>>>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, session_id: &str) -> broadcast::Sender<SessionEvent> {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        self.channels
            .lock()
            .expect("broker lock poisoned")
            .insert(session_id.to_string(), tx.clone());
        tx
    }

    pub fn remove(&self, session_id: &str) {
        self.channels
            .lock()
            .expect("broker lock poisoned")
            .remove(session_id);
    }

    pub fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        self.channels
            .lock()
            .expect("broker lock poisoned")
            .get(session_id)
            .map(|tx| tx.subscribe())
    }

    pub fn publish(&self, session_id: &str, event: SessionEvent) {
        if let Some(tx) = self
            .channels
            .lock()
            .expect("broker lock poisoned")
            .get(session_id)
        {
            // Send fails only when no subscriber is listening; that is fine.
            let _ = tx.send(event);
        }
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amux_protocol::ActivityState;

    #[tokio::test]
    async fn register_publish_subscribe_remove() {
        let broker = EventBroker::new();
        broker.register("s1");
        let mut rx = broker.subscribe("s1").expect("subscribe");

        broker.publish(
            "s1",
            SessionEvent::ActivityChanged {
                session_id: "s1".to_string(),
                activity: ActivityState::Working,
            },
        );
        let event = rx.recv().await.expect("recv");
        assert!(matches!(event, SessionEvent::ActivityChanged { .. }));

        broker.remove("s1");
        assert!(broker.subscribe("s1").is_none());
    }
}
