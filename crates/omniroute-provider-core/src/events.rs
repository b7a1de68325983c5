//! Operational events observable by dashboards or a terminal sink.

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum Event {
    ConnectionUnavailable {
        machine_id: String,
        connection_id: String,
        status: Option<u16>,
        cooldown_ms: u64,
    },
    ConnectionActive {
        machine_id: String,
        connection_id: String,
    },
    TokenRefreshed {
        machine_id: String,
        connection_id: String,
        provider: String,
    },
}

#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<Event>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();
        hub.emit(Event::ConnectionActive {
            machine_id: "m".to_string(),
            connection_id: "c".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::ConnectionActive { .. }));
    }
}
