//! Engine → presentation-layer event fan-out.
//!
//! The engine raises events; it never renders them. Subscribers
//! receive events over bounded channels so a stalled UI cannot block
//! protocol tasks — a full subscriber queue drops the event.

use bytes::Bytes;
use tokio::sync::mpsc;

/// Events raised by the host and client engines for the embedding
/// application.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// (Client side) the handshake succeeded.
    Connected,
    /// (Client side) the connection ended.
    Disconnected { reason: String },
    /// (Client side) the connection or handshake failed.
    ConnectionFailed { reason: String },
    /// A chat line arrived from another participant.
    ChatReceived { sender: String, text: String },
    /// A file arrived from another participant.
    FileReceived {
        sender: String,
        name: String,
        data: Bytes,
    },
    /// (Client side) a new screen frame arrived.
    ScreenUpdated { data: Bytes },
    /// Input control changed hands.
    ControlGranted,
    ControlRevoked,
    /// (Host side) a peer completed the handshake.
    ClientConnected { name: String },
    /// (Host side) a peer left.
    ClientDisconnected { name: String },
}

/// Default per-subscriber queue depth.
const SUBSCRIBER_QUEUE: usize = 256;

/// Registry of event subscribers.
///
/// `emit` never blocks: events are pushed with `try_send` and dropped
/// (with a debug log) when a subscriber's queue is full. Closed
/// subscribers are pruned lazily on the next emit.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: std::sync::Mutex<Vec<mpsc::Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> mpsc::Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    pub fn emit(&self, event: EngineEvent) {
        let mut subs = self.subscribers.lock().expect("event bus lock poisoned");
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("subscriber queue full; dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Number of live subscribers (closed ones linger until the next
    /// emit).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(EngineEvent::ClientConnected {
            name: "alice".into(),
        });

        for rx in [&mut a, &mut b] {
            assert_eq!(
                rx.recv().await,
                Some(EngineEvent::ClientConnected {
                    name: "alice".into(),
                })
            );
        }
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.emit(EngineEvent::ControlGranted);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for _ in 0..(SUBSCRIBER_QUEUE + 10) {
            bus.emit(EngineEvent::ControlRevoked);
        }

        // The subscriber survives with a full queue of events.
        assert_eq!(bus.subscriber_count(), 1);
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, SUBSCRIBER_QUEUE);
    }
}
