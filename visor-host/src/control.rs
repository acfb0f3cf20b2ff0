//! Input-control arbitration.
//!
//! At most one client holds input control at a time. A grant to a new
//! holder revokes the old one first, so the previous client has been
//! told to stop injecting before the new client is told to start.

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::broadcast::SEND_TIMEOUT;
use crate::events::{EngineEvent, EventBus};
use crate::registry::{SessionHandle, SessionRegistry};
use visor_core::HostFrame;

pub struct ControlArbiter {
    /// Serializes grant/revoke so revoke-then-grant ordering stays
    /// atomic against concurrent transfers. Never held while reading
    /// the holder.
    transfer: Mutex<()>,
    /// Name of the current holder, if any. Reads sit on the per-frame
    /// input path and must never wait behind an in-flight transfer's
    /// sends.
    holder: RwLock<Option<String>>,
    registry: Arc<SessionRegistry>,
    events: Arc<EventBus>,
}

impl ControlArbiter {
    pub fn new(registry: Arc<SessionRegistry>, events: Arc<EventBus>) -> Self {
        Self {
            transfer: Mutex::new(()),
            holder: RwLock::new(None),
            registry,
            events,
        }
    }

    fn read_holder(&self) -> Option<String> {
        self.holder.read().expect("holder lock poisoned").clone()
    }

    fn set_holder(&self, value: Option<String>) {
        *self.holder.write().expect("holder lock poisoned") = value;
    }

    /// Bounded notification send. A peer whose queue stays full for
    /// [`SEND_TIMEOUT`] misses the frame; the token state moves on
    /// regardless.
    async fn notify(&self, session: &SessionHandle, frame: HostFrame) {
        if session
            .outbound
            .send_timeout(frame, SEND_TIMEOUT)
            .await
            .is_err()
        {
            warn!(client = %session.name, "control notification dropped");
        }
    }

    /// Grant input control to `name`, revoking any previous holder
    /// first. Granting to the current holder is a no-op. Granting to
    /// an unknown name clears the token without assigning it.
    pub async fn grant(&self, name: &str) {
        let _transfer = self.transfer.lock().await;

        if self.read_holder().as_deref() == Some(name) {
            return;
        }

        if let Some(previous) = self.read_holder() {
            self.set_holder(None);
            if let Some(session) = self.registry.lookup(&previous) {
                self.notify(&session, HostFrame::ControlRevoke).await;
            }
            info!(from = %previous, "input control revoked");
            self.events.emit(EngineEvent::ControlRevoked);
        }

        let Some(session) = self.registry.lookup(name) else {
            warn!(%name, "control grant to unknown client ignored");
            return;
        };
        self.notify(&session, HostFrame::ControlGrant).await;
        self.set_holder(Some(name.to_owned()));
        info!(to = %name, "input control granted");
        self.events.emit(EngineEvent::ControlGranted);
    }

    /// Revoke input control held by `name`. No-op when `name` is not
    /// the current holder.
    pub async fn revoke(&self, name: &str) {
        let _transfer = self.transfer.lock().await;
        if self.read_holder().as_deref() != Some(name) {
            return;
        }
        self.set_holder(None);
        if let Some(session) = self.registry.lookup(name) {
            self.notify(&session, HostFrame::ControlRevoke).await;
        }
        info!(from = %name, "input control revoked");
        self.events.emit(EngineEvent::ControlRevoked);
    }

    /// Clear the token when its holder disconnects. Sends nothing (the
    /// connection is already gone) and leaves control unheld.
    pub async fn release(&self, name: &str) {
        let _transfer = self.transfer.lock().await;
        if self.read_holder().as_deref() == Some(name) {
            self.set_holder(None);
            info!(from = %name, "input control released on disconnect");
            self.events.emit(EngineEvent::ControlRevoked);
        }
    }

    /// Whether `name` currently holds input control. Lock-free of the
    /// transfer path: a stalled transfer never delays input dispatch.
    pub async fn authorizes(&self, name: &str) -> bool {
        self.read_holder().as_deref() == Some(name)
    }

    pub async fn holder(&self) -> Option<String> {
        self.read_holder()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SessionHandle, OUTBOUND_QUEUE};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use visor_core::FrameKind;

    fn setup() -> (Arc<SessionRegistry>, ControlArbiter) {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&events)));
        let arbiter = ControlArbiter::new(Arc::clone(&registry), events);
        (registry, arbiter)
    }

    fn join(registry: &SessionRegistry, name: &str) -> mpsc::Receiver<HostFrame> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let joined = registry.register(SessionHandle::new(
            name,
            "127.0.0.1:40000".parse().unwrap(),
            tx,
            CancellationToken::new(),
        ));
        assert!(joined);
        rx
    }

    #[tokio::test]
    async fn grant_sets_holder_and_notifies() {
        let (registry, arbiter) = setup();
        let mut alice = join(&registry, "alice");

        arbiter.grant("alice").await;
        assert_eq!(arbiter.holder().await.as_deref(), Some("alice"));
        assert!(arbiter.authorizes("alice").await);
        assert!(!arbiter.authorizes("bob").await);
        assert!(matches!(alice.recv().await, Some(HostFrame::ControlGrant)));
    }

    #[tokio::test]
    async fn regrant_revokes_previous_holder_first() {
        let (registry, arbiter) = setup();

        // Both sessions share one queue so the observed frame order is
        // the true send order across sessions.
        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
        assert!(registry.register(SessionHandle::new(
            "alice",
            "127.0.0.1:40000".parse().unwrap(),
            tx.clone(),
            CancellationToken::new(),
        )));
        assert!(registry.register(SessionHandle::new(
            "bob",
            "127.0.0.1:40001".parse().unwrap(),
            tx,
            CancellationToken::new(),
        )));

        arbiter.grant("alice").await;
        arbiter.grant("bob").await;
        assert_eq!(arbiter.holder().await.as_deref(), Some("bob"));

        let order: Vec<FrameKind> = [rx.recv().await, rx.recv().await, rx.recv().await]
            .into_iter()
            .map(|f| f.unwrap().kind())
            .collect();
        assert_eq!(
            order,
            [
                FrameKind::ControlGrant,
                FrameKind::ControlRevoke,
                FrameKind::ControlGrant
            ]
        );
    }

    #[tokio::test]
    async fn grant_to_holder_is_noop() {
        let (registry, arbiter) = setup();
        let mut alice = join(&registry, "alice");

        arbiter.grant("alice").await;
        arbiter.grant("alice").await;

        assert!(matches!(alice.recv().await, Some(HostFrame::ControlGrant)));
        assert!(alice.try_recv().is_err(), "no duplicate grant frame");
    }

    #[tokio::test]
    async fn grant_to_unknown_clears_token() {
        let (registry, arbiter) = setup();
        let mut alice = join(&registry, "alice");

        arbiter.grant("alice").await;
        let _ = alice.recv().await;

        arbiter.grant("ghost").await;
        assert_eq!(arbiter.holder().await, None);
        assert!(matches!(
            alice.recv().await,
            Some(HostFrame::ControlRevoke)
        ));
    }

    #[tokio::test]
    async fn stalled_peer_does_not_block_authorization_checks() {
        let (registry, arbiter) = setup();
        let arbiter = Arc::new(arbiter);
        let _alice_rx = join(&registry, "alice");
        let _bob_rx = join(&registry, "bob");

        // Wedge alice's queue completely.
        let alice = registry.lookup("alice").unwrap();
        while alice.outbound.try_send(HostFrame::ControlRevoke).is_ok() {}

        // A grant to the stalled peer sits in its bounded wait; input
        // authorization for everyone else must keep answering.
        let granting = {
            let arbiter = Arc::clone(&arbiter);
            tokio::spawn(async move { arbiter.grant("alice").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let answered = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            arbiter.authorizes("bob"),
        )
        .await
        .expect("authorization check blocked behind a stalled grant");
        assert!(!answered);

        tokio::time::timeout(
            std::time::Duration::from_millis(500),
            arbiter.holder(),
        )
        .await
        .expect("holder read blocked behind a stalled grant");

        // Unwedge the queue and let the grant finish.
        drop(_alice_rx);
        let _ = granting.await;
    }

    #[tokio::test]
    async fn revoke_by_non_holder_is_noop() {
        let (registry, arbiter) = setup();
        let _alice = join(&registry, "alice");

        arbiter.grant("alice").await;
        arbiter.revoke("bob").await;
        assert_eq!(arbiter.holder().await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn release_clears_holder_without_frames() {
        let (registry, arbiter) = setup();
        let mut alice = join(&registry, "alice");

        arbiter.grant("alice").await;
        let _ = alice.recv().await;

        arbiter.release("alice").await;
        assert_eq!(arbiter.holder().await, None);
        assert!(alice.try_recv().is_err());

        // A later grant must not revoke the departed holder.
        let mut bob = join(&registry, "bob");
        arbiter.grant("bob").await;
        assert!(matches!(bob.recv().await, Some(HostFrame::ControlGrant)));
    }
}
