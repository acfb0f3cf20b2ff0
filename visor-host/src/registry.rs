//! Connected-session registry.
//!
//! Maps each active client name to a [`SessionHandle`]. Name
//! uniqueness is enforced here: [`register`](SessionRegistry::register)
//! inserts only if the name is absent, under one lock acquisition, so
//! two concurrent joins with the same name can never both succeed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::events::{EngineEvent, EventBus};
use crate::store::SessionId;
use visor_core::HostFrame;

/// Per-session outbound queue depth. Screen frames are dropped when
/// the queue is full; other frames wait with a timeout.
pub const OUTBOUND_QUEUE: usize = 64;

/// Shared handle to one live session, held by the registry and by
/// anyone fanning out frames to it.
#[derive(Clone)]
pub struct SessionHandle {
    pub name: String,
    pub peer_addr: SocketAddr,
    /// Outbound frame queue, drained by the session's writer task.
    pub outbound: mpsc::Sender<HostFrame>,
    /// Cancelling this token shuts the session down.
    pub cancel: CancellationToken,
    /// Persisted session id, set once the store round-trip completes.
    pub persisted: Arc<OnceLock<SessionId>>,
}

impl SessionHandle {
    pub fn new(
        name: impl Into<String>,
        peer_addr: SocketAddr,
        outbound: mpsc::Sender<HostFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            peer_addr,
            outbound,
            cancel,
            persisted: Arc::new(OnceLock::new()),
        }
    }
}

/// Registry of all currently active sessions, keyed by client name.
pub struct SessionRegistry {
    inner: Mutex<HashMap<String, SessionHandle>>,
    events: Arc<EventBus>,
}

impl SessionRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Atomically claim `handle.name`. Returns `false` (and leaves the
    /// registry untouched) when the name is already taken.
    pub fn register(&self, handle: SessionHandle) -> bool {
        let name = handle.name.clone();
        let addr = handle.peer_addr;
        {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            if inner.contains_key(&name) {
                return false;
            }
            inner.insert(name.clone(), handle);
        }
        info!(%name, %addr, "client joined");
        self.events.emit(EngineEvent::ClientConnected { name });
        true
    }

    /// Remove a session by name. No-op if it was already removed.
    pub fn unregister(&self, name: &str) -> Option<SessionHandle> {
        let removed = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .remove(name);
        if removed.is_some() {
            info!(%name, "client left");
            self.events.emit(EngineEvent::ClientDisconnected {
                name: name.to_owned(),
            });
        }
        removed
    }

    pub fn is_name_taken(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<SessionHandle> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Snapshot of every live session, for fan-out without holding the
    /// lock across sends.
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every session, for engine shutdown.
    pub fn drain(&self) -> Vec<SessionHandle> {
        let drained: Vec<SessionHandle> = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in &drained {
            self.events.emit(EngineEvent::ClientDisconnected {
                name: handle.name.clone(),
            });
        }
        drained
    }
}
