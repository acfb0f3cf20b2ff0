//! Chat and file fan-out.
//!
//! Broadcasts go to every connected client except the originator,
//! matched by client name. Persistence is best effort and happens off
//! the fan-out path; a store failure is logged and never blocks or
//! fails delivery.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::events::{EngineEvent, EventBus};
use crate::registry::SessionRegistry;
use crate::store::{ActivityKind, SessionId, SessionStore};
use visor_core::HostFrame;

/// How long a fan-out send may wait on one slow client's queue before
/// the frame is dropped for that client.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn SessionStore>,
    events: Arc<EventBus>,
    host_name: String,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn SessionStore>,
        events: Arc<EventBus>,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            events,
            host_name: host_name.into(),
        }
    }

    /// Fan a chat line out to everyone but `origin`, persist it, and
    /// surface it to the host UI when it came from a client.
    pub async fn chat(&self, origin: &str, text: &str, origin_session: Option<SessionId>) {
        self.fan_out(
            origin,
            HostFrame::Chat {
                sender: origin.to_owned(),
                content: text.to_owned(),
            },
        )
        .await;

        if origin != self.host_name {
            self.events.emit(EngineEvent::ChatReceived {
                sender: origin.to_owned(),
                text: text.to_owned(),
            });
        }

        if let Some(session_id) = origin_session {
            let store = Arc::clone(&self.store);
            let origin = origin.to_owned();
            let text = text.to_owned();
            tokio::spawn(async move {
                if let Err(e) = store.save_chat_message(&session_id, &origin, &text).await {
                    warn!("failed to persist chat message: {e}");
                }
                if let Err(e) = store
                    .record_activity(&session_id, ActivityKind::Chat, &origin)
                    .await
                {
                    warn!("failed to record chat activity: {e}");
                }
            });
        }
    }

    /// Fan a file out to everyone but `origin`.
    pub async fn file(
        &self,
        origin: &str,
        name: &str,
        data: Bytes,
        origin_session: Option<SessionId>,
    ) {
        self.fan_out(
            origin,
            HostFrame::File {
                sender: origin.to_owned(),
                name: name.to_owned(),
                data: data.clone(),
            },
        )
        .await;

        if origin != self.host_name {
            self.events.emit(EngineEvent::FileReceived {
                sender: origin.to_owned(),
                name: name.to_owned(),
                data,
            });
        }

        if let Some(session_id) = origin_session {
            let store = Arc::clone(&self.store);
            let details = format!("{origin}:{name}");
            tokio::spawn(async move {
                if let Err(e) = store
                    .record_activity(&session_id, ActivityKind::FileUpload, &details)
                    .await
                {
                    warn!("failed to record file activity: {e}");
                }
            });
        }
    }

    /// Send `frame` to every session except the one named `origin`.
    /// Cheap clone per recipient; a client whose queue stays full for
    /// [`SEND_TIMEOUT`] just misses this frame.
    async fn fan_out(&self, origin: &str, frame: HostFrame) {
        for session in self.registry.snapshot() {
            if session.name == origin {
                continue;
            }
            match session
                .outbound
                .send_timeout(frame.clone(), SEND_TIMEOUT)
                .await
            {
                Ok(()) => {}
                Err(tokio::sync::mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!(client = %session.name, kind = %frame.kind(), "fan-out timed out, frame dropped");
                }
                Err(tokio::sync::mpsc::error::SendTimeoutError::Closed(_)) => {
                    debug!(client = %session.name, "fan-out to closing session skipped");
                }
            }
        }
    }
}
