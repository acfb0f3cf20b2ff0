//! One client connection, from accept to close.
//!
//! State machine: Connecting → Authenticating → Active → Closing →
//! Closed. The handshake must be the first frame on the wire; once
//! Active, the session runs a writer task draining its outbound
//! queue, a pusher task feeding screen frames into that queue, and
//! the inbound dispatch loop on the session task itself.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::broadcast::Broadcaster;
use crate::capture::CapturePipeline;
use crate::config::HostConfig;
use crate::control::ControlArbiter;
use crate::events::EventBus;
use crate::platform::InputSink;
use crate::registry::{SessionHandle, SessionRegistry, OUTBOUND_QUEUE};
use crate::store::{ActivityKind, SessionStore};
use visor_core::{ClientFrame, HostCodec, HostFrame, VisorError};

/// Handshake failure messages sent to the peer verbatim.
const MSG_BAD_PASSWORD: &str = "Invalid password";
const MSG_NAME_TAKEN: &str = "Name already in use";

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

/// Shared collaborators handed to every session.
pub struct SessionContext {
    pub config: HostConfig,
    pub registry: Arc<SessionRegistry>,
    pub arbiter: Arc<ControlArbiter>,
    pub broadcaster: Arc<Broadcaster>,
    pub pipeline: Arc<CapturePipeline>,
    pub store: Arc<dyn SessionStore>,
    pub input: Arc<dyn InputSink>,
    pub events: Arc<EventBus>,
}

pub struct Session {
    ctx: Arc<SessionContext>,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(ctx: Arc<SessionContext>, peer_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            peer_addr,
            cancel,
            state: Mutex::new(SessionState::Connecting),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().expect("session state lock poisoned") = next;
    }

    /// Drive the session to completion. Always leaves the state at
    /// Closed and the registry without this session's name.
    pub async fn run(self: Arc<Self>, stream: TcpStream) {
        let peer = self.peer_addr;
        let framed = Framed::new(stream, HostCodec::new());
        let (mut sink, mut inbound) = framed.split();

        self.set_state(SessionState::Authenticating);
        let (name, handle, outbound_rx) = match self.authenticate(&mut sink, &mut inbound).await {
            Ok(admitted) => admitted,
            Err(e) => {
                debug!(%peer, "handshake failed: {e}");
                let _ = sink.close().await;
                self.set_state(SessionState::Closed);
                return;
            }
        };
        self.set_state(SessionState::Active);

        self.spawn_persist_bootstrap(&handle);

        // Writer task: sole owner of the sink, drains the outbound
        // queue until it closes.
        let writer = tokio::spawn(async move {
            let mut rx = outbound_rx;
            while let Some(frame) = rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pusher_stop = Arc::new(AtomicBool::new(false));
        let pusher = self.spawn_screen_pusher(handle.outbound.clone(), Arc::clone(&pusher_stop));

        let reason = self.dispatch_loop(&name, &handle, &mut inbound).await;

        pusher_stop.store(true, Ordering::SeqCst);
        self.close(&name, &handle, &reason).await;
        drop(handle);
        let _ = pusher.await;
        let _ = writer.await;
    }

    // ── Handshake ────────────────────────────────────────────────

    /// First frame must authenticate. On success the session is
    /// registered under its (unique) name; on failure the peer gets a
    /// rejection frame and an error comes back.
    async fn authenticate<W, R>(
        &self,
        sink: &mut W,
        inbound: &mut R,
    ) -> Result<(String, SessionHandle, mpsc::Receiver<HostFrame>), VisorError>
    where
        W: Sink<HostFrame, Error = VisorError> + Unpin,
        R: Stream<Item = Result<ClientFrame, VisorError>> + Unpin,
    {
        let first = match inbound.next().await {
            Some(frame) => frame?,
            None => return Err(VisorError::Incomplete),
        };

        let (password, name) = match first {
            ClientFrame::Authenticate { password, name } => (password, name),
            other => {
                return Err(VisorError::ExpectedAuth { got: other.kind() });
            }
        };

        if password != self.ctx.config.network.password {
            sink.send(HostFrame::AuthResult {
                success: false,
                message: MSG_BAD_PASSWORD.to_owned(),
            })
            .await?;
            return Err(VisorError::auth(MSG_BAD_PASSWORD));
        }

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let handle = SessionHandle::new(name.clone(), self.peer_addr, tx, self.cancel.clone());
        if !self.ctx.registry.register(handle.clone()) {
            sink.send(HostFrame::AuthResult {
                success: false,
                message: MSG_NAME_TAKEN.to_owned(),
            })
            .await?;
            return Err(VisorError::auth(MSG_NAME_TAKEN));
        }

        sink.send(HostFrame::AuthResult {
            success: true,
            message: String::new(),
        })
        .await?;
        Ok((name, handle, rx))
    }

    /// Best-effort user/session persistence, off the protocol path.
    fn spawn_persist_bootstrap(&self, handle: &SessionHandle) {
        let store = Arc::clone(&self.ctx.store);
        let name = handle.name.clone();
        let peer_addr = handle.peer_addr.to_string();
        let password = self.ctx.config.network.password.clone();
        let persisted = Arc::clone(&handle.persisted);
        tokio::spawn(async move {
            let result = async {
                let user_id = match store.find_user(&name).await? {
                    Some(user) => {
                        store.update_last_login(&name).await?;
                        user.id
                    }
                    None => {
                        let hash = store.hash_password(&password);
                        store.create_user(&name, &hash).await?
                    }
                };
                let session_id = store.start_session(&user_id, &name, &peer_addr).await?;
                store
                    .record_activity(&session_id, ActivityKind::Connect, &name)
                    .await?;
                Ok::<_, VisorError>(session_id)
            }
            .await;

            match result {
                Ok(session_id) => {
                    let _ = persisted.set(session_id);
                }
                Err(e) => warn!(%name, "session persistence failed: {e}"),
            }
        });
    }

    // ── Screen push ──────────────────────────────────────────────

    /// Feeds the latest pipeline frame into this session's queue at
    /// the pipeline's current rate. The latest frame goes out every
    /// tick, seen or not, so a client always converges on the current
    /// screen even when nothing changed. A full queue drops the
    /// frame; the next tick carries the latest one anyway.
    fn spawn_screen_pusher(
        &self,
        outbound: mpsc::Sender<HostFrame>,
        stop: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let pipeline = Arc::clone(&self.ctx.pipeline);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                if stop.load(Ordering::SeqCst) || cancel.is_cancelled() {
                    break;
                }
                if let Some(frame) = pipeline.latest_frame() {
                    match outbound.try_send(HostFrame::Screen {
                        data: frame.data.clone(),
                    }) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            trace!("outbound queue full, screen frame dropped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                let interval = Duration::from_millis(1000 / pipeline.current_fps().max(1) as u64);
                tokio::time::sleep(interval).await;
            }
        })
    }

    // ── Inbound dispatch ─────────────────────────────────────────

    /// Handle inbound frames until disconnect, error, or cancellation.
    /// Returns the close reason.
    async fn dispatch_loop<R>(
        &self,
        name: &str,
        handle: &SessionHandle,
        inbound: &mut R,
    ) -> String
    where
        R: Stream<Item = Result<ClientFrame, VisorError>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return "host shutdown".to_owned(),
                frame = inbound.next() => frame,
            };

            match frame {
                Some(Ok(frame)) => {
                    if let Some(reason) = self.handle_frame(name, handle, frame).await {
                        return reason;
                    }
                }
                Some(Err(e)) => {
                    warn!(client = %name, "protocol error: {e}");
                    return format!("protocol error: {e}");
                }
                None => return "connection closed by peer".to_owned(),
            }
        }
    }

    /// Returns `Some(reason)` when the frame ends the session.
    async fn handle_frame(
        &self,
        name: &str,
        handle: &SessionHandle,
        frame: ClientFrame,
    ) -> Option<String> {
        match frame {
            ClientFrame::Chat { content } => {
                self.ctx
                    .broadcaster
                    .chat(name, &content, handle.persisted.get().cloned())
                    .await;
            }
            ClientFrame::File {
                name: file_name,
                data,
            } => {
                self.ctx
                    .broadcaster
                    .file(name, &file_name, data, handle.persisted.get().cloned())
                    .await;
            }
            ClientFrame::Mouse { event_type, data } => {
                self.inject(name, handle, ActivityKind::MouseControl, &event_type, &data)
                    .await;
            }
            ClientFrame::Keyboard { event_type, data } => {
                self.inject(
                    name,
                    handle,
                    ActivityKind::KeyboardControl,
                    &event_type,
                    &data,
                )
                .await;
            }
            ClientFrame::Disconnect => {
                return Some("client disconnected".to_owned());
            }
            ClientFrame::Authenticate { .. } => {
                warn!(client = %name, "authenticate frame after handshake ignored");
            }
        }
        None
    }

    /// Inject an input event if and only if this client holds input
    /// control. Unauthorized events are dropped without reply.
    async fn inject(
        &self,
        name: &str,
        handle: &SessionHandle,
        kind: ActivityKind,
        event_type: &str,
        data: &[u8],
    ) {
        if !self.ctx.arbiter.authorizes(name).await {
            trace!(client = %name, "input from non-holder dropped");
            return;
        }

        let result = match kind {
            ActivityKind::MouseControl => self.ctx.input.inject_mouse(event_type, data),
            _ => self.ctx.input.inject_keyboard(event_type, data),
        };
        if let Err(e) = result {
            warn!(client = %name, "input injection failed: {e}");
        }

        // Sampled activity trail; recording every event would swamp
        // the store.
        let rate = match kind {
            ActivityKind::MouseControl => self.ctx.config.telemetry.mouse_sample_rate,
            _ => self.ctx.config.telemetry.keyboard_sample_rate,
        };
        if rand::random::<f64>() < rate {
            if let Some(session_id) = handle.persisted.get().cloned() {
                let store = Arc::clone(&self.ctx.store);
                let details = event_type.to_owned();
                tokio::spawn(async move {
                    if let Err(e) = store.record_activity(&session_id, kind, &details).await {
                        warn!("failed to record input activity: {e}");
                    }
                });
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Idempotent teardown: releases input control, removes the
    /// session from the registry, and ends the persisted session.
    /// A second call observes Closing/Closed and returns.
    pub async fn close(&self, name: &str, handle: &SessionHandle, reason: &str) {
        {
            let mut state = self.state.lock().expect("session state lock poisoned");
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        debug!(client = %name, %reason, "closing session");

        self.cancel.cancel();
        self.ctx.arbiter.release(name).await;
        self.ctx.registry.unregister(name);

        if let Some(session_id) = handle.persisted.get().cloned() {
            let store = Arc::clone(&self.ctx.store);
            let who = name.to_owned();
            tokio::spawn(async move {
                if let Err(e) = store
                    .record_activity(&session_id, ActivityKind::Disconnect, &who)
                    .await
                {
                    warn!("failed to record disconnect: {e}");
                }
                if let Err(e) = store.end_session(&session_id).await {
                    warn!("failed to end persisted session: {e}");
                }
            });
        }

        self.set_state(SessionState::Closed);
    }
}
