//! The host-side engine: listener, capture pipeline, and the
//! operations the embedding application drives it with.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broadcast::Broadcaster;
use crate::capture::CapturePipeline;
use crate::config::HostConfig;
use crate::control::ControlArbiter;
use crate::events::{EngineEvent, EventBus};
use crate::platform::{InputSink, ScreenSource};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionContext};
use crate::store::{ActivityKind, SessionStore};
use visor_core::VisorError;

/// One host sharing its screen and input with authenticated peers.
///
/// Construction wires the collaborators; [`start`](Self::start) binds
/// the listener and spawns the capture pipeline and accept loop.
/// Platform and persistence collaborators are injected, never looked
/// up from ambient globals.
pub struct HostEngine {
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl HostEngine {
    pub fn new(
        config: HostConfig,
        source: Arc<dyn ScreenSource>,
        input: Arc<dyn InputSink>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&events)));
        let ctx = Arc::new(SessionContext {
            arbiter: Arc::new(ControlArbiter::new(
                Arc::clone(&registry),
                Arc::clone(&events),
            )),
            broadcaster: Arc::new(Broadcaster::new(
                Arc::clone(&registry),
                Arc::clone(&store),
                Arc::clone(&events),
                config.network.host_name.clone(),
            )),
            pipeline: Arc::new(CapturePipeline::new(source, &config.capture)),
            input,
            registry,
            store,
            events,
            config,
        });
        Self {
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    /// Bind the listener, start the capture pipeline, and begin
    /// accepting peers. Returns the bound address (useful when the
    /// configured port is 0).
    pub async fn start(&self) -> Result<SocketAddr, VisorError> {
        let bind = format!(
            "{}:{}",
            self.ctx.config.network.bind_addr, self.ctx.config.network.port
        );
        let listener = TcpListener::bind(&bind).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "host engine listening");

        {
            let pipeline = Arc::clone(&self.ctx.pipeline);
            tokio::spawn(async move { pipeline.run().await });
        }

        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer_addr)) => {
                        info!(%peer_addr, "peer connected");
                        let session = Arc::new(Session::new(
                            Arc::clone(&ctx),
                            peer_addr,
                            cancel.child_token(),
                        ));
                        tokio::spawn(session.run(stream));
                    }
                    Err(e) => {
                        // Transient accept errors (EMFILE and friends);
                        // keep the listener alive.
                        error!("accept failed: {e}");
                    }
                }
            }
            info!("accept loop stopped");
        });

        Ok(addr)
    }

    /// Stop accepting, cancel every session, and stop the pipeline.
    pub fn stop(&self) {
        info!("host engine stopping");
        self.cancel.cancel();
        self.ctx.pipeline.stop();
        for session in self.ctx.registry.drain() {
            session.cancel.cancel();
        }
    }

    // ── Operations ───────────────────────────────────────────────

    /// Give input control to the named client, revoking any current
    /// holder first.
    pub async fn grant_control(&self, name: &str) {
        self.ctx.arbiter.grant(name).await;
        self.record_control_activity(name, ActivityKind::ControlGrant);
    }

    /// Take input control back from the named client.
    pub async fn revoke_control(&self, name: &str) {
        self.ctx.arbiter.revoke(name).await;
        self.record_control_activity(name, ActivityKind::ControlRevoke);
    }

    fn record_control_activity(&self, name: &str, kind: ActivityKind) {
        let Some(session) = self.ctx.registry.lookup(name) else {
            return;
        };
        let Some(session_id) = session.persisted.get().cloned() else {
            return;
        };
        let store = Arc::clone(&self.ctx.store);
        let who = name.to_owned();
        tokio::spawn(async move {
            if let Err(e) = store.record_activity(&session_id, kind, &who).await {
                warn!("failed to record control activity: {e}");
            }
        });
    }

    /// Name of the current input-control holder, if any.
    pub async fn control_holder(&self) -> Option<String> {
        self.ctx.arbiter.holder().await
    }

    /// Broadcast a chat line from the host to every client.
    pub async fn send_chat(&self, text: &str) {
        self.ctx
            .broadcaster
            .chat(&self.ctx.config.network.host_name, text, None)
            .await;
    }

    /// Broadcast a file from the host to every client.
    pub async fn send_file(&self, name: &str, data: bytes::Bytes) {
        self.ctx
            .broadcaster
            .file(&self.ctx.config.network.host_name, name, data, None)
            .await;
    }

    /// Pin the capture rate (disables auto-adjust).
    pub fn set_target_fps(&self, fps: u32) {
        self.ctx.pipeline.set_target_fps(fps);
    }

    /// Re-enable or disable capture-rate auto-adjustment.
    pub fn set_auto_fps(&self, enable: bool) {
        self.ctx.pipeline.set_auto_adjust(enable);
    }

    /// Change the JPEG quality factor for subsequent frames.
    pub fn set_quality(&self, quality: f32) {
        if !(0.0..=1.0).contains(&quality) {
            warn!(%quality, "quality outside 0.0..=1.0 clamped");
        }
        self.ctx.pipeline.set_quality(quality);
    }

    pub fn current_fps(&self) -> u32 {
        self.ctx.pipeline.current_fps()
    }

    /// Names of all connected clients.
    pub fn connected_clients(&self) -> Vec<String> {
        self.ctx
            .registry
            .snapshot()
            .into_iter()
            .map(|s| s.name)
            .collect()
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> tokio::sync::mpsc::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }
}

impl Drop for HostEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.ctx.pipeline.stop();
    }
}
