//! The client-side engine: connects to a host, authenticates, and
//! surfaces everything the host sends as engine events.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventBus};
use visor_core::{ClientCodec, ClientFrame, HostFrame, VisorError};

/// A connection to a remote host engine.
///
/// [`connect`](Self::connect) performs the full handshake before
/// returning, so a successfully constructed `ClientEngine` is Active.
/// Incoming traffic is dispatched to the returned event receiver by a
/// background task; outgoing frames go through the `send_*` methods.
pub struct ClientEngine {
    outbound: mpsc::Sender<ClientFrame>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    name: String,
}

impl ClientEngine {
    /// Connect, authenticate, and start the dispatch task. The
    /// returned receiver is subscribed before dispatch starts, so no
    /// event can be missed.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        name: &str,
        password: &str,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>), VisorError> {
        let events = Arc::new(EventBus::new());
        let receiver = events.subscribe();

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                events.emit(EngineEvent::ConnectionFailed {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };
        let mut framed = Framed::new(stream, ClientCodec::new());

        framed
            .send(ClientFrame::Authenticate {
                password: password.to_owned(),
                name: name.to_owned(),
            })
            .await?;

        match framed.next().await {
            Some(Ok(HostFrame::AuthResult { success: true, .. })) => {}
            Some(Ok(HostFrame::AuthResult { message, .. })) => {
                events.emit(EngineEvent::ConnectionFailed {
                    reason: message.clone(),
                });
                return Err(VisorError::auth(message));
            }
            Some(Ok(other)) => {
                let reason = format!("unexpected handshake reply: {}", other.kind());
                events.emit(EngineEvent::ConnectionFailed {
                    reason: reason.clone(),
                });
                return Err(VisorError::auth(reason));
            }
            Some(Err(e)) => {
                events.emit(EngineEvent::ConnectionFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
            None => {
                events.emit(EngineEvent::ConnectionFailed {
                    reason: "connection closed during handshake".to_owned(),
                });
                return Err(VisorError::Incomplete);
            }
        }

        info!(%name, "connected to host");
        events.emit(EngineEvent::Connected);

        let (outbound, outbound_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let engine = Self {
            outbound,
            events: Arc::clone(&events),
            cancel: cancel.clone(),
            name: name.to_owned(),
        };

        tokio::spawn(dispatch(framed, outbound_rx, events, cancel));
        Ok((engine, receiver))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe another event receiver.
    pub fn subscribe(&self) -> mpsc::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn send_chat(&self, text: &str) -> Result<(), VisorError> {
        visor_core::validate_str(text)?;
        self.send(ClientFrame::Chat {
            content: text.to_owned(),
        })
        .await
    }

    pub async fn send_file(&self, name: &str, data: Bytes) -> Result<(), VisorError> {
        visor_core::validate_str(name)?;
        self.send(ClientFrame::File {
            name: name.to_owned(),
            data,
        })
        .await
    }

    /// Forward a mouse event. The host drops it unless this client
    /// holds input control.
    pub async fn send_mouse(&self, event_type: &str, data: Bytes) -> Result<(), VisorError> {
        visor_core::validate_str(event_type)?;
        self.send(ClientFrame::Mouse {
            event_type: event_type.to_owned(),
            data,
        })
        .await
    }

    pub async fn send_keyboard(&self, event_type: &str, data: Bytes) -> Result<(), VisorError> {
        visor_core::validate_str(event_type)?;
        self.send(ClientFrame::Keyboard {
            event_type: event_type.to_owned(),
            data,
        })
        .await
    }

    /// Tell the host we are leaving, then tear the connection down.
    pub async fn disconnect(&self) {
        let _ = self.send(ClientFrame::Disconnect).await;
        self.cancel.cancel();
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), VisorError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| VisorError::ChannelClosed)
    }
}

impl Drop for ClientEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Owns the socket after the handshake: writes queued outbound frames
/// and turns inbound frames into events until the connection ends.
async fn dispatch(
    framed: Framed<TcpStream, ClientCodec>,
    mut outbound_rx: mpsc::Receiver<ClientFrame>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
) {
    let (mut sink, mut inbound) = framed.split();

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "disconnected".to_owned(),
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    break "engine dropped".to_owned();
                };
                if let Err(e) = sink.send(frame).await {
                    break format!("send failed: {e}");
                }
            }
            frame = inbound.next() => match frame {
                Some(Ok(frame)) => handle_host_frame(&events, frame),
                Some(Err(e)) => {
                    warn!("protocol error: {e}");
                    break format!("protocol error: {e}");
                }
                None => break "connection closed by host".to_owned(),
            },
        }
    };

    let _ = sink.close().await;
    debug!(%reason, "client dispatch ended");
    events.emit(EngineEvent::Disconnected { reason });
}

fn handle_host_frame(events: &EventBus, frame: HostFrame) {
    match frame {
        HostFrame::Screen { data } => events.emit(EngineEvent::ScreenUpdated { data }),
        HostFrame::Chat { sender, content } => events.emit(EngineEvent::ChatReceived {
            sender,
            text: content,
        }),
        HostFrame::File { sender, name, data } => {
            events.emit(EngineEvent::FileReceived { sender, name, data })
        }
        HostFrame::ControlGrant => events.emit(EngineEvent::ControlGranted),
        HostFrame::ControlRevoke => events.emit(EngineEvent::ControlRevoked),
        HostFrame::AuthResult { .. } => {
            debug!("auth result after handshake ignored");
        }
    }
}
