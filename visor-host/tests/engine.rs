//! End-to-end tests driving a real host engine and real clients over
//! localhost TCP.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use visor_core::{ClientCodec, ClientFrame, VisorError};
use visor_host::{
    ClientEngine, EngineEvent, HostConfig, HostEngine, InputSink, MemoryStore, RawImage,
    ScreenSource, SessionStore,
};

const PASSWORD: &str = "s3cret";

// ── Test collaborators ───────────────────────────────────────────

struct TestScreen;

impl ScreenSource for TestScreen {
    fn capture(&self) -> Result<RawImage, VisorError> {
        Ok(RawImage {
            width: 16,
            height: 16,
            rgb: vec![0x20; 16 * 16 * 3],
        })
    }
}

/// Records every injected event for assertions.
#[derive(Default)]
struct RecordingInput {
    injected: Mutex<Vec<(String, String)>>,
}

impl RecordingInput {
    fn injected(&self) -> Vec<(String, String)> {
        self.injected.lock().unwrap().clone()
    }
}

impl InputSink for RecordingInput {
    fn inject_mouse(&self, event_type: &str, _data: &[u8]) -> Result<(), VisorError> {
        self.injected
            .lock()
            .unwrap()
            .push(("mouse".into(), event_type.into()));
        Ok(())
    }

    fn inject_keyboard(&self, event_type: &str, _data: &[u8]) -> Result<(), VisorError> {
        self.injected
            .lock()
            .unwrap()
            .push(("keyboard".into(), event_type.into()));
        Ok(())
    }
}

struct Harness {
    engine: HostEngine,
    addr: std::net::SocketAddr,
    store: Arc<MemoryStore>,
    input: Arc<RecordingInput>,
}

async fn start_host() -> Harness {
    let mut config = HostConfig::default();
    config.network.bind_addr = "127.0.0.1".into();
    config.network.port = 0;
    config.network.password = PASSWORD.into();

    let store = Arc::new(MemoryStore::new());
    let input = Arc::new(RecordingInput::default());
    let engine = HostEngine::new(
        config,
        Arc::new(TestScreen),
        Arc::clone(&input) as Arc<dyn InputSink>,
        Arc::clone(&store) as Arc<dyn SessionStore>,
    );
    let addr = engine.start().await.expect("host failed to start");
    Harness {
        engine,
        addr,
        store,
        input,
    }
}

/// Wait for the first event matching `pred`, skipping screen traffic
/// and anything else in between.
async fn wait_for<F>(rx: &mut mpsc::Receiver<EngineEvent>, mut pred: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ── Handshake ────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_password_is_rejected() {
    let host = start_host().await;

    let err = ClientEngine::connect(host.addr, "alice", "wrong")
        .await
        .err()
        .expect("connect must fail");
    match err {
        VisorError::Auth { message } => assert_eq!(message, "Invalid password"),
        other => panic!("expected auth error, got {other:?}"),
    }

    host.engine.stop();
}

#[tokio::test]
async fn duplicate_name_admits_exactly_one() {
    let host = start_host().await;

    let (a, b) = tokio::join!(
        ClientEngine::connect(host.addr, "dave", PASSWORD),
        ClientEngine::connect(host.addr, "dave", PASSWORD),
    );

    let successes = [a.is_ok(), b.is_ok()].iter().filter(|&&ok| ok).count();
    assert_eq!(successes, 1, "exactly one claim of the name may win");

    let message = match (a, b) {
        (Err(VisorError::Auth { message }), Ok(_))
        | (Ok(_), Err(VisorError::Auth { message })) => message,
        (Err(e), _) | (_, Err(e)) => panic!("expected one auth rejection, got {e:?}"),
        _ => unreachable!(),
    };
    assert_eq!(message, "Name already in use");

    host.engine.stop();
}

#[tokio::test]
async fn name_reusable_after_disconnect() {
    let host = start_host().await;

    let (first, mut first_events) = ClientEngine::connect(host.addr, "erin", PASSWORD)
        .await
        .expect("first connect");
    let mut host_events = host.engine.subscribe();
    first.disconnect().await;
    wait_for(&mut first_events, |e| {
        matches!(e, EngineEvent::Disconnected { .. })
    })
    .await;
    wait_for(&mut host_events, |e| {
        matches!(e, EngineEvent::ClientDisconnected { name } if name == "erin")
    })
    .await;

    let second = ClientEngine::connect(host.addr, "erin", PASSWORD).await;
    assert!(second.is_ok(), "name must be free once its holder left");

    host.engine.stop();
}

#[tokio::test]
async fn non_auth_first_frame_closes_connection() {
    let host = start_host().await;

    let stream = TcpStream::connect(host.addr).await.unwrap();
    let mut framed = Framed::new(stream, ClientCodec::new());
    framed
        .send(ClientFrame::Chat {
            content: "sneaking in".into(),
        })
        .await
        .unwrap();

    // The host hangs up without an auth result.
    let reply = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("host did not react");
    assert!(reply.is_none(), "expected EOF, got {reply:?}");

    host.engine.stop();
}

// ── Screen and chat ──────────────────────────────────────────────

#[tokio::test]
async fn client_receives_screen_frames() {
    let host = start_host().await;

    let (_client, mut events) = ClientEngine::connect(host.addr, "fred", PASSWORD)
        .await
        .expect("connect");

    let event = wait_for(&mut events, |e| {
        matches!(e, EngineEvent::ScreenUpdated { .. })
    })
    .await;
    let EngineEvent::ScreenUpdated { data } = event else {
        unreachable!()
    };
    // JPEG SOI marker.
    assert_eq!(&data[..2], &[0xFF, 0xD8]);

    host.engine.stop();
}

#[tokio::test]
async fn chat_reaches_everyone_but_sender() {
    let host = start_host().await;

    let (alice, mut alice_events) = ClientEngine::connect(host.addr, "alice", PASSWORD)
        .await
        .expect("alice");
    let (_bob, mut bob_events) = ClientEngine::connect(host.addr, "bob", PASSWORD)
        .await
        .expect("bob");
    let mut host_events = host.engine.subscribe();

    alice.send_chat("hello all").await.unwrap();

    let event = wait_for(&mut bob_events, |e| {
        matches!(e, EngineEvent::ChatReceived { .. })
    })
    .await;
    assert_eq!(
        event,
        EngineEvent::ChatReceived {
            sender: "alice".into(),
            text: "hello all".into(),
        }
    );

    // The host UI sees it too.
    wait_for(&mut host_events, |e| {
        matches!(e, EngineEvent::ChatReceived { sender, .. } if sender == "alice")
    })
    .await;

    // The sender must not get an echo. Anything queued for alice by
    // now is screen traffic only.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = alice_events.try_recv() {
        assert!(
            !matches!(event, EngineEvent::ChatReceived { .. }),
            "originator received its own chat"
        );
    }

    host.engine.stop();
}

#[tokio::test]
async fn host_chat_and_file_reach_clients() {
    let host = start_host().await;

    let (_alice, mut alice_events) = ClientEngine::connect(host.addr, "alice", PASSWORD)
        .await
        .expect("alice");

    host.engine.send_chat("welcome").await;
    let event = wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::ChatReceived { .. })
    })
    .await;
    assert_eq!(
        event,
        EngineEvent::ChatReceived {
            sender: "host".into(),
            text: "welcome".into(),
        }
    );

    let payload = Bytes::from_static(b"report body");
    host.engine.send_file("report.txt", payload.clone()).await;
    let event = wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::FileReceived { .. })
    })
    .await;
    assert_eq!(
        event,
        EngineEvent::FileReceived {
            sender: "host".into(),
            name: "report.txt".into(),
            data: payload,
        }
    );

    host.engine.stop();
}

// ── Input control ────────────────────────────────────────────────

#[tokio::test]
async fn control_moves_between_clients_revoke_first() {
    let host = start_host().await;

    let (_alice, mut alice_events) = ClientEngine::connect(host.addr, "alice", PASSWORD)
        .await
        .expect("alice");
    let (_bob, mut bob_events) = ClientEngine::connect(host.addr, "bob", PASSWORD)
        .await
        .expect("bob");

    host.engine.grant_control("alice").await;
    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::ControlGranted)
    })
    .await;
    assert_eq!(host.engine.control_holder().await.as_deref(), Some("alice"));

    host.engine.grant_control("bob").await;
    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::ControlRevoked)
    })
    .await;
    wait_for(&mut bob_events, |e| {
        matches!(e, EngineEvent::ControlGranted)
    })
    .await;
    assert_eq!(host.engine.control_holder().await.as_deref(), Some("bob"));

    host.engine.stop();
}

#[tokio::test]
async fn only_holder_input_is_injected() {
    let host = start_host().await;

    let (alice, mut alice_events) = ClientEngine::connect(host.addr, "alice", PASSWORD)
        .await
        .expect("alice");

    // No grant yet; this event must be dropped.
    alice
        .send_mouse("move", Bytes::from_static(&[1, 2]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(host.input.injected().is_empty());

    host.engine.grant_control("alice").await;
    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::ControlGranted)
    })
    .await;

    alice
        .send_mouse("click", Bytes::from_static(&[3, 4]))
        .await
        .unwrap();
    alice
        .send_keyboard("press", Bytes::from_static(&[5]))
        .await
        .unwrap();

    let injected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let injected = host.input.injected();
            if injected.len() >= 2 {
                return injected;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("input never reached the sink");
    assert_eq!(injected[0], ("mouse".into(), "click".into()));
    assert_eq!(injected[1], ("keyboard".into(), "press".into()));

    host.engine.stop();
}

#[tokio::test]
async fn holder_disconnect_releases_control() {
    let host = start_host().await;
    let mut host_events = host.engine.subscribe();

    let (alice, mut alice_events) = ClientEngine::connect(host.addr, "alice", PASSWORD)
        .await
        .expect("alice");
    let (_bob, mut bob_events) = ClientEngine::connect(host.addr, "bob", PASSWORD)
        .await
        .expect("bob");

    host.engine.grant_control("alice").await;
    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::ControlGranted)
    })
    .await;

    alice.disconnect().await;
    wait_for(&mut host_events, |e| {
        matches!(e, EngineEvent::ClientDisconnected { name } if name == "alice")
    })
    .await;
    assert_eq!(host.engine.control_holder().await, None);

    // A later grant must succeed without a ghost revoke.
    host.engine.grant_control("bob").await;
    wait_for(&mut bob_events, |e| {
        matches!(e, EngineEvent::ControlGranted)
    })
    .await;
    assert_eq!(host.engine.control_holder().await.as_deref(), Some("bob"));

    host.engine.stop();
}

// ── Persistence ──────────────────────────────────────────────────

#[tokio::test]
async fn session_persisted_and_ended_once() {
    let host = start_host().await;
    let mut host_events = host.engine.subscribe();

    let (alice, mut alice_events) = ClientEngine::connect(host.addr, "alice", PASSWORD)
        .await
        .expect("alice");

    // The bootstrap task runs off the protocol path; wait for it.
    let session_id = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(record) = host.store.sessions().first().cloned() {
                return record.id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never persisted");

    alice.disconnect().await;
    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::Disconnected { .. })
    })
    .await;
    wait_for(&mut host_events, |e| {
        matches!(e, EngineEvent::ClientDisconnected { .. })
    })
    .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if host.store.end_session_calls(&session_id) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never ended in the store");

    // Teardown ran exactly once.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host.store.end_session_calls(&session_id), 1);

    host.engine.stop();
}

#[tokio::test]
async fn file_from_client_is_rebroadcast() {
    let host = start_host().await;

    let (alice, _alice_events) = ClientEngine::connect(host.addr, "alice", PASSWORD)
        .await
        .expect("alice");
    let (_bob, mut bob_events) = ClientEngine::connect(host.addr, "bob", PASSWORD)
        .await
        .expect("bob");

    let payload = Bytes::from(vec![0xAB; 128 * 1024]);
    alice.send_file("dump.bin", payload.clone()).await.unwrap();

    let event = wait_for(&mut bob_events, |e| {
        matches!(e, EngineEvent::FileReceived { .. })
    })
    .await;
    let EngineEvent::FileReceived { sender, name, data } = event else {
        unreachable!()
    };
    assert_eq!(sender, "alice");
    assert_eq!(name, "dump.bin");
    assert_eq!(data, payload);

    host.engine.stop();
}

// ── Shutdown ─────────────────────────────────────────────────────

#[tokio::test]
async fn stop_disconnects_clients() {
    let host = start_host().await;

    let (_alice, mut alice_events) = ClientEngine::connect(host.addr, "alice", PASSWORD)
        .await
        .expect("alice");
    assert_eq!(host.engine.connected_clients(), vec!["alice".to_owned()]);

    host.engine.stop();

    wait_for(&mut alice_events, |e| {
        matches!(e, EngineEvent::Disconnected { .. })
    })
    .await;
    assert!(host.engine.connected_clients().is_empty());

    // The port is released; new connections are refused.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(host.addr).await.is_err());
}
