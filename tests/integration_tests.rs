//! Integration tests for the relay server and client over real TCP
//!
//! Every test starts its own server on an ephemeral loopback port and drives
//! it with the client library's protocol engine or with raw frames.

use client::config::ClientConfig;
use client::connection::{ProtocolEngine, SessionEnd};
use server::{Server, ServerSettings, ServerState};
use shared::{
    read_frame, write_frame, ClientHandshake, ClientMessageKind, ServerMessageKind,
    MAX_FRAME_LENGTH,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    handle: JoinHandle<Result<(), server::fault::ServerFault>>,
}

impl TestServer {
    async fn start(max_clients: usize) -> Self {
        let settings = ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_clients,
            updates_per_second: 10,
            ..ServerSettings::default()
        };
        let server = Server::with_sink(settings, None).await.unwrap();
        let addr = server.local_addr();
        let state = server.state();
        let handle = tokio::spawn(server.run());
        TestServer {
            addr,
            state,
            handle,
        }
    }

    async fn stop(self) {
        self.state.shutdown_token().cancel();
        let result = timeout(STEP_TIMEOUT, self.handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}

struct TestClient {
    engine: Arc<ProtocolEngine>,
    receiver: JoinHandle<SessionEnd>,
}

impl TestClient {
    async fn connect(addr: SocketAddr, username: &str) -> Self {
        let config = ClientConfig::new(username, addr.to_string(), "unused");
        let (engine, reader) = ProtocolEngine::connect(&config).await.unwrap();
        let engine = Arc::new(engine);
        let receiver = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run_receiver(reader).await })
        };
        TestClient { engine, receiver }
    }

    async fn end(self) -> SessionEnd {
        timeout(STEP_TIMEOUT, self.receiver).await.unwrap().unwrap()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        sleep(Duration::from_millis(10)).await;
    }
}

async fn joined(server: &TestServer, username: &str) -> TestClient {
    let client = TestClient::connect(server.addr, username).await;
    let state = Arc::clone(&server.state);
    let name = username.to_string();
    wait_until(|| state.slots.ready_usernames().contains(&name)).await;
    client
}

/// HANDSHAKE AND MEMBERSHIP TESTS
mod handshake_tests {
    use super::*;

    /// Tests that the engine answers the server handshake and becomes ready
    #[tokio::test]
    async fn client_handshake_completes() {
        let server = TestServer::start(4).await;
        let alice = joined(&server, "alice").await;

        assert!(alice.engine.is_handshaken());
        assert_eq!(
            alice.engine.server_version().as_deref(),
            Some(shared::PROGRAM_VERSION)
        );
        assert_eq!(server.state.slots.active_count(), 1);

        server.stop().await;
    }

    /// Tests that a case-insensitive duplicate name is turned away
    #[tokio::test]
    async fn duplicate_username_disconnected() {
        let server = TestServer::start(4).await;
        let _alice = joined(&server, "Alice").await;

        let imposter = TestClient::connect(server.addr, "ALICE").await;
        assert_eq!(
            imposter.end().await,
            SessionEnd::Disconnected("Your username is already in use.".to_string())
        );

        let state = Arc::clone(&server.state);
        wait_until(|| state.slots.active_count() == 1).await;
        assert_eq!(server.state.slots.ready_usernames(), vec!["Alice"]);

        server.stop().await;
    }

    /// Tests that a connection beyond capacity is refused with a reason
    #[tokio::test]
    async fn full_server_refuses() {
        let server = TestServer::start(1).await;
        let _alice = joined(&server, "alice").await;

        let late = TestClient::connect(server.addr, "bob").await;
        assert_eq!(
            late.end().await,
            SessionEnd::Refused("Server is currently full".to_string())
        );
        assert_eq!(server.state.slots.active_count(), 1);

        server.stop().await;
    }

    /// Tests that membership changes push new settings to everyone
    #[tokio::test]
    async fn settings_follow_membership() {
        let server = TestServer::start(4).await;
        let alice = joined(&server, "alice").await;
        let _bob = joined(&server, "bob").await;
        let _carol = joined(&server, "carol").await;

        let engine = Arc::clone(&alice.engine);
        wait_until(|| engine.settings().max_queued_updates == 4).await;
        assert_eq!(alice.engine.settings().update_interval, 300);

        server.stop().await;
    }

    /// Tests that a silent raw connection that never handshakes is dropped
    #[tokio::test]
    async fn unhandshaken_connection_times_out() {
        let server = TestServer::start(2).await;
        let mut raw = TcpStream::connect(server.addr).await.unwrap();

        let mut last_kind = None;
        let result = timeout(Duration::from_secs(8), async {
            loop {
                match read_frame(&mut raw, MAX_FRAME_LENGTH).await {
                    Ok(frame) => last_kind = frame.kind::<ServerMessageKind>().ok(),
                    Err(_) => break,
                }
            }
        })
        .await;

        assert!(result.is_ok(), "server kept the connection open");
        assert_eq!(last_kind, Some(ServerMessageKind::ConnectionEnd));
        let state = Arc::clone(&server.state);
        wait_until(|| state.slots.active_count() == 0).await;

        server.stop().await;
    }
}

/// RELAY TESTS
mod relay_tests {
    use super::*;

    /// Tests that a state update reaches the other clients but not its sender
    #[tokio::test]
    async fn state_update_relayed_to_others_only() {
        let server = TestServer::start(4).await;
        let alice = joined(&server, "alice").await;
        let bob = joined(&server, "bob").await;
        let carol = joined(&server, "carol").await;

        alice.engine.send_state_update(b"vessel-state").await.unwrap();

        for watcher in [&bob, &carol] {
            let engine = Arc::clone(&watcher.engine);
            wait_until(|| engine.has_relay_updates()).await;
            assert_eq!(
                watcher.engine.take_relay_updates(),
                vec![b"vessel-state".to_vec()]
            );
        }

        sleep(Duration::from_millis(100)).await;
        assert!(!alice.engine.has_relay_updates());

        server.stop().await;
    }

    /// Tests chat prefixing and join/leave notices
    #[tokio::test]
    async fn chat_and_presence_messages() {
        let server = TestServer::start(4).await;
        let alice = joined(&server, "alice").await;
        let bob = joined(&server, "bob").await;

        bob.engine.send_text("hello").await.unwrap();

        let engine = Arc::clone(&alice.engine);
        let mut seen = Vec::new();
        wait_until(|| {
            seen.extend(engine.take_text_messages());
            seen.iter().any(|m| m.message == "[bob] hello")
        })
        .await;
        assert!(seen
            .iter()
            .any(|m| m.from_server && m.message == "User bob has joined the server."));

        bob.engine.disconnect("Quit").await;
        let mut seen = Vec::new();
        wait_until(|| {
            seen.extend(engine.take_text_messages());
            seen.iter()
                .any(|m| m.from_server && m.message == "User bob has disconnected : Quit")
        })
        .await;
        assert_eq!(bob.end().await, SessionEnd::Quit);

        let state = Arc::clone(&server.state);
        wait_until(|| state.slots.active_count() == 1).await;

        server.stop().await;
    }

    /// Tests that screenshots go only to the client watching the sender
    #[tokio::test]
    async fn screenshot_goes_to_watcher() {
        let server = TestServer::start(4).await;
        let alice = joined(&server, "alice").await;
        let bob = joined(&server, "bob").await;
        let carol = joined(&server, "carol").await;

        bob.engine.send_watch_player("alice").await.unwrap();
        let state = Arc::clone(&server.state);
        wait_until(|| {
            state
                .slots
                .iter()
                .any(|slot| slot.is_ready() && slot.is_watching("alice"))
        })
        .await;

        let screenshot = vec![0x89, b'P', b'N', b'G', 1, 2, 3];
        alice.engine.share_screenshot(&screenshot).await.unwrap();

        let engine = Arc::clone(&bob.engine);
        let mut received = None;
        wait_until(|| {
            received = received.take().or_else(|| engine.take_screenshot());
            received.is_some()
        })
        .await;
        assert_eq!(received, Some(screenshot));

        sleep(Duration::from_millis(100)).await;
        assert_eq!(carol.engine.take_screenshot(), None);
        assert_eq!(alice.engine.take_screenshot(), None);

        server.stop().await;
    }

    /// Tests the `!list` roster command over the wire
    #[tokio::test]
    async fn roster_command() {
        let server = TestServer::start(4).await;
        let alice = joined(&server, "alice").await;
        let _bob = joined(&server, "bob").await;

        alice.engine.send_text("!list").await.unwrap();

        let engine = Arc::clone(&alice.engine);
        let mut seen = Vec::new();
        wait_until(|| {
            seen.extend(engine.take_text_messages());
            seen.iter()
                .any(|m| m.from_server && m.message == "Connected users:\nalice\nbob\n")
        })
        .await;

        server.stop().await;
    }
}

/// RAW PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Tests the server's message order for a raw connection
    #[tokio::test]
    async fn raw_handshake_sequence() {
        let server = TestServer::start(2).await;
        let mut raw = TcpStream::connect(server.addr).await.unwrap();

        let first = timeout(STEP_TIMEOUT, read_frame(&mut raw, MAX_FRAME_LENGTH))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first.kind::<ServerMessageKind>().unwrap(),
            ServerMessageKind::Handshake
        );

        write_frame(
            &mut raw,
            ClientMessageKind::Handshake,
            &ClientHandshake::new("raw", "test").encode(),
        )
        .await
        .unwrap();

        let mut kinds = Vec::new();
        while !kinds.contains(&ServerMessageKind::ServerMessage) {
            let frame = timeout(STEP_TIMEOUT, read_frame(&mut raw, MAX_FRAME_LENGTH))
                .await
                .unwrap()
                .unwrap();
            kinds.push(frame.kind::<ServerMessageKind>().unwrap());
        }
        assert!(kinds.contains(&ServerMessageKind::Settings));

        server.stop().await;
    }

    /// Tests that a malformed handshake disconnects only the offender
    #[tokio::test]
    async fn malformed_handshake_disconnects_sender_only() {
        let server = TestServer::start(4).await;
        let alice = joined(&server, "alice").await;

        let mut raw = TcpStream::connect(server.addr).await.unwrap();
        write_frame(&mut raw, ClientMessageKind::Handshake, &[255, 255, 0, 0, b'x'])
            .await
            .unwrap();

        let ended = timeout(STEP_TIMEOUT, async {
            while read_frame(&mut raw, MAX_FRAME_LENGTH).await.is_ok() {}
        })
        .await;
        assert!(ended.is_ok());

        let state = Arc::clone(&server.state);
        wait_until(|| state.slots.active_count() == 1).await;
        assert!(alice.engine.is_handshaken());
        assert!(!alice.engine.shutdown_token().is_cancelled());

        server.stop().await;
    }

    /// Tests that stopping the server ends client sessions
    #[tokio::test]
    async fn shutdown_ends_sessions() {
        let server = TestServer::start(2).await;
        let alice = joined(&server, "alice").await;

        server.stop().await;
        assert_eq!(alice.end().await, SessionEnd::ConnectionLost);
    }
}
