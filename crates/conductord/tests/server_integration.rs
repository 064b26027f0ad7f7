//! Integration tests for the TCP server.
//!
//! These tests run a complete [`Conductor`] on an ephemeral loopback port and
//! talk to it the way telnet or netcat would: greeting, echo, heartbeat,
//! broadcast, quit and shutdown.
//!
//! Tests CAN use `.unwrap()` and `.expect()`. The panic-free behavior of the
//! production code is checked through assertions.

use std::net::SocketAddr;
use std::time::Duration;

use conductor_core::Settings;
use conductord::Conductor;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for any single line from the server
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum time to wait for the registry to reach an expected size
const REGISTRY_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between registry checks
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tick rate used for both schedulers in tests
const FAST_TICK: Duration = Duration::from_millis(10);

// ============================================================================
// Test Helpers
// ============================================================================

fn test_settings() -> Settings {
    Settings {
        server_name: "Test".to_string(),
        host_port: 0,
        comm_tick_rate: FAST_TICK,
        state_tick_rate: FAST_TICK,
        // Keep heartbeats out of the way unless a test asks for them.
        heartbeat_every: 1_000_000,
        resolve_timeout: Duration::ZERO,
        ..Settings::default()
    }
}

/// A started server that is shut down by the test.
struct TestServer {
    conductor: Conductor,
    addr: SocketAddr,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(test_settings()).await
    }

    async fn spawn_with(settings: Settings) -> Self {
        let conductor = Conductor::new(settings);
        conductor.start().await.expect("server should start");
        let addr = conductor.local_addr().expect("server should be bound");
        Self { conductor, addr }
    }

    /// Connects and consumes the greeting.
    async fn connect(&self) -> TestClient {
        let mut client = self.connect_raw().await;
        let greeting = client.read_line().await.expect("greeting");
        assert!(greeting.starts_with("Welcome to"), "unexpected greeting {greeting:?}");
        client
    }

    async fn connect_raw(&self) -> TestClient {
        let stream = TcpStream::connect(self.addr).await.expect("connect to server");
        TestClient::new(stream)
    }

    async fn wait_for_sessions(&self, expected: usize) {
        let registry = self.conductor.registry();
        let start = tokio::time::Instant::now();
        while start.elapsed() < REGISTRY_WAIT_TIMEOUT {
            if registry.len() == expected {
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
        panic!(
            "registry has {} sessions, expected {expected} within {REGISTRY_WAIT_TIMEOUT:?}",
            registry.len()
        );
    }

    async fn shutdown(self) {
        self.conductor.shutdown().await;
    }
}

/// Client connection with line helpers.
struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    /// Reads one raw line, terminator included. `None` on EOF.
    async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .ok()?;
        if n == 0 {
            None
        } else {
            Some(line)
        }
    }

    /// Reads lines until one starts with `prefix`, skipping everything else.
    async fn read_until_prefix(&mut self, prefix: &str) -> String {
        loop {
            let line = self.read_line().await.expect("connection closed early");
            if line.starts_with(prefix) {
                return line.trim_end().to_string();
            }
        }
    }

    /// Fails if a line starting with `prefix` arrives within `window`.
    async fn expect_none_with_prefix(&mut self, prefix: &str, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let mut line = String::new();
            match tokio::time::timeout_at(deadline, self.reader.read_line(&mut line)).await {
                Err(_) | Ok(Ok(0)) | Ok(Err(_)) => return,
                Ok(Ok(_)) => assert!(!line.starts_with(prefix), "unexpected line {line:?}"),
            }
        }
    }

    /// Reads until the server closes the connection.
    async fn expect_closed(&mut self) {
        while self.read_line().await.is_some() {}
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_greeting_is_sent_raw_on_connect() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_raw().await;

    let greeting = client.read_line().await.expect("greeting");
    assert_eq!(greeting, "Welcome to Test.\r\n");

    server.shutdown().await;
}

#[tokio::test]
async fn test_empty_greeting_is_not_sent() {
    let settings = Settings {
        greeting: String::new(),
        ..test_settings()
    };
    let server = TestServer::spawn_with(settings).await;
    let mut client = server.connect_raw().await;
    server.wait_for_sessions(1).await;

    client.send("ping\n").await;
    assert_eq!(client.read_line().await.as_deref(), Some("Echo: ping\n"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_echo() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send("ping\n").await;
    assert_eq!(client.read_until_prefix("Echo:").await, "Echo: ping");
    // Several state ticks pass; the line must not be answered twice.
    client.expect_none_with_prefix("Echo:", FAST_TICK * 15).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_crlf_terminated_lines_echo_cleanly() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send("hello there\r\n").await;
    let line = client.read_line().await.expect("echo");
    assert_eq!(line, "Echo: hello there\n");

    server.shutdown().await;
}

#[tokio::test]
async fn test_lines_are_answered_in_order() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send("one\ntwo\n\n   \nthree\n").await;
    assert_eq!(client.read_until_prefix("Echo:").await, "Echo: one");
    assert_eq!(client.read_until_prefix("Echo:").await, "Echo: two");
    assert_eq!(client.read_until_prefix("Echo:").await, "Echo: three");

    server.shutdown().await;
}

#[tokio::test]
async fn test_quit_in_any_case_ends_session() {
    let server = TestServer::spawn().await;

    for quit in ["quit", "QUIT", "Quit", "  quit  "] {
        let mut client = server.connect().await;
        server.wait_for_sessions(1).await;

        client.send(&format!("{quit}\r\n")).await;
        client.expect_closed().await;
        server.wait_for_sessions(0).await;
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_lines_after_quit_are_not_answered() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send("before\nquit\nafter\n").await;
    assert_eq!(client.read_until_prefix("Echo:").await, "Echo: before");

    while let Some(line) = client.read_line().await {
        assert!(!line.contains("after"), "line after quit was answered: {line:?}");
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_control_characters_are_echoed() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    server.wait_for_sessions(1).await;

    client.send("go \x1b[Aup\n").await;
    assert_eq!(client.read_until_prefix("Echo:").await, "Echo: go \x1b[Aup");

    client.send("bad\x07bell\n").await;
    assert_eq!(client.read_until_prefix("Echo:").await, "Echo: bad\x07bell");
    assert_eq!(server.conductor.registry().len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat() {
    let settings = Settings {
        heartbeat_every: 2,
        ..test_settings()
    };
    let server = TestServer::spawn_with(settings).await;
    let mut client = server.connect().await;

    let line = client.read_until_prefix("Tick ").await;
    let tick: u64 = line
        .strip_prefix("Tick ")
        .and_then(|rest| rest.strip_suffix(" from Test."))
        .expect("heartbeat format")
        .parse()
        .expect("tick number");
    assert_eq!(tick % 2, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_session() {
    let server = TestServer::spawn().await;
    let mut first = server.connect().await;
    let mut second = server.connect().await;
    server.wait_for_sessions(2).await;

    server.conductor.registry().broadcast("hello all").await;

    assert_eq!(first.read_until_prefix("Broadcast:").await, "Broadcast: hello all");
    assert_eq!(second.read_until_prefix("Broadcast:").await, "Broadcast: hello all");

    server.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_with_no_sessions() {
    let server = TestServer::spawn().await;
    server.conductor.registry().broadcast("anyone?").await;
    assert!(server.conductor.registry().is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_many_connections_are_tracked() {
    let server = TestServer::spawn().await;

    let mut clients = Vec::new();
    for _ in 0..10 {
        clients.push(server.connect().await);
    }
    server.wait_for_sessions(10).await;

    let ids: Vec<u64> = server
        .conductor
        .registry()
        .snapshot()
        .iter()
        .map(|s| s.id().get())
        .collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(ids, sorted, "snapshot must be ordered by unique identity");

    drop(clients);
    server.wait_for_sessions(0).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;
    server.wait_for_sessions(1).await;
    let addr = server.addr;
    let registry = std::sync::Arc::clone(server.conductor.registry());

    server.shutdown().await;

    client.expect_closed().await;
    assert!(registry.is_empty());
    assert!(!registry.is_accepting());
    assert!(TcpStream::connect(addr).await.is_err());
}
