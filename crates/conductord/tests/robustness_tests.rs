//! Robustness tests for the conductor server.
//!
//! These tests check that misbehaving clients only ever hurt themselves:
//! - Oversized lines
//! - Invalid UTF-8 and binary noise
//! - Rapid connect/disconnect
//! - Clients that never read
//! - Restart of the same server
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::time::Duration;

use conductor_core::Settings;
use conductord::server::MAX_LINE_LENGTH;
use conductord::Conductor;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

// ============================================================================
// Constants
// ============================================================================

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const REGISTRY_WAIT_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Test Helpers
// ============================================================================

fn test_settings() -> Settings {
    Settings {
        host_port: 0,
        comm_tick_rate: Duration::from_millis(10),
        state_tick_rate: Duration::from_millis(10),
        heartbeat_every: 1_000_000,
        greeting: String::new(),
        resolve_timeout: Duration::ZERO,
        ..Settings::default()
    }
}

async fn start(settings: Settings) -> Conductor {
    let conductor = Conductor::new(settings);
    conductor.start().await.expect("server should start");
    conductor
}

async fn connect(conductor: &Conductor) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let addr = conductor.local_addr().expect("bound address");
    let stream = TcpStream::connect(addr).await.expect("connect to server");
    let (reader, writer) = stream.into_split();
    (BufReader::new(reader), writer)
}

async fn wait_for_sessions(conductor: &Conductor, expected: usize) {
    let registry = conductor.registry();
    let start = tokio::time::Instant::now();
    while start.elapsed() < REGISTRY_WAIT_TIMEOUT {
        if registry.len() == expected {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("registry has {} sessions, expected {expected}", registry.len());
}

async fn recv_line(reader: &mut BufReader<OwnedReadHalf>) -> Option<String> {
    let mut line = String::new();
    let n = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .expect("timed out waiting for a line")
        .ok()?;
    (n > 0).then_some(line)
}

async fn echo_roundtrip(conductor: &Conductor, text: &str) {
    let (mut reader, mut writer) = connect(conductor).await;
    writer.write_all(format!("{text}\n").as_bytes()).await.unwrap();
    assert_eq!(recv_line(&mut reader).await, Some(format!("Echo: {text}\n")));
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_oversized_line_disconnects_only_that_client() {
    let conductor = start(test_settings()).await;
    let (mut reader, mut writer) = connect(&conductor).await;
    wait_for_sessions(&conductor, 1).await;

    let payload = vec![b'a'; MAX_LINE_LENGTH + 1024];
    let _ = writer.write_all(&payload).await;

    while recv_line(&mut reader).await.is_some() {}
    wait_for_sessions(&conductor, 0).await;

    echo_roundtrip(&conductor, "still serving").await;
    conductor.shutdown().await;
}

#[tokio::test]
async fn test_line_at_limit_is_accepted() {
    let conductor = start(test_settings()).await;
    let (mut reader, mut writer) = connect(&conductor).await;

    let mut payload = vec![b'b'; MAX_LINE_LENGTH - 1];
    payload.push(b'\n');
    writer.write_all(&payload).await.unwrap();

    let line = recv_line(&mut reader).await.expect("echo of long line");
    assert_eq!(line.len(), "Echo: ".len() + MAX_LINE_LENGTH - 1 + 1);

    conductor.shutdown().await;
}

#[tokio::test]
async fn test_invalid_utf8_is_tolerated() {
    let conductor = start(test_settings()).await;
    let (mut reader, mut writer) = connect(&conductor).await;

    writer.write_all(b"caf\xff\n").await.unwrap();
    let line = recv_line(&mut reader).await.expect("echo");
    assert!(line.starts_with("Echo: caf"));

    conductor.shutdown().await;
}

#[tokio::test]
async fn test_rapid_connect_disconnect() {
    let conductor = start(test_settings()).await;
    let addr = conductor.local_addr().unwrap();

    for _ in 0..50 {
        let stream = TcpStream::connect(addr).await.unwrap();
        drop(stream);
    }

    wait_for_sessions(&conductor, 0).await;
    echo_roundtrip(&conductor, "after churn").await;

    conductor.shutdown().await;
}

#[tokio::test]
async fn test_client_that_never_reads_does_not_block_others() {
    let settings = Settings {
        heartbeat_every: 1,
        ..test_settings()
    };
    let conductor = start(settings).await;

    // Never reads its heartbeats.
    let (_silent_reader, _silent_writer) = connect(&conductor).await;

    let (mut reader, mut writer) = connect(&conductor).await;
    wait_for_sessions(&conductor, 2).await;
    sleep(Duration::from_millis(200)).await;

    writer.write_all(b"hello\n").await.unwrap();
    loop {
        let line = recv_line(&mut reader).await.expect("connection open");
        if line.starts_with("Echo:") {
            assert_eq!(line, "Echo: hello\n");
            break;
        }
        assert!(line.starts_with("Tick "), "unexpected line {line:?}");
    }

    conductor.shutdown().await;
}

#[tokio::test]
async fn test_restart_serves_again() {
    let conductor = start(test_settings()).await;
    echo_roundtrip(&conductor, "first run").await;
    conductor.shutdown().await;

    let conductor = start(test_settings()).await;
    echo_roundtrip(&conductor, "second run").await;
    conductor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let conductor = start(test_settings()).await;
    conductor.shutdown().await;
    conductor.shutdown().await;
    assert!(conductor.local_addr().is_none());
}
