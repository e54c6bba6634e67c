//! RFT integration harness — both roles in-process over loopback UDP.
//!
//! Each test spins up a server engine + driver on an ephemeral port, then
//! either runs a client engine against it or speaks the wire protocol
//! directly through a raw socket. No namespaces or root required.

mod protocol;
mod resume;
mod transfer;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use rft_core::config::EngineConfig;
use rft_core::wire::Packet;
use rft_engine::client::{ClientEngine, TransferReport};
use rft_engine::loss::GilbertLoss;
use rft_engine::net::UdpDriver;
use rft_engine::queue::EventQueue;
use rft_engine::server::ServerEngine;
use rft_engine::Event;

/// Per-test scratch directory.
pub fn scratch(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rft-it-{label}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

/// Deterministic file content so corruption is always detectable.
pub fn make_file(path: &Path, len: usize, seed: u8) -> Vec<u8> {
    let data: Vec<u8> = (0..len)
        .map(|i| (i as u64).wrapping_mul(31).wrapping_add(seed as u64) as u8)
        .collect();
    std::fs::write(path, &data).expect("write test file");
    data
}

/// Client-side config tuned for tests: short handshake timers so a dropped
/// challenge retries in seconds, not minutes.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.timing.file_request_secs = 2;
    config.timing.validation_secs = 2;
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    queue: Arc<EventQueue>,
    abort: Arc<AtomicBool>,
}

impl TestServer {
    pub fn stop(&self) {
        self.abort
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.queue.push(Event::Abort);
    }
}

/// Spawn a server engine + driver serving `root` on an ephemeral port.
pub async fn start_server(root: &Path) -> Result<TestServer> {
    let mut config = test_config();
    config.transport.serve_root = root.to_path_buf();

    let queue = Arc::new(EventQueue::new());
    let abort = Arc::new(AtomicBool::new(false));
    let (driver, sink) = UdpDriver::bind(
        "127.0.0.1:0".parse().unwrap(),
        queue.clone(),
        GilbertLoss::off(),
        abort.clone(),
    )
    .await?;
    let addr = driver.local_addr()?;
    tokio::spawn(driver.run());
    tokio::spawn(ServerEngine::new(queue.clone(), sink, config, abort.clone()).run());

    Ok(TestServer { addr, queue, abort })
}

/// Run a client engine against `server`, optionally with inbound loss.
pub async fn fetch_with_loss(
    server: SocketAddr,
    dest: &Path,
    files: &[&str],
    loss: GilbertLoss,
) -> Result<Vec<TransferReport>> {
    let mut config = test_config();
    config.transport.dest = dest.to_path_buf();

    let queue = Arc::new(EventQueue::new());
    let abort = Arc::new(AtomicBool::new(false));
    let (driver, sink) = UdpDriver::bind(
        "127.0.0.1:0".parse().unwrap(),
        queue.clone(),
        loss,
        abort.clone(),
    )
    .await?;
    tokio::spawn(driver.run());

    let engine = ClientEngine::new(queue, sink, config, abort, server);
    let files: Vec<String> = files.iter().map(|f| f.to_string()).collect();
    tokio::time::timeout(Duration::from_secs(120), engine.run(files))
        .await
        .context("transfer did not finish in time")
}

pub async fn fetch(server: SocketAddr, dest: &Path, files: &[&str]) -> Result<Vec<TransferReport>> {
    fetch_with_loss(server, dest, files, GilbertLoss::off()).await
}

/// Find the report for one filename.
pub fn report_for<'a>(reports: &'a [TransferReport], filename: &str) -> &'a TransferReport {
    reports
        .iter()
        .find(|r| r.filename == filename)
        .unwrap_or_else(|| panic!("no report for {filename}: {reports:?}"))
}

// ── Raw-socket helpers for protocol-level tests ──────────────────────────────

/// Receive and decode one packet with a deadline.
pub async fn recv_packet(socket: &tokio::net::UdpSocket) -> Result<Packet> {
    let mut buf = vec![0u8; 1024];
    let (len, _) = tokio::time::timeout(Duration::from_secs(10), socket.recv_from(&mut buf))
        .await
        .context("timed out waiting for a packet")??;
    Packet::decode(&buf[..len]).context("decoding received packet")
}

/// Assert that nothing arrives within `window`.
pub async fn expect_silence(socket: &tokio::net::UdpSocket, window: Duration) {
    let mut buf = vec![0u8; 1024];
    let outcome = tokio::time::timeout(window, socket.recv_from(&mut buf)).await;
    assert!(outcome.is_err(), "expected silence, got a datagram");
}
