//! Requesting-side protocol engine.
//!
//! Drives every transfer the user asked for: the admission handshake
//! (request → brute-force the challenge → validation response), the window
//! loop (transmission request → collect payloads → flush → advance), and
//! the failure paths (selective retransmission, retry exhaustion, final
//! checksum mismatch). Puzzle solving and the final file digest are
//! CPU-bound and run on blocking workers whose results return through the
//! event queue.
//!
//! An interrupted transfer leaves the partial destination file plus a JSON
//! sidecar (`<name>.resume`) behind; when the server later reports an
//! unchanged file digest, the transfer continues at the recorded chunk
//! boundary instead of starting over.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use rft_core::config::{EngineConfig, TimingConfig};
use rft_core::crypto;
use rft_core::error::TransferError;
use rft_core::puzzle;
use rft_core::rtt::RttEstimator;
use rft_core::window::{throughput_window, Window};
use rft_core::wire::{ConnectionId, Packet, CHUNK_SIZE};

use crate::event::{Event, TimerKind};
use crate::net::PacketSink;
use crate::queue::EventQueue;
use crate::timer::TransferTimer;

/// Outcome of one requested file.
#[derive(Debug)]
pub struct TransferReport {
    pub filename: String,
    pub outcome: Result<PathBuf, TransferError>,
}

pub struct ClientEngine {
    queue: Arc<EventQueue>,
    sink: PacketSink,
    config: EngineConfig,
    abort: Arc<AtomicBool>,
    server: SocketAddr,
    requests: HashMap<String, FileRequest>,
    connections: HashMap<ConnectionId, ClientConnection>,
    reports: Vec<TransferReport>,
}

/// Pre-connection state, keyed by filename.
struct FileRequest {
    phase: RequestPhase,
    timer: TransferTimer,
    retries: u32,
    sent_at: Instant,
    rtt: RttEstimator,
}

#[derive(Clone, Copy)]
enum RequestPhase {
    /// File request sent, waiting for the challenge.
    AwaitingChallenge,
    /// Challenge received, a worker is grinding the low bits.
    Solving { nonce: u32 },
    /// Solution sent, waiting for the initial response. The solution is
    /// kept so a lost response can be retransmitted as-is.
    AwaitingConnection { solution: [u8; 32], nonce: u32 },
}

/// Post-handshake state, keyed by the server-assigned connection id.
struct ClientConnection {
    filename: String,
    path: PathBuf,
    file: File,
    file_size: u64,
    checksum: [u8; 32],
    bytes_written: u64,
    chunks_written: u64,
    window: Window,
    timer: TransferTimer,
    retries: u32,
    last_request_at: Instant,
    measure_rtt: bool,
    rtt: RttEstimator,
    /// Window complete and the final digest is being computed.
    verifying: bool,
    /// The server forgot this connection; a fresh request is in flight and
    /// the state waits here to be rekeyed.
    parked: bool,
}

/// On-disk bookkeeping for an interrupted transfer, kept beside the
/// destination file and removed on success.
#[derive(Debug, Serialize, Deserialize)]
struct ResumeState {
    checksum: String,
    file_size: u64,
    bytes_written: u64,
    chunks_written: u64,
}

impl ClientEngine {
    pub fn new(
        queue: Arc<EventQueue>,
        sink: PacketSink,
        config: EngineConfig,
        abort: Arc<AtomicBool>,
        server: SocketAddr,
    ) -> Self {
        Self {
            queue,
            sink,
            config,
            abort,
            server,
            requests: HashMap::new(),
            connections: HashMap::new(),
            reports: Vec::new(),
        }
    }

    /// Request every file and run the dispatcher loop until all transfers
    /// have finished one way or another.
    pub async fn run(mut self, files: Vec<String>) -> Vec<TransferReport> {
        let mut seen = HashSet::new();
        for filename in files {
            if !seen.insert(filename.clone()) {
                continue;
            }
            if Path::new(&filename).file_name().is_none() {
                tracing::warn!(filename = %filename, "skipping request with no usable filename");
                self.reports.push(TransferReport {
                    filename: filename.clone(),
                    outcome: Err(TransferError::FileNotFound(filename)),
                });
                continue;
            }
            self.request_file(filename);
        }

        loop {
            if self.requests.is_empty() && self.connections.is_empty() {
                break;
            }
            self.queue.wait().await;
            while let Some(event) = self.queue.pop() {
                if matches!(event, Event::Abort) {
                    self.shutdown();
                    return self.reports;
                }
                self.handle(event);
            }
            if self.abort.load(Ordering::Relaxed) {
                self.shutdown();
                return self.reports;
            }
        }

        tracing::info!(transfers = self.reports.len(), "client engine done");
        self.reports
    }

    fn request_file(&mut self, filename: String) {
        if self.requests.contains_key(&filename) {
            return;
        }
        tracing::debug!(filename = %filename, server = %self.server, "requesting file");
        self.sink.send(
            &Packet::FileRequest {
                filename: filename.clone(),
            },
            self.server,
        );
        let timer = TransferTimer::new(self.queue.clone());
        timer.arm(
            self.config.timing.file_request(),
            TimerKind::Request {
                filename: filename.clone(),
            },
        );
        self.requests.insert(
            filename,
            FileRequest {
                phase: RequestPhase::AwaitingChallenge,
                timer,
                retries: 0,
                sent_at: Instant::now(),
                rtt: RttEstimator::new(),
            },
        );
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Packet {
                packet,
                remote,
                received_at,
            } => self.handle_packet(packet, remote, received_at),
            Event::Timer(TimerKind::Request { filename }) => self.on_request_timer(filename),
            Event::Timer(TimerKind::Transfer { connection }) => self.on_transfer_timer(connection),
            Event::Solution { filename, solution } => self.on_solution(filename, solution),
            Event::Checksum { connection, digest } => self.on_checksum(connection, digest),
            // Server-side events never reach the requesting engine.
            Event::Timer(TimerKind::Inactivity { .. }) | Event::Admission(_) | Event::Abort => {}
        }
    }

    fn handle_packet(&mut self, packet: Packet, remote: SocketAddr, received_at: Instant) {
        match packet {
            Packet::ValidationRequest {
                difficulty,
                masked_hash,
                target_hash,
                nonce,
                filename,
            } => self.on_challenge(difficulty, masked_hash, target_hash, nonce, filename, received_at),
            Packet::InitialResponse {
                connection,
                file_size,
                checksum,
                filename,
            } => self.on_initial_response(connection, file_size, checksum, filename, received_at),
            Packet::Payload {
                connection,
                window_id,
                window_size,
                sequence,
                chunk,
            } => self.on_payload(connection, window_id, window_size, sequence, chunk, received_at),
            Packet::FileNotFound { filename } => {
                let error = TransferError::FileNotFound(filename.clone());
                self.fail_request(&filename, error);
            }
            Packet::ValidationFailed { filename } => {
                let error = TransferError::ValidationFailed(filename.clone());
                self.fail_request(&filename, error);
            }
            Packet::ConnectionNotFound { connection } => self.on_connection_not_found(connection),
            other => {
                tracing::trace!(tag = other.tag(), %remote, "ignoring packet for the other role");
            }
        }
    }

    // ── Handshake ─────────────────────────────────────────────────────────

    fn on_challenge(
        &mut self,
        difficulty: u8,
        masked_hash: [u8; 32],
        target_hash: [u8; 32],
        nonce: u32,
        filename: String,
        received_at: Instant,
    ) {
        let Some(request) = self.requests.get_mut(&filename) else {
            tracing::trace!(filename = %filename, "challenge for a file we never asked for");
            return;
        };
        if !matches!(request.phase, RequestPhase::AwaitingChallenge) {
            tracing::debug!(filename = %filename, "duplicate challenge, already past it");
            return;
        }
        if request.retries == 0 {
            request
                .rtt
                .record(received_at.saturating_duration_since(request.sent_at));
        }
        request.phase = RequestPhase::Solving { nonce };
        // The brute force has no deadline of its own; it always terminates.
        request.timer.cancel();

        tracing::debug!(filename = %filename, difficulty, nonce, "solving admission challenge");
        let queue = self.queue.clone();
        tokio::task::spawn_blocking(move || {
            let solution = puzzle::solve(&masked_hash, &target_hash, difficulty);
            queue.push(Event::Solution { filename, solution });
        });
    }

    fn on_solution(&mut self, filename: String, solution: Option<[u8; 32]>) {
        let Some(request) = self.requests.get_mut(&filename) else {
            return;
        };
        let RequestPhase::Solving { nonce } = request.phase else {
            tracing::debug!(filename = %filename, "stray solution result");
            return;
        };
        match solution {
            None => {
                tracing::warn!(filename = %filename, "challenge has no solution, giving up");
                if let Some(request) = self.requests.remove(&filename) {
                    request.timer.cancel();
                }
                self.reports.push(TransferReport {
                    filename: filename.clone(),
                    outcome: Err(TransferError::ValidationFailed(filename)),
                });
            }
            Some(solution) => {
                self.sink.send(
                    &Packet::ValidationResponse {
                        solution,
                        nonce,
                        max_throughput: self.config.transport.max_throughput,
                        filename: filename.clone(),
                    },
                    self.server,
                );
                request.phase = RequestPhase::AwaitingConnection { solution, nonce };
                request.retries = 0;
                request.sent_at = Instant::now();
                request.timer.arm(
                    self.config.timing.validation(),
                    TimerKind::Request { filename },
                );
            }
        }
    }

    fn on_initial_response(
        &mut self,
        connection: ConnectionId,
        file_size: u64,
        checksum: [u8; 32],
        filename: String,
        received_at: Instant,
    ) {
        if self.connections.contains_key(&connection) {
            tracing::trace!(connection, "duplicate initial response");
            return;
        }
        let Some(request) = self.requests.remove(&filename) else {
            tracing::trace!(filename = %filename, "initial response without a pending request");
            return;
        };
        request.timer.cancel();
        let mut rtt = request.rtt;
        if request.retries == 0 {
            rtt.record(received_at.saturating_duration_since(request.sent_at));
        }

        // The server may have forgotten a live connection and re-admitted
        // us. If the file is unchanged, keep the bytes already on disk and
        // continue under the new id.
        let prior = self
            .connections
            .iter()
            .find(|(_, conn)| conn.filename == filename)
            .map(|(id, _)| *id);
        if let Some(old_id) = prior {
            if let Some(mut conn) = self.connections.remove(&old_id) {
                conn.timer.cancel();
                if conn.checksum == checksum && conn.file_size == file_size {
                    tracing::info!(
                        filename = %filename,
                        old = old_id,
                        new = connection,
                        resume_at = conn.chunks_written,
                        "transfer rekeyed under a new connection"
                    );
                    conn.parked = false;
                    conn.verifying = false;
                    conn.retries = 0;
                    conn.rtt = rtt;
                    conn.window = Window::new(conn.window.max_size());
                    Self::request_next(
                        &self.sink,
                        self.server,
                        &self.config.timing,
                        connection,
                        &mut conn,
                    );
                    self.connections.insert(connection, conn);
                    return;
                }
                tracing::warn!(filename = %filename, "remote file changed, discarding stale partial");
                let path = conn.path.clone();
                drop(conn);
                let _ = fs::remove_file(&path);
                let _ = fs::remove_file(sidecar_path(&path));
            }
        }

        let Some(basename) = Path::new(&filename).file_name() else {
            tracing::warn!(filename = %filename, "initial response for an unusable filename");
            return;
        };
        let path = self.config.transport.dest.join(basename);

        match resume_or_create(&path, file_size, &checksum) {
            Err(error) => {
                tracing::warn!(filename = %filename, %error, "cannot open destination file");
                self.reports.push(TransferReport {
                    filename,
                    outcome: Err(TransferError::WriteFailed {
                        path,
                        source: error,
                    }),
                });
            }
            Ok((file, bytes_written, chunks_written)) => {
                if bytes_written > 0 {
                    tracing::info!(
                        filename = %filename,
                        bytes_written,
                        resume_at = chunks_written,
                        "resuming interrupted transfer"
                    );
                }
                let limit = throughput_window(self.config.transport.max_throughput.max(1));
                let mut conn = ClientConnection {
                    filename,
                    path,
                    file,
                    file_size,
                    checksum,
                    bytes_written,
                    chunks_written,
                    window: Window::new(limit),
                    timer: TransferTimer::new(self.queue.clone()),
                    retries: 0,
                    last_request_at: Instant::now(),
                    measure_rtt: false,
                    rtt,
                    verifying: false,
                    parked: false,
                };
                if conn.bytes_written >= conn.file_size {
                    // Everything is already on disk — all that is left is
                    // the integrity check.
                    conn.verifying = true;
                    spawn_verify(self.queue.clone(), connection, conn.path.clone());
                } else {
                    Self::request_next(
                        &self.sink,
                        self.server,
                        &self.config.timing,
                        connection,
                        &mut conn,
                    );
                }
                self.connections.insert(connection, conn);
            }
        }
    }

    // ── Window loop ───────────────────────────────────────────────────────

    /// Emit the next transmission request and arm the transfer timer.
    fn request_next(
        sink: &PacketSink,
        server: SocketAddr,
        timing: &TimingConfig,
        connection: ConnectionId,
        conn: &mut ClientConnection,
    ) {
        sink.send(
            &Packet::TransmissionRequest {
                connection,
                window_id: conn.window.id(),
                rtt: conn.rtt.average_micros().max(1),
                chunk_index: conn.chunks_written as u32,
            },
            server,
        );
        conn.last_request_at = Instant::now();
        conn.measure_rtt = true;
        conn.timer.arm(
            conn.rtt.timeout(
                timing.timeout_factor,
                timing.timeout_floor(),
                timing.initial_timeout(),
            ),
            TimerKind::Transfer { connection },
        );
    }

    fn on_payload(
        &mut self,
        connection: ConnectionId,
        window_id: u8,
        window_size: u16,
        sequence: u16,
        chunk: Bytes,
        received_at: Instant,
    ) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            tracing::trace!(connection, "payload for unknown connection");
            return;
        };
        if conn.verifying || conn.parked {
            return;
        }
        if window_id != conn.window.id() {
            // A straggler from the previous generation.
            tracing::trace!(
                connection,
                window_id,
                current = conn.window.id(),
                "dropping out-of-generation payload"
            );
            return;
        }

        conn.retries = 0;
        if conn.measure_rtt {
            conn.rtt
                .record(received_at.saturating_duration_since(conn.last_request_at));
            conn.measure_rtt = false;
        }
        conn.window.set_current_size(window_size);
        conn.window.store(sequence, chunk);

        if !conn.window.is_complete() {
            let timing = &self.config.timing;
            conn.timer.arm(
                conn.rtt.timeout(
                    timing.timeout_factor,
                    timing.timeout_floor(),
                    timing.initial_timeout(),
                ),
                TimerKind::Transfer { connection },
            );
            return;
        }

        conn.timer.cancel();
        match flush_window(conn) {
            Err(error) => {
                tracing::warn!(connection, %error, "flushing window to disk failed");
                if let Some(conn) = self.connections.remove(&connection) {
                    self.sink
                        .send(&Packet::Finish { connection }, self.server);
                    self.reports.push(TransferReport {
                        filename: conn.filename,
                        outcome: Err(TransferError::WriteFailed {
                            path: conn.path,
                            source: error,
                        }),
                    });
                }
            }
            Ok(()) => {
                tracing::debug!(
                    connection,
                    window_id,
                    bytes_written = conn.bytes_written,
                    of = conn.file_size,
                    "window flushed"
                );
                if conn.bytes_written >= conn.file_size {
                    conn.verifying = true;
                    spawn_verify(self.queue.clone(), connection, conn.path.clone());
                } else {
                    conn.window.advance();
                    Self::request_next(
                        &self.sink,
                        self.server,
                        &self.config.timing,
                        connection,
                        conn,
                    );
                }
            }
        }
    }

    fn on_checksum(&mut self, connection: ConnectionId, digest: io::Result<[u8; 32]>) {
        let Some(conn) = self.connections.remove(&connection) else {
            return;
        };
        conn.timer.cancel();
        match digest {
            Err(error) => {
                tracing::warn!(connection, %error, "reading back the finished file failed");
                self.sink.send(&Packet::Finish { connection }, self.server);
                self.reports.push(TransferReport {
                    filename: conn.filename,
                    outcome: Err(TransferError::WriteFailed {
                        path: conn.path,
                        source: error,
                    }),
                });
            }
            Ok(digest) if digest == conn.checksum => {
                let _ = fs::remove_file(sidecar_path(&conn.path));
                self.sink.send(&Packet::Finish { connection }, self.server);
                tracing::info!(
                    connection,
                    filename = %conn.filename,
                    bytes = conn.bytes_written,
                    path = %conn.path.display(),
                    "transfer complete, checksum verified"
                );
                self.reports.push(TransferReport {
                    filename: conn.filename,
                    outcome: Ok(conn.path),
                });
            }
            Ok(_) => {
                tracing::warn!(
                    connection,
                    filename = %conn.filename,
                    "checksum mismatch, deleting corrupt file"
                );
                let _ = fs::remove_file(&conn.path);
                let _ = fs::remove_file(sidecar_path(&conn.path));
                self.reports.push(TransferReport {
                    filename: conn.filename.clone(),
                    outcome: Err(TransferError::ChecksumMismatch(conn.filename)),
                });
            }
        }
    }

    // ── Timers & errors ───────────────────────────────────────────────────

    fn on_request_timer(&mut self, filename: String) {
        let Some(request) = self.requests.get_mut(&filename) else {
            return;
        };
        if matches!(request.phase, RequestPhase::Solving { .. }) {
            return;
        }
        if request.retries >= self.config.timing.max_retries {
            tracing::warn!(filename = %filename, "request retries exhausted");
            if let Some(request) = self.requests.remove(&filename) {
                request.timer.cancel();
            }
            self.reports.push(TransferReport {
                filename: filename.clone(),
                outcome: Err(TransferError::RetryExhausted(filename)),
            });
            return;
        }
        request.retries += 1;
        request.sent_at = Instant::now();
        match &request.phase {
            RequestPhase::AwaitingChallenge => {
                tracing::debug!(filename = %filename, retry = request.retries, "re-requesting file");
                self.sink.send(
                    &Packet::FileRequest {
                        filename: filename.clone(),
                    },
                    self.server,
                );
                request.timer.arm(
                    self.config.timing.file_request(),
                    TimerKind::Request { filename },
                );
            }
            RequestPhase::AwaitingConnection { solution, nonce } => {
                tracing::debug!(
                    filename = %filename,
                    retry = request.retries,
                    "re-sending validation response"
                );
                self.sink.send(
                    &Packet::ValidationResponse {
                        solution: *solution,
                        nonce: *nonce,
                        max_throughput: self.config.transport.max_throughput,
                        filename: filename.clone(),
                    },
                    self.server,
                );
                request.timer.arm(
                    self.config.timing.validation(),
                    TimerKind::Request { filename },
                );
            }
            RequestPhase::Solving { .. } => unreachable!("filtered above"),
        }
    }

    fn on_transfer_timer(&mut self, connection: ConnectionId) {
        let exhausted = match self.connections.get(&connection) {
            None => return,
            Some(conn) if conn.verifying || conn.parked => return,
            Some(conn) => conn.retries >= self.config.timing.max_retries,
        };
        if exhausted {
            if let Some(conn) = self.connections.remove(&connection) {
                conn.timer.cancel();
                tracing::warn!(
                    connection,
                    filename = %conn.filename,
                    "transfer retries exhausted, deleting partial file"
                );
                let _ = fs::remove_file(&conn.path);
                let _ = fs::remove_file(sidecar_path(&conn.path));
                self.reports.push(TransferReport {
                    filename: conn.filename.clone(),
                    outcome: Err(TransferError::RetryExhausted(conn.filename)),
                });
            }
            return;
        }

        let Some(conn) = self.connections.get_mut(&connection) else {
            return;
        };
        conn.retries += 1;
        if conn.window.stored() == 0 {
            // Nothing of this generation arrived — repeat the request.
            tracing::debug!(
                connection,
                retry = conn.retries,
                window_id = conn.window.id(),
                "window silent, re-requesting"
            );
            self.sink.send(
                &Packet::TransmissionRequest {
                    connection,
                    window_id: conn.window.id(),
                    rtt: conn.rtt.average_micros().max(1),
                    chunk_index: conn.chunks_written as u32,
                },
                self.server,
            );
        } else {
            // Partially filled — ask for exactly the missing chunks.
            let bits = conn.window.present_bits();
            tracing::debug!(
                connection,
                retry = conn.retries,
                window_id = conn.window.id(),
                missing = conn.window.current_size() - conn.window.stored(),
                "window stalled, requesting retransmission"
            );
            self.sink.send(
                &Packet::RetransmissionRequest {
                    connection,
                    window_id: conn.window.id(),
                    bitfield: Bytes::copy_from_slice(bits.as_bytes()),
                },
                self.server,
            );
        }
        conn.last_request_at = Instant::now();
        // A retransmit round-trip is ambiguous; never feed it to the estimator.
        conn.measure_rtt = false;
        let timing = &self.config.timing;
        conn.timer.arm(
            conn.rtt.timeout(
                timing.timeout_factor,
                timing.timeout_floor(),
                timing.initial_timeout(),
            ),
            TimerKind::Transfer { connection },
        );
    }

    fn on_connection_not_found(&mut self, connection: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            tracing::trace!(connection, "connection-not-found for a connection we don't hold");
            return;
        };
        if conn.verifying {
            return;
        }
        conn.timer.cancel();
        conn.parked = true;
        let filename = conn.filename.clone();
        tracing::warn!(connection, filename = %filename, "server lost the connection, requesting again");
        self.request_file(filename);
    }

    fn fail_request(&mut self, filename: &str, error: TransferError) {
        let Some(request) = self.requests.remove(filename) else {
            tracing::trace!(filename = %filename, "error for a request we don't hold");
            return;
        };
        request.timer.cancel();
        tracing::warn!(filename = %filename, %error, "request failed");
        self.reports.push(TransferReport {
            filename: filename.to_string(),
            outcome: Err(error),
        });
    }

    /// User abort: cancel everything, delete incomplete destinations, and
    /// tell the server we are done with each connection.
    fn shutdown(&mut self) {
        for (filename, request) in self.requests.drain() {
            request.timer.cancel();
            self.reports.push(TransferReport {
                filename,
                outcome: Err(TransferError::Aborted),
            });
        }
        for (connection, conn) in self.connections.drain() {
            conn.timer.cancel();
            self.sink
                .send(&Packet::Finish { connection }, self.server);
            let path = conn.path.clone();
            let filename = conn.filename.clone();
            drop(conn);
            let _ = fs::remove_file(&path);
            let _ = fs::remove_file(sidecar_path(&path));
            self.reports.push(TransferReport {
                filename,
                outcome: Err(TransferError::Aborted),
            });
        }
        tracing::info!("client engine aborted");
    }
}

// ── Disk bookkeeping ──────────────────────────────────────────────────────

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".resume");
    path.with_file_name(name)
}

/// Open the destination file, resuming from a matching sidecar when the
/// server reports an unchanged file, otherwise truncating for a fresh run.
fn resume_or_create(path: &Path, file_size: u64, checksum: &[u8; 32]) -> io::Result<(File, u64, u64)> {
    let sidecar = sidecar_path(path);
    if let Ok(raw) = fs::read(&sidecar) {
        if let Some((file, state)) = try_resume(path, &raw, file_size, checksum)? {
            return Ok((file, state.bytes_written, state.chunks_written));
        }
        // The sidecar belongs to a different version of the file.
        let _ = fs::remove_file(&sidecar);
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    Ok((file, 0, 0))
}

fn try_resume(
    path: &Path,
    raw: &[u8],
    file_size: u64,
    checksum: &[u8; 32],
) -> io::Result<Option<(File, ResumeState)>> {
    let Ok(state) = serde_json::from_slice::<ResumeState>(raw) else {
        return Ok(None);
    };
    if state.checksum != hex::encode(checksum)
        || state.file_size != file_size
        || state.bytes_written > file_size
    {
        return Ok(None);
    }
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(_) => return Ok(None),
    };
    if file.metadata()?.len() < state.bytes_written {
        return Ok(None);
    }
    // Drop anything past the recorded boundary; it was never accounted.
    file.set_len(state.bytes_written)?;
    Ok(Some((file, state)))
}

/// Append the completed window to the file and refresh the sidecar. Only
/// full chunks advance `chunks_written`; a short chunk is always the last
/// of the file.
fn flush_window(conn: &mut ClientConnection) -> io::Result<()> {
    use std::os::unix::fs::FileExt;

    let mut offset = conn.bytes_written;
    let mut full_chunks = 0u64;
    for chunk in conn.window.ordered_chunks() {
        conn.file.write_all_at(chunk, offset)?;
        offset += chunk.len() as u64;
        if chunk.len() == CHUNK_SIZE {
            full_chunks += 1;
        }
    }
    conn.file.sync_data()?;
    conn.bytes_written = offset;
    conn.chunks_written += full_chunks;

    let state = ResumeState {
        checksum: hex::encode(conn.checksum),
        file_size: conn.file_size,
        bytes_written: conn.bytes_written,
        chunks_written: conn.chunks_written,
    };
    let encoded =
        serde_json::to_vec(&state).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    fs::write(sidecar_path(&conn.path), encoded)
}

fn spawn_verify(queue: Arc<EventQueue>, connection: ConnectionId, path: PathBuf) {
    tokio::task::spawn_blocking(move || {
        let digest = crypto::digest_file(&path);
        queue.push(Event::Checksum { connection, digest });
    });
}
