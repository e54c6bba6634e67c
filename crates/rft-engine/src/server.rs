//! Serving-side protocol engine.
//!
//! Owns every server connection and processes queue events one at a time.
//! The admission check (solution verification plus a full-file digest) is
//! CPU-bound and runs on a blocking worker; its result returns through the
//! queue, so the dispatcher never stalls the socket driver. No state is
//! held between the two handshake messages — the validation response
//! carries everything needed to re-derive the expected solution.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use rft_core::bitfield::Bitfield;
use rft_core::config::EngineConfig;
use rft_core::congestion::CongestionControl;
use rft_core::crypto;
use rft_core::puzzle;
use rft_core::window::{throughput_window, Window};
use rft_core::wire::{ConnectionId, Packet, CHUNK_SIZE};

use crate::event::{Admission, AdmissionOutcome, Event, TimerKind};
use crate::net::PacketSink;
use crate::queue::EventQueue;
use crate::timer::TransferTimer;

pub struct ServerEngine {
    queue: Arc<EventQueue>,
    sink: PacketSink,
    config: EngineConfig,
    abort: Arc<AtomicBool>,
    connections: HashMap<ConnectionId, ServerConnection>,
    next_id: ConnectionId,
}

struct ServerConnection {
    remote: SocketAddr,
    filename: String,
    file: File,
    window: Window,
    congestion: CongestionControl,
    timer: TransferTimer,
}

impl ServerEngine {
    pub fn new(
        queue: Arc<EventQueue>,
        sink: PacketSink,
        config: EngineConfig,
        abort: Arc<AtomicBool>,
    ) -> Self {
        Self {
            queue,
            sink,
            config,
            abort,
            connections: HashMap::new(),
            next_id: 1,
        }
    }

    /// Dispatcher loop: block on the queue, drain, handle.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(
            root = %self.config.transport.serve_root.display(),
            "server engine running"
        );
        loop {
            self.queue.wait().await;
            while let Some(event) = self.queue.pop() {
                if matches!(event, Event::Abort) {
                    self.shutdown();
                    return Ok(());
                }
                self.handle(event);
            }
            if self.abort.load(Ordering::Relaxed) {
                self.shutdown();
                return Ok(());
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.timer.cancel();
        }
        tracing::info!("server engine stopped");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Packet { packet, remote, .. } => self.handle_packet(packet, remote),
            Event::Timer(TimerKind::Inactivity { connection }) => self.on_inactivity(connection),
            Event::Admission(admission) => self.on_admission(admission),
            // Client-side events never reach the serving engine.
            Event::Timer(_) | Event::Solution { .. } | Event::Checksum { .. } | Event::Abort => {}
        }
    }

    fn handle_packet(&mut self, packet: Packet, remote: SocketAddr) {
        match packet {
            Packet::FileRequest { filename } => self.on_file_request(filename, remote),
            Packet::ValidationResponse {
                solution,
                nonce,
                max_throughput,
                filename,
            } => self.on_validation_response(solution, nonce, max_throughput, filename, remote),
            Packet::TransmissionRequest {
                connection,
                window_id,
                rtt,
                chunk_index,
            } => self.on_transmission_request(connection, window_id, rtt, chunk_index, remote),
            Packet::RetransmissionRequest {
                connection,
                window_id,
                bitfield,
            } => self.on_retransmission_request(connection, window_id, bitfield, remote),
            Packet::Finish { connection } => self.on_finish(connection),
            other => {
                tracing::trace!(tag = other.tag(), %remote, "ignoring packet for the other role");
            }
        }
    }

    // ── Handshake ─────────────────────────────────────────────────────────

    fn on_file_request(&mut self, filename: String, remote: SocketAddr) {
        let nonce = epoch_seconds();
        let challenge = puzzle::issue(
            &filename,
            self.config.admission.secret.as_bytes(),
            self.config.admission.difficulty,
            nonce,
        );
        tracing::debug!(filename, %remote, nonce, "issuing admission challenge");
        self.sink.send(
            &Packet::ValidationRequest {
                difficulty: challenge.difficulty,
                masked_hash: challenge.masked_hash,
                target_hash: challenge.target_hash,
                nonce,
                filename,
            },
            remote,
        );
    }

    fn on_validation_response(
        &mut self,
        solution: [u8; 32],
        nonce: u32,
        max_throughput: u16,
        filename: String,
        remote: SocketAddr,
    ) {
        let secret = self.config.admission.secret.clone();
        let root = self.config.transport.serve_root.clone();
        let queue = self.queue.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = admit(&filename, &solution, nonce, secret.as_bytes(), &root);
            queue.push(Event::Admission(Admission {
                remote,
                filename,
                max_throughput,
                outcome,
            }));
        });
    }

    fn on_admission(&mut self, admission: Admission) {
        let Admission {
            remote,
            filename,
            max_throughput,
            outcome,
        } = admission;

        match outcome {
            AdmissionOutcome::Rejected => {
                tracing::warn!(filename, %remote, "admission solution rejected");
                self.sink.send(&Packet::ValidationFailed { filename }, remote);
            }
            AdmissionOutcome::Missing => {
                tracing::warn!(filename, %remote, "requested file not found");
                self.sink.send(&Packet::FileNotFound { filename }, remote);
            }
            AdmissionOutcome::Granted {
                file,
                file_size,
                checksum,
            } => {
                let connection = self.allocate_id();
                let limit = throughput_window(max_throughput.max(1));
                let timer = TransferTimer::new(self.queue.clone());
                timer.arm(
                    self.config.timing.inactivity(),
                    TimerKind::Inactivity { connection },
                );
                self.connections.insert(
                    connection,
                    ServerConnection {
                        remote,
                        filename: filename.clone(),
                        file,
                        window: Window::new(limit),
                        congestion: CongestionControl::new(limit),
                        timer,
                    },
                );
                tracing::info!(
                    connection,
                    filename,
                    file_size,
                    %remote,
                    window_limit = limit,
                    "connection established"
                );
                self.sink.send(
                    &Packet::InitialResponse {
                        connection,
                        file_size,
                        checksum,
                        filename,
                    },
                    remote,
                );
            }
        }
    }

    fn allocate_id(&mut self) -> ConnectionId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if id != 0 && !self.connections.contains_key(&id) {
                return id;
            }
        }
    }

    // ── Serving ───────────────────────────────────────────────────────────

    fn on_transmission_request(
        &mut self,
        connection: ConnectionId,
        window_id: u8,
        rtt: u32,
        chunk_index: u32,
        remote: SocketAddr,
    ) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            tracing::debug!(connection, %remote, "transmission request for unknown connection");
            self.sink
                .send(&Packet::ConnectionNotFound { connection }, remote);
            return;
        };

        // Connection migration: whatever address the request came from is
        // where the window goes.
        conn.remote = remote;
        // The requesting side owns the generation counter.
        conn.window.set_id(window_id);

        let budget = conn.congestion.update(rtt);
        let chunks = match read_window(&conn.file, chunk_index, budget) {
            Ok(chunks) => chunks,
            Err(error) => {
                tracing::warn!(connection, %error, "reading served file failed, dropping connection");
                conn.timer.cancel();
                self.connections.remove(&connection);
                return;
            }
        };

        let window_size = chunks.len() as u16;
        conn.window.begin(window_size);
        for (sequence, chunk) in chunks.into_iter().enumerate() {
            let sequence = sequence as u16;
            conn.window.store(sequence, chunk.clone());
            self.sink.send(
                &Packet::Payload {
                    connection,
                    window_id,
                    window_size,
                    sequence,
                    chunk,
                },
                conn.remote,
            );
        }
        conn.timer.arm(
            self.config.timing.inactivity(),
            TimerKind::Inactivity { connection },
        );
        tracing::debug!(
            connection,
            window_id,
            window_size,
            chunk_index,
            rtt,
            "window served"
        );
    }

    fn on_retransmission_request(
        &mut self,
        connection: ConnectionId,
        window_id: u8,
        bits: Bytes,
        remote: SocketAddr,
    ) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            tracing::debug!(connection, %remote, "retransmission request for unknown connection");
            self.sink
                .send(&Packet::ConnectionNotFound { connection }, remote);
            return;
        };

        conn.remote = remote;
        conn.congestion.on_loss();

        if window_id != conn.window.id() {
            tracing::debug!(
                connection,
                window_id,
                current = conn.window.id(),
                "retransmission request for a stale generation"
            );
            return;
        }

        let window_size = conn.window.current_size();
        let field = Bitfield::from_bytes(&bits, window_size);
        let mut resent = 0u16;
        for sequence in 0..window_size {
            if field.get(sequence) {
                continue;
            }
            let Some(chunk) = conn.window.chunk(sequence) else {
                continue;
            };
            self.sink.send(
                &Packet::Payload {
                    connection,
                    window_id,
                    window_size,
                    sequence,
                    chunk: chunk.clone(),
                },
                conn.remote,
            );
            resent += 1;
        }
        conn.timer.arm(
            self.config.timing.inactivity(),
            TimerKind::Inactivity { connection },
        );
        tracing::debug!(connection, window_id, resent, "missing chunks retransmitted");
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    fn on_finish(&mut self, connection: ConnectionId) {
        match self.connections.remove(&connection) {
            Some(conn) => {
                conn.timer.cancel();
                tracing::info!(connection, filename = conn.filename, "transfer finished");
            }
            // Duplicated finish messages are expected; dropping them twice
            // is fine.
            None => tracing::trace!(connection, "finish for unknown connection"),
        }
    }

    fn on_inactivity(&mut self, connection: ConnectionId) {
        if let Some(conn) = self.connections.remove(&connection) {
            conn.timer.cancel();
            tracing::warn!(
                connection,
                filename = conn.filename,
                "connection idle too long, dropping"
            );
        }
    }
}

// ── Blocking admission work ───────────────────────────────────────────────

/// Verify the solution, then open and digest the requested file. Lookup is
/// confined to the serve root: requests are reduced to their final path
/// component, so nothing outside the root is ever opened.
fn admit(
    filename: &str,
    solution: &[u8; 32],
    nonce: u32,
    secret: &[u8],
    root: &Path,
) -> AdmissionOutcome {
    if !puzzle::verify(solution, nonce, filename, secret) {
        return AdmissionOutcome::Rejected;
    }
    let Some(name) = Path::new(filename).file_name() else {
        return AdmissionOutcome::Missing;
    };
    let path = root.join(name);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(_) => return AdmissionOutcome::Missing,
    };
    let file_size = match file.metadata() {
        Ok(meta) => meta.len(),
        Err(_) => return AdmissionOutcome::Missing,
    };
    match crypto::digest_file(&path) {
        Ok(checksum) => AdmissionOutcome::Granted {
            file,
            file_size,
            checksum,
        },
        Err(_) => AdmissionOutcome::Missing,
    }
}

/// Read up to `budget` chunks starting at `chunk_index`. A short chunk ends
/// the window; a zero-length read at a later index ends it before the empty
/// slot, so aligned file sizes never produce an empty trailing chunk.
fn read_window(file: &File, chunk_index: u32, budget: u16) -> io::Result<Vec<Bytes>> {
    use std::os::unix::fs::FileExt;

    let mut chunks = Vec::new();
    let mut offset = chunk_index as u64 * CHUNK_SIZE as u64;
    for i in 0..budget.max(1) {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;
        while filled < CHUNK_SIZE {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            if i == 0 {
                // A request landing exactly at EOF still gets an answer: one
                // empty chunk closes the window.
                chunks.push(Bytes::new());
            }
            break;
        }
        buf.truncate(filled);
        offset += filled as u64;
        let short = filled < CHUNK_SIZE;
        chunks.push(Bytes::from(buf));
        if short {
            break;
        }
    }
    Ok(chunks)
}

fn epoch_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
