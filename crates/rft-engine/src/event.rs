//! Events flowing through the dispatcher queue.
//!
//! Everything the engines react to arrives here: decoded datagrams from the
//! socket driver, timer firings, and the results of blocking workers. The
//! engines own all per-connection state and touch it only while handling
//! one event at a time.

use std::net::SocketAddr;

use tokio::time::Instant;

use rft_core::wire::{ConnectionId, Packet};

#[derive(Debug)]
pub enum Event {
    /// A decoded datagram from the socket.
    Packet {
        packet: Packet,
        remote: SocketAddr,
        received_at: Instant,
    },
    /// A per-entity deadline fired.
    Timer(TimerKind),
    /// Server worker finished checking an admission solution.
    Admission(Admission),
    /// Client worker finished brute-forcing a challenge.
    Solution {
        filename: String,
        solution: Option<[u8; 32]>,
    },
    /// Client worker finished hashing a completed file.
    Checksum {
        connection: ConnectionId,
        digest: std::io::Result<[u8; 32]>,
    },
    /// User interrupt — tear everything down.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// Server: the connection saw no request for too long.
    Inactivity { connection: ConnectionId },
    /// Client: a pre-connection request stalled.
    Request { filename: String },
    /// Client: a window transfer stalled.
    Transfer { connection: ConnectionId },
}

/// Outcome of the server's blocking admission check.
#[derive(Debug)]
pub struct Admission {
    pub remote: SocketAddr,
    pub filename: String,
    pub max_throughput: u16,
    pub outcome: AdmissionOutcome,
}

#[derive(Debug)]
pub enum AdmissionOutcome {
    /// The solution checked out and the file is readable.
    Granted {
        file: std::fs::File,
        file_size: u64,
        checksum: [u8; 32],
    },
    /// The solution does not match the server-side recomputation.
    Rejected,
    /// No such file under the serve root.
    Missing,
}
