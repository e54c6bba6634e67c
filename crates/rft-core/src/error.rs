//! Transfer-level failures surfaced to the user.

use std::path::PathBuf;

use thiserror::Error;

use crate::wire::ConnectionId;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("remote has no file named {0}")]
    FileNotFound(String),
    #[error("server rejected the admission solution for {0}")]
    ValidationFailed(String),
    #[error("server lost connection {0}")]
    ConnectionNotFound(ConnectionId),
    #[error("retries exhausted while transferring {0}")]
    RetryExhausted(String),
    #[error("writing {path} failed: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checksum mismatch for {0} — the received file is corrupt")]
    ChecksumMismatch(String),
    #[error("transfer aborted by user")]
    Aborted,
}
