//! RFT wire format — every datagram the two roles exchange.
//!
//! Framing is a stack discipline. A packet is one type-tag byte, then the
//! variable-length field (filename, chunk bytes, or bitfield), then the
//! fixed meta fields appended in declaration order. The decoder pops the
//! fixed fields off the **tail** in reverse order; whatever remains between
//! the tag and the first popped field is the variable field. Packets are
//! therefore exactly as long as their contents — encoders never pad, and
//! the decoder recovers the variable field's length as packet length minus
//! meta size.
//!
//! All multi-byte integers are little-endian. Strings travel as raw UTF-8
//! bytes with no length prefix. SHA-256 digests are 32 raw bytes.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Identifies one transfer on the serving side. 0 is reserved for
/// pre-connection client traffic; the server allocates from 1 upward.
pub type ConnectionId = u16;

/// Fixed payload slice size. The last chunk of a file may be shorter.
pub const CHUNK_SIZE: usize = 512;

/// Size of a SHA-256 digest on the wire.
pub const SHA256_SIZE: usize = 32;

/// PAYLOAD meta: tag + connection id + window id + window size + sequence.
const PAYLOAD_META: usize = 1 + 2 + 1 + 2 + 2;

/// Largest datagram this protocol ever produces. Anything longer is
/// rejected before decoding.
pub const MAX_PACKET_SIZE: usize = CHUNK_SIZE + PAYLOAD_META;

/// One-byte packet type tags. Client-to-server tags sit below 0x10,
/// server-to-client tags at 0x10 and up.
mod tag {
    pub const FILE_REQUEST: u8 = 0x01;
    pub const VALIDATION_RESPONSE: u8 = 0x02;
    pub const TRANSMISSION_REQUEST: u8 = 0x03;
    pub const RETRANSMISSION_REQUEST: u8 = 0x04;
    pub const FINISH: u8 = 0x05;

    pub const VALIDATION_REQUEST: u8 = 0x10;
    pub const INITIAL_RESPONSE: u8 = 0x11;
    pub const PAYLOAD: u8 = 0x12;
    pub const FILE_NOT_FOUND: u8 = 0x13;
    pub const VALIDATION_FAILED: u8 = 0x14;
    pub const CONNECTION_NOT_FOUND: u8 = 0x15;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("packet is empty")]
    Empty,
    #[error("packet of {0} bytes exceeds the {MAX_PACKET_SIZE}-byte maximum")]
    Oversized(usize),
    #[error("unknown packet tag {0:#04x}")]
    UnknownTag(u8),
    #[error("packet truncated: need {need} more bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("{0} unexpected trailing bytes")]
    Trailing(usize),
    #[error("filename is not valid UTF-8")]
    BadFilename,
}

/// A decoded RFT datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    // ── client → server ──────────────────────────────────────────────────
    /// Ask the server for a file; answered with a puzzle challenge.
    FileRequest { filename: String },
    /// The brute-forced puzzle solution plus the client's throughput hint.
    ValidationResponse {
        solution: [u8; SHA256_SIZE],
        nonce: u32,
        /// Receiving capacity hint in MB/s.
        max_throughput: u16,
        filename: String,
    },
    /// Request the next window of chunks starting at `chunk_index`.
    TransmissionRequest {
        connection: ConnectionId,
        window_id: u8,
        /// Most recent round-trip estimate in microseconds.
        rtt: u32,
        chunk_index: u32,
    },
    /// Selective retransmission: a cleared bit requests that chunk again.
    RetransmissionRequest {
        connection: ConnectionId,
        window_id: u8,
        bitfield: Bytes,
    },
    /// The transfer is done; the server drops the connection.
    Finish { connection: ConnectionId },

    // ── server → client ──────────────────────────────────────────────────
    /// Puzzle challenge: recover the cleared low bits of `masked_hash` such
    /// that SHA-256 of the restored value equals `target_hash`.
    ValidationRequest {
        difficulty: u8,
        masked_hash: [u8; SHA256_SIZE],
        target_hash: [u8; SHA256_SIZE],
        nonce: u32,
        filename: String,
    },
    /// Admission granted: the connection id, file size, and file digest.
    InitialResponse {
        connection: ConnectionId,
        file_size: u64,
        checksum: [u8; SHA256_SIZE],
        filename: String,
    },
    /// One chunk of the current window.
    Payload {
        connection: ConnectionId,
        window_id: u8,
        window_size: u16,
        sequence: u16,
        chunk: Bytes,
    },
    FileNotFound { filename: String },
    ValidationFailed { filename: String },
    ConnectionNotFound { connection: ConnectionId },
}

impl Packet {
    pub fn tag(&self) -> u8 {
        match self {
            Packet::FileRequest { .. } => tag::FILE_REQUEST,
            Packet::ValidationResponse { .. } => tag::VALIDATION_RESPONSE,
            Packet::TransmissionRequest { .. } => tag::TRANSMISSION_REQUEST,
            Packet::RetransmissionRequest { .. } => tag::RETRANSMISSION_REQUEST,
            Packet::Finish { .. } => tag::FINISH,
            Packet::ValidationRequest { .. } => tag::VALIDATION_REQUEST,
            Packet::InitialResponse { .. } => tag::INITIAL_RESPONSE,
            Packet::Payload { .. } => tag::PAYLOAD,
            Packet::FileNotFound { .. } => tag::FILE_NOT_FOUND,
            Packet::ValidationFailed { .. } => tag::VALIDATION_FAILED,
            Packet::ConnectionNotFound { .. } => tag::CONNECTION_NOT_FOUND,
        }
    }

    /// Serialize into a single datagram.
    pub fn encode(&self) -> Bytes {
        match self {
            Packet::FileRequest { filename } => build(self.tag(), filename.as_bytes(), 0, |_| {}),
            Packet::ValidationResponse {
                solution,
                nonce,
                max_throughput,
                filename,
            } => build(self.tag(), filename.as_bytes(), SHA256_SIZE + 4 + 2, |buf| {
                buf.put_slice(solution);
                buf.put_u32_le(*nonce);
                buf.put_u16_le(*max_throughput);
            }),
            Packet::TransmissionRequest {
                connection,
                window_id,
                rtt,
                chunk_index,
            } => build(self.tag(), &[], 2 + 1 + 4 + 4, |buf| {
                buf.put_u16_le(*connection);
                buf.put_u8(*window_id);
                buf.put_u32_le(*rtt);
                buf.put_u32_le(*chunk_index);
            }),
            Packet::RetransmissionRequest {
                connection,
                window_id,
                bitfield,
            } => build(self.tag(), bitfield, 2 + 1, |buf| {
                buf.put_u16_le(*connection);
                buf.put_u8(*window_id);
            }),
            Packet::Finish { connection } => build(self.tag(), &[], 2, |buf| {
                buf.put_u16_le(*connection);
            }),
            Packet::ValidationRequest {
                difficulty,
                masked_hash,
                target_hash,
                nonce,
                filename,
            } => build(
                self.tag(),
                filename.as_bytes(),
                1 + SHA256_SIZE * 2 + 4,
                |buf| {
                    buf.put_u8(*difficulty);
                    buf.put_slice(masked_hash);
                    buf.put_slice(target_hash);
                    buf.put_u32_le(*nonce);
                },
            ),
            Packet::InitialResponse {
                connection,
                file_size,
                checksum,
                filename,
            } => build(
                self.tag(),
                filename.as_bytes(),
                2 + 8 + SHA256_SIZE,
                |buf| {
                    buf.put_u16_le(*connection);
                    buf.put_u64_le(*file_size);
                    buf.put_slice(checksum);
                },
            ),
            Packet::Payload {
                connection,
                window_id,
                window_size,
                sequence,
                chunk,
            } => build(self.tag(), chunk, PAYLOAD_META - 1, |buf| {
                buf.put_u16_le(*connection);
                buf.put_u8(*window_id);
                buf.put_u16_le(*window_size);
                buf.put_u16_le(*sequence);
            }),
            Packet::FileNotFound { filename } => build(self.tag(), filename.as_bytes(), 0, |_| {}),
            Packet::ValidationFailed { filename } => {
                build(self.tag(), filename.as_bytes(), 0, |_| {})
            }
            Packet::ConnectionNotFound { connection } => build(self.tag(), &[], 2, |buf| {
                buf.put_u16_le(*connection);
            }),
        }
    }

    /// Parse a datagram. Fixed fields are popped from the tail in the
    /// reverse of encode order; the residue is the variable field.
    pub fn decode(data: &[u8]) -> Result<Packet, WireError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(WireError::Oversized(data.len()));
        }
        let (&tag, body) = data.split_first().ok_or(WireError::Empty)?;
        let mut tail = TailReader::new(body);

        match tag {
            tag::FILE_REQUEST => Ok(Packet::FileRequest {
                filename: tail.residue_str()?,
            }),
            tag::VALIDATION_RESPONSE => {
                let max_throughput = tail.pop_u16()?;
                let nonce = tail.pop_u32()?;
                let solution = tail.pop_digest()?;
                Ok(Packet::ValidationResponse {
                    solution,
                    nonce,
                    max_throughput,
                    filename: tail.residue_str()?,
                })
            }
            tag::TRANSMISSION_REQUEST => {
                let chunk_index = tail.pop_u32()?;
                let rtt = tail.pop_u32()?;
                let window_id = tail.pop_u8()?;
                let connection = tail.pop_u16()?;
                tail.finish()?;
                Ok(Packet::TransmissionRequest {
                    connection,
                    window_id,
                    rtt,
                    chunk_index,
                })
            }
            tag::RETRANSMISSION_REQUEST => {
                let window_id = tail.pop_u8()?;
                let connection = tail.pop_u16()?;
                Ok(Packet::RetransmissionRequest {
                    connection,
                    window_id,
                    bitfield: Bytes::copy_from_slice(tail.residue()),
                })
            }
            tag::FINISH => {
                let connection = tail.pop_u16()?;
                tail.finish()?;
                Ok(Packet::Finish { connection })
            }
            tag::VALIDATION_REQUEST => {
                let nonce = tail.pop_u32()?;
                let target_hash = tail.pop_digest()?;
                let masked_hash = tail.pop_digest()?;
                let difficulty = tail.pop_u8()?;
                Ok(Packet::ValidationRequest {
                    difficulty,
                    masked_hash,
                    target_hash,
                    nonce,
                    filename: tail.residue_str()?,
                })
            }
            tag::INITIAL_RESPONSE => {
                let checksum = tail.pop_digest()?;
                let file_size = tail.pop_u64()?;
                let connection = tail.pop_u16()?;
                Ok(Packet::InitialResponse {
                    connection,
                    file_size,
                    checksum,
                    filename: tail.residue_str()?,
                })
            }
            tag::PAYLOAD => {
                let sequence = tail.pop_u16()?;
                let window_size = tail.pop_u16()?;
                let window_id = tail.pop_u8()?;
                let connection = tail.pop_u16()?;
                Ok(Packet::Payload {
                    connection,
                    window_id,
                    window_size,
                    sequence,
                    chunk: Bytes::copy_from_slice(tail.residue()),
                })
            }
            tag::FILE_NOT_FOUND => Ok(Packet::FileNotFound {
                filename: tail.residue_str()?,
            }),
            tag::VALIDATION_FAILED => Ok(Packet::ValidationFailed {
                filename: tail.residue_str()?,
            }),
            tag::CONNECTION_NOT_FOUND => {
                let connection = tail.pop_u16()?;
                tail.finish()?;
                Ok(Packet::ConnectionNotFound { connection })
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

/// Assemble tag + variable field + fixed meta into one buffer.
fn build(tag: u8, variable: &[u8], meta_len: usize, fill: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + variable.len() + meta_len);
    buf.put_u8(tag);
    buf.put_slice(variable);
    fill(&mut buf);
    buf.freeze()
}

/// Pops fixed-size fields off the end of the packet body.
struct TailReader<'a> {
    body: &'a [u8],
}

impl<'a> TailReader<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { body }
    }

    fn pop(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.body.len() < n {
            return Err(WireError::Truncated {
                need: n - self.body.len(),
                have: self.body.len(),
            });
        }
        let (rest, tail) = self.body.split_at(self.body.len() - n);
        self.body = rest;
        Ok(tail)
    }

    fn pop_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.pop(1)?[0])
    }

    fn pop_u16(&mut self) -> Result<u16, WireError> {
        let raw = self.pop(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn pop_u32(&mut self) -> Result<u32, WireError> {
        let raw = self.pop(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn pop_u64(&mut self) -> Result<u64, WireError> {
        let raw = self.pop(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_le_bytes(bytes))
    }

    fn pop_digest(&mut self) -> Result<[u8; SHA256_SIZE], WireError> {
        let raw = self.pop(SHA256_SIZE)?;
        let mut digest = [0u8; SHA256_SIZE];
        digest.copy_from_slice(raw);
        Ok(digest)
    }

    /// Remaining bytes between the tag and the popped fields.
    fn residue(self) -> &'a [u8] {
        self.body
    }

    fn residue_str(self) -> Result<String, WireError> {
        std::str::from_utf8(self.body)
            .map(str::to_owned)
            .map_err(|_| WireError::BadFilename)
    }

    /// For fixed-layout packets: any residue means the sender padded.
    fn finish(self) -> Result<(), WireError> {
        if self.body.is_empty() {
            Ok(())
        } else {
            Err(WireError::Trailing(self.body.len()))
        }
    }
}
