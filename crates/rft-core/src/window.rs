//! Sliding transfer window — the unit of reliable transmission.
//!
//! Both roles keep one window per connection: the server stores the chunks
//! it served so a retransmission request can be answered from memory, the
//! client collects arriving chunks until the generation is complete and can
//! be flushed to disk. The 8-bit generation id wraps; a generation always
//! completes before the next one is requested, so at most one stale
//! generation is ever in flight.

use bytes::Bytes;

use crate::bitfield::Bitfield;
use crate::wire::{CHUNK_SIZE, MAX_PACKET_SIZE};

/// Upper bound on a window's chunk count: the presence bitmap of a
/// retransmission request (tag + connection id + window id + bitmap) must
/// still fit a single datagram.
pub const MAX_WINDOW_CHUNKS: u16 = ((MAX_PACKET_SIZE - 4) * 8) as u16;

/// Convert an advertised throughput (MB/s) into a window chunk budget.
pub fn throughput_window(mbps: u16) -> u16 {
    let chunks = mbps as u64 * (1 << 20) / CHUNK_SIZE as u64;
    chunks.clamp(1, MAX_WINDOW_CHUNKS as u64) as u16
}

#[derive(Debug)]
pub struct Window {
    id: u8,
    max_size: u16,
    current_size: u16,
    chunks: Vec<Option<Bytes>>,
    received: Bitfield,
    stored: u16,
}

impl Window {
    pub fn new(max_size: u16) -> Self {
        let max_size = max_size.max(1);
        Self {
            id: 0,
            max_size,
            current_size: 0,
            chunks: vec![None; max_size as usize],
            received: Bitfield::new(max_size),
            stored: 0,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// The requesting side owns the generation counter; the serving side
    /// adopts whatever id the request carries.
    pub fn set_id(&mut self, id: u8) {
        if id != self.id {
            self.id = id;
            self.reset();
        }
    }

    /// Start the next generation: bump the wrapping id and forget all chunks.
    pub fn advance(&mut self) {
        self.id = self.id.wrapping_add(1);
        self.reset();
    }

    /// Start a fresh generation under the current id with `size` slots.
    pub fn begin(&mut self, size: u16) {
        self.reset();
        self.current_size = size.min(self.max_size);
    }

    fn reset(&mut self) {
        self.current_size = 0;
        self.stored = 0;
        self.received = Bitfield::new(self.max_size);
        for slot in &mut self.chunks {
            *slot = None;
        }
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    pub fn current_size(&self) -> u16 {
        self.current_size
    }

    /// Adopt the window size announced by the serving side.
    pub fn set_current_size(&mut self, size: u16) {
        self.current_size = size.min(self.max_size);
    }

    /// Store a chunk at its sequence position. Returns false for positions
    /// outside the current generation and for duplicates — each slot is
    /// written at most once.
    pub fn store(&mut self, sequence: u16, chunk: Bytes) -> bool {
        if sequence >= self.current_size || self.received.get(sequence) {
            return false;
        }
        self.chunks[sequence as usize] = Some(chunk);
        self.received.set(sequence, true);
        self.stored += 1;
        true
    }

    pub fn stored(&self) -> u16 {
        self.stored
    }

    pub fn is_complete(&self) -> bool {
        self.current_size > 0 && self.stored == self.current_size
    }

    pub fn chunk(&self, sequence: u16) -> Option<&Bytes> {
        self.chunks.get(sequence as usize)?.as_ref()
    }

    /// Chunks of the current generation in sequence order, skipping holes.
    pub fn ordered_chunks(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks[..self.current_size as usize]
            .iter()
            .filter_map(Option::as_ref)
    }

    /// Presence map over the current generation: a set bit means the chunk
    /// has arrived. The inverse on the serving side selects retransmissions.
    pub fn present_bits(&self) -> Bitfield {
        let mut bits = Bitfield::new(self.current_size);
        for i in 0..self.current_size {
            bits.set(i, self.received.get(i));
        }
        bits
    }
}
