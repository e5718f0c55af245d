//! Packet buffer for accumulating partial control-plane reads.
//!
//! Uses `bytes::BytesMut` for buffer management. Control records have a
//! fixed size, so boundary recognition is a matter of counting bytes: every
//! `PACKET_SIZE` bytes form one record.
//!
//! Records that fail to parse are dropped and logged here, at the reception
//! boundary, and never surface to callers as errors.
//!
//! # Example
//!
//! ```
//! use blueteeth::protocol::{Packet, PacketBuffer, PacketType};
//!
//! let record = Packet::empty(PacketType::Ping, 3, 1).encode();
//! let mut buffer = PacketBuffer::new();
//!
//! assert!(buffer.push(&record[..10]).is_empty());
//! let packets = buffer.push(&record[10..]);
//! assert_eq!(packets.len(), 1);
//! ```

use bytes::BytesMut;

use super::wire_format::PACKET_SIZE;
use super::Packet;

/// Buffer for accumulating incoming bytes and extracting complete packets.
pub struct PacketBuffer {
    /// Accumulated bytes from link reads.
    buffer: BytesMut,
    /// Records dropped because they failed to parse.
    dropped: u64,
}

impl PacketBuffer {
    /// Create a new packet buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(PACKET_SIZE * 16),
            dropped: 0,
        }
    }

    /// Push data into the buffer and extract all complete packets.
    ///
    /// Partial records are kept for the next push.
    pub fn push(&mut self, data: &[u8]) -> Vec<Packet> {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::with_capacity(self.buffer.len() / PACKET_SIZE);

        while self.buffer.len() >= PACKET_SIZE {
            let record = self.buffer.split_to(PACKET_SIZE);
            match Packet::decode(&record) {
                Ok(packet) => packets.push(packet),
                Err(e) => {
                    self.dropped += 1;
                    tracing::warn!("Dropping malformed control record: {}", e);
                }
            }
        }

        packets
    }

    /// Number of records dropped as malformed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}
