//! Control packet with typed accessors.
//!
//! # Example
//!
//! ```
//! use blueteeth::protocol::{Packet, PacketType, PACKET_SIZE};
//!
//! let ping = Packet::empty(PacketType::Ping, 3, 1);
//! let record = ping.encode();
//!
//! assert_eq!(record.len(), PACKET_SIZE);
//! assert_eq!(Packet::decode(&record).unwrap(), ping);
//! ```

use super::wire_format::{
    NodeAddress, PacketType, PACKET_HEADER_SIZE, PACKET_SIZE, PAYLOAD_CAPACITY, RING_BROADCAST,
    SELF_PLACEHOLDER,
};
use crate::error::{BlueteethError, Result};

/// A control-plane packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    /// Packet type.
    pub kind: PacketType,
    /// Originating node.
    pub source: NodeAddress,
    /// Target node.
    pub destination: NodeAddress,
    payload: [u8; PAYLOAD_CAPACITY],
}

impl Packet {
    /// Create a packet, copying `payload` into the fixed payload region.
    ///
    /// # Errors
    ///
    /// Returns [`BlueteethError::PayloadTooLarge`] if `payload` does not fit.
    pub fn new(
        kind: PacketType,
        source: NodeAddress,
        destination: NodeAddress,
        payload: &[u8],
    ) -> Result<Self> {
        if payload.len() > PAYLOAD_CAPACITY {
            return Err(BlueteethError::PayloadTooLarge {
                len: payload.len(),
                capacity: PAYLOAD_CAPACITY,
            });
        }

        let mut packet = Self::empty(kind, source, destination);
        packet.payload[..payload.len()].copy_from_slice(payload);
        Ok(packet)
    }

    /// Create a packet with an all-zero payload.
    pub fn empty(kind: PacketType, source: NodeAddress, destination: NodeAddress) -> Self {
        Self {
            kind,
            source,
            destination,
            payload: [0; PAYLOAD_CAPACITY],
        }
    }

    /// The full payload region (always `PAYLOAD_CAPACITY` bytes).
    #[inline]
    pub fn payload(&self) -> &[u8; PAYLOAD_CAPACITY] {
        &self.payload
    }

    /// Payload with trailing zero bytes removed.
    pub fn payload_trimmed(&self) -> &[u8] {
        let end = self
            .payload
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        &self.payload[..end]
    }

    /// Check if the payload region is all zero.
    #[inline]
    pub fn has_empty_payload(&self) -> bool {
        self.payload.iter().all(|&b| b == 0)
    }

    /// Copy of this packet sent to another destination.
    #[inline]
    pub fn with_destination(mut self, destination: NodeAddress) -> Self {
        self.destination = destination;
        self
    }

    /// Check if this is the ring token.
    #[inline]
    pub fn is_token(&self) -> bool {
        self.kind == PacketType::Token
    }

    /// Check if this packet is addressed ring-wide.
    #[inline]
    pub fn is_ring_broadcast(&self) -> bool {
        self.destination == RING_BROADCAST
    }

    /// Check if the destination still has to be filled in.
    #[inline]
    pub fn is_unresolved(&self) -> bool {
        self.destination == SELF_PLACEHOLDER
    }

    /// Serialize to a fixed-size record.
    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Serialize into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `PACKET_SIZE`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = self.kind.as_byte();
        buf[1] = self.source;
        buf[2] = self.destination;
        buf[PACKET_HEADER_SIZE..PACKET_SIZE].copy_from_slice(&self.payload);
    }

    /// Parse a record. Bytes past `PACKET_SIZE` are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`BlueteethError::MalformedPacket`] if `buf` is shorter than a
    /// record or the type byte is unknown.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PACKET_SIZE {
            return Err(BlueteethError::MalformedPacket(format!(
                "Record of {} bytes is shorter than {}",
                buf.len(),
                PACKET_SIZE
            )));
        }

        let kind = PacketType::try_from(buf[0])?;
        let mut payload = [0u8; PAYLOAD_CAPACITY];
        payload.copy_from_slice(&buf[PACKET_HEADER_SIZE..PACKET_SIZE]);

        Ok(Self {
            kind,
            source: buf[1],
            destination: buf[2],
            payload,
        })
    }
}

/// Payload of a STREAM_RESULTS packet.
///
/// Both fields are little-endian `u32`s at payload offsets 0 and 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamResults {
    /// Wrapping sum of every payload byte received on the data plane.
    pub checksum: u32,
    /// Milliseconds between the first received byte and the report.
    pub elapsed_ms: u32,
}

impl StreamResults {
    /// Encoded payload size.
    pub const SIZE: usize = 8;

    /// Encode into payload bytes.
    pub fn to_payload(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4..8].copy_from_slice(&self.elapsed_ms.to_le_bytes());
        buf
    }

    /// Decode from a packet payload.
    pub fn from_payload(payload: &[u8; PAYLOAD_CAPACITY]) -> Self {
        Self {
            checksum: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
            elapsed_ms: u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]),
        }
    }
}

/// Payload of a STREAM packet.
///
/// Announces how many stream bytes the sender pushed into the data plane, as
/// a little-endian `u32` at payload offset 0. Zero means unknown: the receiver
/// reports whatever it has received so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamRequest {
    /// Stream length in bytes, before padding.
    pub length: u32,
}

impl StreamRequest {
    /// Encoded payload size.
    pub const SIZE: usize = 4;

    /// Encode into payload bytes.
    pub fn to_payload(self) -> [u8; Self::SIZE] {
        self.length.to_le_bytes()
    }

    /// Decode from a packet payload.
    pub fn from_payload(payload: &[u8; PAYLOAD_CAPACITY]) -> Self {
        Self {
            length: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_record_layout() {
        let ping = Packet::new(PacketType::Ping, 3, 1, &[]).unwrap();
        let record = ping.encode();

        assert_eq!(record.len(), 3 + PAYLOAD_CAPACITY);
        assert_eq!(record[0], PacketType::Ping.as_byte());
        assert_eq!(record[1], 3);
        assert_eq!(record[2], 1);
        assert!(record[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_payload_is_zero_filled() {
        let packet = Packet::new(PacketType::Test, 1, 2, b"abc").unwrap();
        let record = packet.encode();

        assert_eq!(&record[3..6], b"abc");
        assert!(record[6..].iter().all(|&b| b == 0));
        assert_eq!(packet.payload_trimmed(), b"abc");
    }

    #[test]
    fn test_payload_at_capacity() {
        let payload = [0xAB; PAYLOAD_CAPACITY];
        let packet = Packet::new(PacketType::Test, 1, 2, &payload).unwrap();
        assert_eq!(packet.payload(), &payload);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = [0u8; PAYLOAD_CAPACITY + 1];
        let result = Packet::new(PacketType::Test, 1, 2, &payload);

        match result {
            Err(BlueteethError::PayloadTooLarge { len, capacity }) => {
                assert_eq!(len, PAYLOAD_CAPACITY + 1);
                assert_eq!(capacity, PAYLOAD_CAPACITY);
            }
            other => panic!("expected PayloadTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_round_trip() {
        let packet = Packet::new(PacketType::StreamResults, 7, 10, &[1, 2, 3, 4]).unwrap();
        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_decode_truncated() {
        let record = Packet::empty(PacketType::Ping, 1, 2).encode();
        let result = Packet::decode(&record[..PACKET_SIZE - 1]);
        assert!(matches!(result, Err(BlueteethError::MalformedPacket(_))));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut record = Packet::empty(PacketType::Ping, 1, 2).encode();
        record[0] = 0xEE;
        assert!(Packet::decode(&record)
            .unwrap_err()
            .to_string()
            .contains("Unknown packet type"));
    }

    #[test]
    fn test_with_destination_keeps_everything_else() {
        let original = Packet::new(PacketType::Stream, 10, SELF_PLACEHOLDER, b"x").unwrap();
        assert!(original.is_unresolved());

        let resolved = original.with_destination(4);
        assert_eq!(resolved.destination, 4);
        assert_eq!(resolved.kind, original.kind);
        assert_eq!(resolved.source, original.source);
        assert_eq!(resolved.payload(), original.payload());
        assert!(!resolved.is_unresolved());
    }

    #[test]
    fn test_empty_payload_helpers() {
        let packet = Packet::empty(PacketType::Ping, 1, 2);
        assert!(packet.has_empty_payload());
        assert!(packet.payload_trimmed().is_empty());
    }

    #[test]
    fn test_stream_results_payload() {
        let results = StreamResults {
            checksum: 0x0102_0304,
            elapsed_ms: 1500,
        };
        let packet =
            Packet::new(PacketType::StreamResults, 2, 10, &results.to_payload()).unwrap();

        assert_eq!(&packet.payload()[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(StreamResults::from_payload(packet.payload()), results);
    }

    #[test]
    fn test_stream_request_payload() {
        let request = StreamRequest { length: 40_000 };
        let packet = Packet::new(PacketType::Stream, 10, 2, &request.to_payload()).unwrap();

        assert_eq!(StreamRequest::from_payload(packet.payload()), request);
        assert_eq!(
            StreamRequest::from_payload(Packet::empty(PacketType::Stream, 10, 2).payload()).length,
            0
        );
    }
}
