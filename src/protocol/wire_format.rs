//! Control-plane wire format.
//!
//! Every control packet is a fixed-size record:
//! ```text
//! ┌────────┬────────┬─────────────┬──────────────────────────┐
//! │ Type   │ Source │ Destination │ Payload                  │
//! │ 1 byte │ 1 byte │ 1 byte      │ PAYLOAD_CAPACITY bytes   │
//! └────────┴────────┴─────────────┴──────────────────────────┘
//! ```
//!
//! The payload region is always present and zero-filled past the bytes the
//! sender wrote, so equal packets serialize to equal records.

use crate::error::{BlueteethError, Result};

/// Fixed payload capacity of a control packet.
pub const PAYLOAD_CAPACITY: usize = 32;

/// Bytes preceding the payload (type, source, destination).
pub const PACKET_HEADER_SIZE: usize = 3;

/// Total serialized size of a control packet.
pub const PACKET_SIZE: usize = PACKET_HEADER_SIZE + PAYLOAD_CAPACITY;

/// Node address on the ring.
pub type NodeAddress = u8;

/// Lowest address a ring member may hold.
pub const MIN_NODE_ADDRESS: NodeAddress = 1;

/// Highest address a ring member may hold.
pub const MAX_NODE_ADDRESS: NodeAddress = 253;

/// Placeholder destination for packets built before the target is known.
pub const SELF_PLACEHOLDER: NodeAddress = 254;

/// Ring-wide destination used by initialization packets.
pub const RING_BROADCAST: NodeAddress = 255;

/// Check if `address` may be held by a ring member.
#[inline]
pub fn is_member_address(address: NodeAddress) -> bool {
    (MIN_NODE_ADDRESS..=MAX_NODE_ADDRESS).contains(&address)
}

/// Control packet type, first byte of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Liveness check. Empty payload asks, non-empty payload answers.
    Ping = 0,
    /// Start-of-stream notice for the data plane.
    Stream = 1,
    /// Checksum and timing of a received stream.
    StreamResults = 2,
    /// Connect to a Bluetooth source.
    Connect = 3,
    /// Disconnect from the Bluetooth source.
    Disconnect = 4,
    /// Ring formation / address assignment.
    Initialization = 5,
    /// Drop a node from the ring.
    Drop = 6,
    /// Select a discovered device.
    Select = 7,
    /// Start a device scan.
    Scan = 8,
    /// Test traffic.
    Test = 9,
    /// The ring token.
    Token = 10,
}

impl PacketType {
    /// All packet types in wire order.
    pub const ALL: [PacketType; 11] = [
        PacketType::Ping,
        PacketType::Stream,
        PacketType::StreamResults,
        PacketType::Connect,
        PacketType::Disconnect,
        PacketType::Initialization,
        PacketType::Drop,
        PacketType::Select,
        PacketType::Scan,
        PacketType::Test,
        PacketType::Token,
    ];

    /// Wire value.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Human-readable name for logs.
    pub fn name(self) -> &'static str {
        match self {
            PacketType::Ping => "PING",
            PacketType::Stream => "STREAM",
            PacketType::StreamResults => "STREAM_RESULTS",
            PacketType::Connect => "CONNECT",
            PacketType::Disconnect => "DISCONNECT",
            PacketType::Initialization => "INITIALIZATION",
            PacketType::Drop => "DROP",
            PacketType::Select => "SELECT",
            PacketType::Scan => "SCAN",
            PacketType::Test => "TEST",
            PacketType::Token => "TOKEN",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = BlueteethError;

    fn try_from(value: u8) -> Result<Self> {
        PacketType::ALL
            .get(usize::from(value))
            .copied()
            .ok_or_else(|| BlueteethError::MalformedPacket(format!("Unknown packet type {}", value)))
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
