//! Protocol module - control-plane wire format and packet framing.
//!
//! This module implements the binary protocol for the control plane:
//! - Fixed-size packet record encoding/decoding
//! - Packet buffer for accumulating partial reads
//! - Node addressing constants

mod packet;
mod packet_buffer;
mod wire_format;

pub use packet::{Packet, StreamRequest, StreamResults};
pub use packet_buffer::PacketBuffer;
pub use wire_format::{
    is_member_address, NodeAddress, PacketType, MAX_NODE_ADDRESS, MIN_NODE_ADDRESS,
    PACKET_HEADER_SIZE, PACKET_SIZE, PAYLOAD_CAPACITY, RING_BROADCAST, SELF_PLACEHOLDER,
};
