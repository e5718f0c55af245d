//! Reception dispatcher.
//!
//! Every control packet delivered to this node is routed by type to a hook
//! of the node's [`Role`]. The match is exhaustive, so adding a packet type
//! forces a decision here.
//!
//! Hooks answer through a [`ReplyContext`], which only enqueues: a handler
//! never waits on the link or on the token.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use blueteeth::dispatch::{dispatch, ReplyContext};
//! use blueteeth::protocol::{Packet, PacketType};
//! use blueteeth::queue::TransmitQueue;
//! use blueteeth::role::PeerRole;
//! use blueteeth::console::Console;
//!
//! let queue = Arc::new(TransmitQueue::new());
//! let role = PeerRole::new(Arc::new(Console::discard()));
//!
//! let ping = Packet::empty(PacketType::Ping, 10, 2);
//! let ctx = ReplyContext::new(2, ping.source, queue.clone());
//! dispatch(&role, &ping, &ctx).unwrap();
//!
//! let (reply, _) = queue.dequeue_next().unwrap();
//! assert_eq!(reply.payload_trimmed(), b"2");
//! ```

use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{NodeAddress, Packet, PacketType};
use crate::queue::{DeliveryMode, TransmitQueue};
use crate::role::Role;
use crate::transport::DualPlaneTransport;

/// Context handed to role hooks for answering a packet.
///
/// Cheap to clone; clones share the transmit queue.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    address: NodeAddress,
    requester: NodeAddress,
    queue: Arc<TransmitQueue>,
}

impl ReplyContext {
    /// Context for a packet from `requester` received by node `address`.
    pub fn new(address: NodeAddress, requester: NodeAddress, queue: Arc<TransmitQueue>) -> Self {
        Self {
            address,
            requester,
            queue,
        }
    }

    /// This node's address.
    #[inline]
    pub fn address(&self) -> NodeAddress {
        self.address
    }

    /// Source of the packet being handled.
    #[inline]
    pub fn requester(&self) -> NodeAddress {
        self.requester
    }

    /// Queue a reply of `kind` to the requester.
    ///
    /// # Errors
    ///
    /// Returns `PayloadTooLarge` if `payload` does not fit a packet.
    pub fn respond(&self, kind: PacketType, payload: &[u8]) -> Result<()> {
        let reply = Packet::new(kind, self.address, self.requester, payload)?;
        self.queue.enqueue(reply, DeliveryMode::Unicast);
        Ok(())
    }

    /// Queue an arbitrary packet.
    pub fn queue_packet(&self, packet: Packet, mode: DeliveryMode) {
        self.queue.enqueue(packet, mode);
    }
}

/// Route `packet` to the matching hook of `role`.
pub fn dispatch(role: &dyn Role, packet: &Packet, ctx: &ReplyContext) -> Result<()> {
    match packet.kind {
        PacketType::Ping => role.on_ping(packet, ctx),
        PacketType::Stream => role.on_stream(packet, ctx),
        PacketType::StreamResults => role.on_stream_results(packet, ctx),
        PacketType::Initialization => role.on_initialization(packet, ctx),
        PacketType::Connect
        | PacketType::Disconnect
        | PacketType::Drop
        | PacketType::Select
        | PacketType::Scan
        | PacketType::Test => role.on_unhandled(packet, ctx),
        PacketType::Token => {
            // The transport hands tokens to the token manager.
            tracing::warn!("Token from {} reached the dispatcher", packet.source);
            Ok(())
        }
    }
}

/// Dispatch every packet delivered by `transport` until its control link
/// closes.
pub async fn run_reception(
    transport: Arc<DualPlaneTransport>,
    role: Arc<dyn Role>,
    queue: Arc<TransmitQueue>,
) {
    let address = transport.address();

    while let Some(packet) = transport.receive_control_packet().await {
        tracing::debug!("Node {} received {} from {}", address, packet.kind, packet.source);

        let ctx = ReplyContext::new(address, packet.source, queue.clone());
        if let Err(e) = dispatch(role.as_ref(), &packet, &ctx) {
            tracing::warn!(
                "Handler for {} from {} failed: {}",
                packet.kind,
                packet.source,
                e
            );
        }
    }

    tracing::debug!("Reception on node {} stopped", address);
}
