//! Transmit queue for outbound control packets.
//!
//! Producers (terminal commands, reception handlers) call
//! [`TransmitQueue::enqueue`], which only takes a short std mutex and never
//! waits on the link. The transmit pump drains the queue in insertion order
//! with [`TransmitQueue::next_transmissions`], expanding broadcast entries
//! into one unicast packet per ring member at send time.
//!
//! # Example
//!
//! ```
//! use blueteeth::protocol::{Packet, PacketType, SELF_PLACEHOLDER};
//! use blueteeth::queue::{DeliveryMode, TransmitQueue};
//! use blueteeth::ring::StaticRing;
//!
//! let queue = TransmitQueue::new();
//! let ring = StaticRing::new([1, 2, 3]);
//!
//! let stream = Packet::empty(PacketType::Stream, 10, SELF_PLACEHOLDER);
//! queue.enqueue(stream, DeliveryMode::Broadcast);
//!
//! let sends = queue.next_transmissions(&ring).unwrap();
//! assert_eq!(sends.len(), 3);
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::protocol::Packet;
use crate::ring::RingMembership;

/// How a queued packet is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Sent once to the packet's destination.
    Unicast,
    /// Replicated to every ring member except the sender.
    Broadcast,
}

impl DeliveryMode {
    /// Map the boolean "broadcast" flag used by call sites.
    ///
    /// The flag selects the delivery mode only; it never changes the order
    /// in which entries are served.
    #[inline]
    pub fn from_broadcast_flag(broadcast: bool) -> Self {
        if broadcast {
            DeliveryMode::Broadcast
        } else {
            DeliveryMode::Unicast
        }
    }
}

/// FIFO of outbound control packets.
#[derive(Debug, Default)]
pub struct TransmitQueue {
    entries: Mutex<VecDeque<(Packet, DeliveryMode)>>,
    ready: Notify,
}

impl TransmitQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<(Packet, DeliveryMode)>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a packet. Never waits on the link.
    pub fn enqueue(&self, packet: Packet, mode: DeliveryMode) {
        self.lock().push_back((packet, mode));
        tracing::trace!(
            "Queued {} for {} ({:?})",
            packet.kind,
            packet.destination,
            mode
        );
        self.ready.notify_one();
    }

    /// Remove the oldest entry.
    pub fn dequeue_next(&self) -> Option<(Packet, DeliveryMode)> {
        self.lock().pop_front()
    }

    /// Remove the oldest entry and expand it into the packets to transmit.
    ///
    /// A unicast entry yields one packet. A broadcast entry yields one copy
    /// per member of `ring` other than the packet's source, identical except
    /// for the destination. A broadcast with no other members yields an empty
    /// vector.
    pub fn next_transmissions(&self, ring: &dyn RingMembership) -> Option<Vec<Packet>> {
        let (packet, mode) = self.dequeue_next()?;
        Some(expand(packet, mode, ring))
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until something was enqueued since the last wait.
    ///
    /// A notification sent while nobody is waiting is kept, so an enqueue
    /// that races with the pump going idle is never missed.
    pub async fn wait_ready(&self) {
        self.ready.notified().await;
    }
}

/// Expand one queue entry into unicast packets.
pub fn expand(packet: Packet, mode: DeliveryMode, ring: &dyn RingMembership) -> Vec<Packet> {
    match mode {
        DeliveryMode::Unicast => vec![packet],
        DeliveryMode::Broadcast => ring
            .members()
            .into_iter()
            .filter(|&member| member != packet.source)
            .map(|member| packet.with_destination(member))
            .collect(),
    }
}
