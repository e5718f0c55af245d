//! Ring membership.
//!
//! The stack only needs a read-only view of who is on the ring: the member
//! list used to fan out broadcasts and the downstream neighbour that receives
//! the token. How members claim their addresses is left to the implementor of
//! [`RingMembership`].

use crate::protocol::{is_member_address, NodeAddress};

/// Read-only view of the ring's members.
pub trait RingMembership: Send + Sync + 'static {
    /// Members in ring order (the order the token travels).
    fn members(&self) -> Vec<NodeAddress>;

    /// The member after `address` in ring order, wrapping around.
    ///
    /// Returns `None` if `address` is not a member or it is alone on the ring.
    fn next_after(&self, address: NodeAddress) -> Option<NodeAddress> {
        let members = self.members();
        let pos = members.iter().position(|&m| m == address)?;
        let next = members[(pos + 1) % members.len()];
        (next != address).then_some(next)
    }

    /// Number of members.
    fn size(&self) -> usize {
        self.members().len()
    }
}

/// Fixed ring membership known at configuration time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticRing {
    members: Vec<NodeAddress>,
}

impl StaticRing {
    /// Create a ring from members in token order.
    ///
    /// Reserved addresses and duplicates are ignored.
    pub fn new(members: impl IntoIterator<Item = NodeAddress>) -> Self {
        let mut unique = Vec::new();
        for member in members {
            if !is_member_address(member) {
                tracing::warn!("Ignoring reserved ring address {}", member);
                continue;
            }
            if !unique.contains(&member) {
                unique.push(member);
            }
        }
        Self { members: unique }
    }

    /// Check if `address` is on the ring.
    pub fn contains(&self, address: NodeAddress) -> bool {
        self.members.contains(&address)
    }
}

impl RingMembership for StaticRing {
    fn members(&self) -> Vec<NodeAddress> {
        self.members.clone()
    }
}
