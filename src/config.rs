//! Node configuration.
//!
//! A node is configured either in code through
//! [`StackBuilder`](crate::stack::StackBuilder) or from a JSON document:
//!
//! ```
//! use blueteeth::config::{NodeRole, StackConfig, TransmitGate};
//!
//! let config = StackConfig::from_json(r#"{
//!     "address": 10,
//!     "role": "master",
//!     "ring": [10, 1, 2],
//!     "transmit_gate": "token"
//! }"#).unwrap();
//!
//! assert_eq!(config.role, NodeRole::Master);
//! assert_eq!(config.transmit_gate, TransmitGate::Token);
//! assert_eq!(config.max_data_plane_payload_size, 700);
//! ```
//!
//! Every field except `address` has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backpressure::{DEFAULT_MAX_PENDING, DEFAULT_TIMEOUT};
use crate::error::{BlueteethError, Result};
use crate::packager::MAX_DATA_PLANE_PAYLOAD_SIZE;
use crate::protocol::{is_member_address, NodeAddress};
use crate::ring::StaticRing;
use crate::token::RING_TOKEN_GENERATION_DELAY_MS;
use crate::writer::{WriterConfig, DEFAULT_CHANNEL_CAPACITY};

/// Default time a node holds the token before passing it on.
pub const DEFAULT_TOKEN_HOLD_MS: u64 = 5;

/// Which behaviour a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Relays audio and commands, keeps the token alive.
    Master,
    /// Answers the master.
    #[default]
    Peer,
}

/// When queued control packets may be transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransmitGate {
    /// Only while this node holds the token.
    #[default]
    Token,
    /// As soon as they are queued; the token only circulates.
    Free,
}

/// Configuration of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// This node's ring address.
    pub address: NodeAddress,
    /// Master or peer behaviour.
    pub role: NodeRole,
    /// Ring members in token order, including this node.
    pub ring: Vec<NodeAddress>,
    /// Maximum raw bytes per data-plane frame.
    pub max_data_plane_payload_size: usize,
    /// Token watchdog period in milliseconds.
    pub token_generation_delay_ms: u64,
    /// Time the token is held before it is passed on, in milliseconds.
    pub token_hold_ms: u64,
    /// Transmission policy for queued control packets.
    pub transmit_gate: TransmitGate,
    /// Frames in flight per link before senders wait.
    pub max_pending_frames: usize,
    /// Writer channel capacity per link.
    pub channel_capacity: usize,
    /// Time a sender waits on a full link, in milliseconds.
    pub backpressure_timeout_ms: u64,
    /// Pass received data-plane bytes downstream. Defaults to on for peers.
    pub relay_data: Option<bool>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            address: 0,
            role: NodeRole::default(),
            ring: Vec::new(),
            max_data_plane_payload_size: MAX_DATA_PLANE_PAYLOAD_SIZE,
            token_generation_delay_ms: RING_TOKEN_GENERATION_DELAY_MS,
            token_hold_ms: DEFAULT_TOKEN_HOLD_MS,
            transmit_gate: TransmitGate::default(),
            max_pending_frames: DEFAULT_MAX_PENDING,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            relay_data: None,
        }
    }
}

impl StackConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the stack cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`BlueteethError::Config`] if the address is reserved, the
    /// ring is non-empty but misses this node or holds a reserved address,
    /// or a size or period is zero.
    pub fn validate(&self) -> Result<()> {
        if !is_member_address(self.address) {
            return Err(BlueteethError::Config(format!(
                "Address {} is not a ring member address",
                self.address
            )));
        }

        if let Some(&reserved) = self.ring.iter().find(|&&a| !is_member_address(a)) {
            return Err(BlueteethError::Config(format!(
                "Ring contains reserved address {}",
                reserved
            )));
        }

        if !self.ring.is_empty() && !self.ring.contains(&self.address) {
            return Err(BlueteethError::Config(format!(
                "Ring does not contain this node's address {}",
                self.address
            )));
        }

        let zero = [
            ("max_data_plane_payload_size", self.max_data_plane_payload_size == 0),
            ("token_generation_delay_ms", self.token_generation_delay_ms == 0),
            ("max_pending_frames", self.max_pending_frames == 0),
            ("channel_capacity", self.channel_capacity == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(BlueteethError::Config(format!("{} must be non-zero", name)));
        }

        Ok(())
    }

    /// Ring membership described by `ring`.
    pub fn static_ring(&self) -> StaticRing {
        StaticRing::new(self.ring.iter().copied())
    }

    /// Watchdog period.
    pub fn token_generation_delay(&self) -> Duration {
        Duration::from_millis(self.token_generation_delay_ms)
    }

    /// Token hold time.
    pub fn token_hold(&self) -> Duration {
        Duration::from_millis(self.token_hold_ms)
    }

    /// Whether received data is relayed downstream.
    pub fn relays_data(&self) -> bool {
        self.relay_data.unwrap_or(self.role == NodeRole::Peer)
    }

    /// Writer settings for both links.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: Duration::from_millis(self.backpressure_timeout_ms),
        }
    }
}
