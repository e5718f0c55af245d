//! # blueteeth
//!
//! Network stack for a ring of audio nodes joined by serial links.
//!
//! Every node has two links to each neighbour:
//!
//! - **Control Plane**: fixed 35-byte packets (type, source, destination,
//!   32-byte payload). A token circulates on it; only its holder transmits.
//! - **Data Plane**: raw audio bytes, septet-encoded into sentinel-framed
//!   groups so a receiver can find frame boundaries in a byte stream.
//!
//! ## Architecture
//!
//! ```text
//!   upstream ──► control reader ──► route ──► token / reception / forward
//!            ──► data reader    ──► decode ──► sink (+ relay downstream)
//!
//!   commands ──► transmit queue ──► transmit pump ──► control writer ──► downstream
//!   audio    ──► data backlog   ──► stream packager ──► data writer  ──► downstream
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use blueteeth::{Command, NodeRole, PlaneLink, Stack};
//!
//! #[tokio::main]
//! async fn main() -> blueteeth::Result<()> {
//!     let stack = Stack::builder(10)
//!         .role(NodeRole::Master)
//!         .ring([10, 1, 2])
//!         .start(
//!             PlaneLink::new(control_upstream, control_downstream),
//!             PlaneLink::new(data_upstream, data_downstream),
//!         )?;
//!
//!     Command::Ping.apply(&stack)?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod command;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod error;
pub mod packager;
pub mod protocol;
pub mod queue;
pub mod ring;
pub mod role;
pub mod token;
pub mod transport;

mod backpressure;
mod stack;
mod writer;

pub use command::Command;
pub use config::{NodeRole, StackConfig, TransmitGate};
pub use error::{BlueteethError, Result};
pub use role::{MasterRole, PeerRole, Role};
pub use stack::{Stack, StackBuilder};
pub use transport::PlaneLink;
