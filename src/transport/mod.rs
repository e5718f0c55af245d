//! Transport module - the two link planes and how they are connected.
//!
//! Provides:
//! - The dual-plane transport over any tokio read/write halves
//! - Unix Domain Socket links for rings of host processes

mod dual;
#[cfg(unix)]
mod socket;

pub use dual::{
    route, BoxedReader, BoxedWriter, DataSink, DiscardSink, DualPlaneTransport, Plane, PlaneLink,
    Route, TransportConfig,
};
pub use crate::writer::WriterConfig;

#[cfg(unix)]
pub use socket::{connect_link, link_path, LinkListener, LinkStream};
