//! Node roles.
//!
//! The master and the peers run the same stack and differ only in how they
//! react to received packets and whether they keep the token alive. That
//! difference lives behind [`Role`]; the stack holds one `Arc<dyn Role>`.
//!
//! - [`MasterRole`]: reports ping responses and stream results on the
//!   console and runs the token watchdog.
//! - [`PeerRole`]: answers pings with its address and answers a STREAM
//!   request with the checksum and timing of the bytes received on the data
//!   plane ([`StreamStats`]).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::NodeRole;
use crate::console::Console;
use crate::dispatch::ReplyContext;
use crate::error::Result;
use crate::protocol::{NodeAddress, Packet, PacketType, StreamRequest, StreamResults};
use crate::transport::{DataSink, DiscardSink};

/// Behaviour of a node.
///
/// Hooks run on the reception task and must not block: answers go through
/// [`ReplyContext`], which only enqueues.
pub trait Role: Send + Sync + 'static {
    /// Which role this is.
    fn kind(&self) -> NodeRole;

    /// Where decoded data-plane bytes go.
    fn data_sink(&self) -> Arc<dyn DataSink> {
        Arc::new(DiscardSink)
    }

    /// PING. An empty payload asks for a response carrying this node's
    /// address as text; anything else is such a response.
    fn on_ping(&self, packet: &Packet, ctx: &ReplyContext) -> Result<()> {
        if packet.has_empty_payload() {
            ctx.respond(PacketType::Ping, ctx.address().to_string().as_bytes())
        } else {
            self.on_ping_response(packet, ctx)
        }
    }

    /// A PING carrying a responder's address.
    fn on_ping_response(&self, packet: &Packet, _ctx: &ReplyContext) -> Result<()> {
        tracing::debug!("Ping response from {}", packet.source);
        Ok(())
    }

    /// STREAM request.
    fn on_stream(&self, packet: &Packet, ctx: &ReplyContext) -> Result<()> {
        self.on_unhandled(packet, ctx)
    }

    /// STREAM_RESULTS report.
    fn on_stream_results(&self, packet: &Packet, ctx: &ReplyContext) -> Result<()> {
        self.on_unhandled(packet, ctx)
    }

    /// INITIALIZATION. Payload byte 0 is the ring formation start flag.
    ///
    /// Address claiming belongs to the ring membership implementation; the
    /// default only records that formation was requested.
    fn on_initialization(&self, packet: &Packet, _ctx: &ReplyContext) -> Result<()> {
        tracing::info!(
            "Ring initialization from {} (start flag {})",
            packet.source,
            packet.payload()[0]
        );
        Ok(())
    }

    /// Any type without a dedicated hook.
    fn on_unhandled(&self, packet: &Packet, _ctx: &ReplyContext) -> Result<()> {
        tracing::debug!(
            "Unknown packet type received: {} from {}",
            packet.kind,
            packet.source
        );
        Ok(())
    }
}

/// Master node behaviour.
#[derive(Debug)]
pub struct MasterRole {
    console: Arc<Console>,
    ping_responses: Mutex<Vec<NodeAddress>>,
    stream_results: Mutex<Vec<(NodeAddress, StreamResults)>>,
}

impl MasterRole {
    /// Create a master reporting on `console`.
    pub fn new(console: Arc<Console>) -> Self {
        Self {
            console,
            ping_responses: Mutex::new(Vec::new()),
            stream_results: Mutex::new(Vec::new()),
        }
    }

    /// Addresses that answered a ping, in arrival order.
    pub fn ping_responses(&self) -> Vec<NodeAddress> {
        lock(&self.ping_responses).clone()
    }

    /// Stream reports received, in arrival order.
    pub fn stream_results(&self) -> Vec<(NodeAddress, StreamResults)> {
        lock(&self.stream_results).clone()
    }
}

impl Role for MasterRole {
    fn kind(&self) -> NodeRole {
        NodeRole::Master
    }

    fn on_ping_response(&self, packet: &Packet, _ctx: &ReplyContext) -> Result<()> {
        let text = String::from_utf8_lossy(packet.payload_trimmed());
        {
            let mut out = self.console.lock();
            if let Err(e) = out
                .write_line("Ping packet type received.")
                .and_then(|()| out.write_line(&format!("Response from address {}", text)))
            {
                tracing::warn!("Console write failed: {}", e);
            }
        }
        lock(&self.ping_responses).push(packet.source);
        Ok(())
    }

    fn on_stream_results(&self, packet: &Packet, _ctx: &ReplyContext) -> Result<()> {
        let results = StreamResults::from_payload(packet.payload());
        self.console.line(&format!(
            "Stream results from ADDR{}: Checksum = {}, Time = {}",
            packet.source, results.checksum, results.elapsed_ms
        ));
        lock(&self.stream_results).push((packet.source, results));
        Ok(())
    }
}

/// Peer node behaviour.
#[derive(Debug)]
pub struct PeerRole {
    console: Arc<Console>,
    stats: Arc<StreamStats>,
}

impl PeerRole {
    /// Create a peer reporting on `console`.
    pub fn new(console: Arc<Console>) -> Self {
        Self {
            console,
            stats: Arc::new(StreamStats::new()),
        }
    }

    /// Statistics of the data plane stream.
    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }
}

impl Role for PeerRole {
    fn kind(&self) -> NodeRole {
        NodeRole::Peer
    }

    fn data_sink(&self) -> Arc<dyn DataSink> {
        self.stats.clone()
    }

    fn on_stream(&self, packet: &Packet, ctx: &ReplyContext) -> Result<()> {
        let request = StreamRequest::from_payload(packet.payload());
        tracing::debug!(
            "Stream of {} bytes announced by {}",
            request.length,
            packet.source
        );
        self.stats.arm(ctx.clone(), u64::from(request.length))
    }

    fn on_stream_results(&self, packet: &Packet, _ctx: &ReplyContext) -> Result<()> {
        let results = StreamResults::from_payload(packet.payload());
        self.console.line(&format!(
            "Stream results from ADDR{}: Checksum = {}, Time = {}",
            packet.source, results.checksum, results.elapsed_ms
        ));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StreamState {
    checksum: u32,
    received: u64,
    first: Option<Instant>,
    last: Option<Instant>,
    /// Who asked for a report and how many bytes to wait for.
    pending: Option<(ReplyContext, u64)>,
}

impl StreamState {
    fn is_complete(&self) -> bool {
        match &self.pending {
            Some((_, expected)) => self.received >= *expected,
            None => false,
        }
    }

    fn results(&self) -> StreamResults {
        let elapsed = match (self.first, self.last) {
            (Some(first), Some(last)) => last.duration_since(first),
            _ => Duration::ZERO,
        };
        StreamResults {
            checksum: self.checksum,
            elapsed_ms: u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX),
        }
    }
}

/// Checksum and timing of the bytes received on the data plane.
///
/// Counts bytes until a STREAM request arrives and the announced number of
/// bytes is in, then queues STREAM_RESULTS to the requester and starts over.
/// The checksum is the wrapping sum of the bytes; the time runs from the
/// first to the last counted byte. Bytes decoded in the same run after the
/// announced length are group padding and are not counted.
#[derive(Debug, Default)]
pub struct StreamStats {
    state: Mutex<StreamState>,
}

impl StreamStats {
    /// Create empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Results so far and the number of bytes counted.
    pub fn snapshot(&self) -> (StreamResults, u64) {
        let state = lock(&self.state);
        (state.results(), state.received)
    }

    /// Report to `ctx`'s requester once `expected` bytes are in.
    ///
    /// Reports immediately if they already are, or if `expected` is zero.
    pub fn arm(&self, ctx: ReplyContext, expected: u64) -> Result<()> {
        let report = {
            let mut state = lock(&self.state);
            state.pending = Some((ctx, expected));
            take_report(&mut state)
        };
        send_report(report)
    }
}

impl DataSink for StreamStats {
    fn on_data(&self, data: &[u8]) {
        let now = Instant::now();
        let report = {
            let mut state = lock(&self.state);
            for &byte in data {
                if state.is_complete() {
                    break;
                }
                state.checksum = state.checksum.wrapping_add(u32::from(byte));
                state.received += 1;
            }
            state.first.get_or_insert(now);
            state.last = Some(now);
            take_report(&mut state)
        };

        if let Err(e) = send_report(report) {
            tracing::warn!("Failed to queue stream results: {}", e);
        }
    }
}

fn take_report(state: &mut StreamState) -> Option<(ReplyContext, StreamResults)> {
    if !state.is_complete() {
        return None;
    }
    let results = state.results();
    let (ctx, _) = state.pending.take()?;
    *state = StreamState::default();
    Some((ctx, results))
}

fn send_report(report: Option<(ReplyContext, StreamResults)>) -> Result<()> {
    match report {
        Some((ctx, results)) => {
            tracing::info!(
                "Stream complete: checksum {} in {} ms, reporting to {}",
                results.checksum,
                results.elapsed_ms,
                ctx.requester()
            );
            ctx.respond(PacketType::StreamResults, &results.to_payload())
        }
        None => Ok(()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
