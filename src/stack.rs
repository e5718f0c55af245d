//! Stack builder and the running node.
//!
//! The [`StackBuilder`] provides a fluent API for configuring a node. Its
//! `start` wires the components together and spawns the node's tasks:
//!
//! ```text
//!  terminal ─► Command ─► TransmitQueue ─► transmit pump ─┐
//!                                              ▲          ▼
//!                              TokenManager ───┘   DualPlaneTransport ◄─► links
//!                               ▲ watchdog (master)       │
//!  audio ─► DataBacklog ─► packager ─► data frames ───────┘
//!                                     reception ◄─ control packets
//!                                         │
//!                                       Role hooks
//! ```
//!
//! # Example
//!
//! ```ignore
//! use blueteeth::{NodeRole, PlaneLink, Stack};
//!
//! let stack = Stack::builder(10)
//!     .role(NodeRole::Master)
//!     .ring([10, 1, 2])
//!     .start(
//!         PlaneLink::new(control_upstream, control_downstream),
//!         PlaneLink::new(data_upstream, data_downstream),
//!     )?;
//!
//! stack.on_bytes_received(&pcm);
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{NodeRole, StackConfig, TransmitGate};
use crate::console::Console;
use crate::dispatch::run_reception;
use crate::error::{BlueteethError, Result};
use crate::packager::{DataBacklog, StreamPackager};
use crate::protocol::{NodeAddress, Packet};
use crate::queue::{DeliveryMode, TransmitQueue};
use crate::role::{MasterRole, PeerRole, Role};
use crate::ring::RingMembership;
use crate::token::{run_watchdog, TokenManager, TokenState};
use crate::transport::{DualPlaneTransport, PlaneLink, TransportConfig};

/// Builder for configuring and starting a node.
pub struct StackBuilder {
    config: StackConfig,
    console: Option<Arc<Console>>,
    role: Option<Arc<dyn Role>>,
    membership: Option<Arc<dyn RingMembership>>,
}

impl StackBuilder {
    /// Create a builder for the node at `address` with default settings.
    pub fn new(address: NodeAddress) -> Self {
        Self::from_config(StackConfig {
            address,
            ..StackConfig::default()
        })
    }

    /// Create a builder from a loaded configuration.
    pub fn from_config(config: StackConfig) -> Self {
        Self {
            config,
            console: None,
            role: None,
            membership: None,
        }
    }

    /// Run as master or peer.
    ///
    /// Default: peer
    pub fn role(mut self, role: NodeRole) -> Self {
        self.config.role = role;
        self
    }

    /// Use a custom role implementation.
    pub fn with_role(mut self, role: Arc<dyn Role>) -> Self {
        self.config.role = role.kind();
        self.role = Some(role);
        self
    }

    /// Ring members in token order, including this node.
    pub fn ring(mut self, members: impl IntoIterator<Item = NodeAddress>) -> Self {
        self.config.ring = members.into_iter().collect();
        self
    }

    /// Use a custom ring membership instead of the configured member list.
    pub fn membership(mut self, membership: Arc<dyn RingMembership>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Maximum raw bytes per data-plane frame.
    ///
    /// Default: 700
    pub fn max_data_plane_payload_size(mut self, size: usize) -> Self {
        self.config.max_data_plane_payload_size = size;
        self
    }

    /// Token watchdog period.
    ///
    /// Default: 1 second
    pub fn token_generation_delay(mut self, period: Duration) -> Self {
        self.config.token_generation_delay_ms = period.as_millis() as u64;
        self
    }

    /// How long the token is held before it is passed on.
    ///
    /// Default: 5 ms
    pub fn token_hold(mut self, hold: Duration) -> Self {
        self.config.token_hold_ms = hold.as_millis() as u64;
        self
    }

    /// When queued control packets may be sent.
    ///
    /// Default: only while holding the token
    pub fn transmit_gate(mut self, gate: TransmitGate) -> Self {
        self.config.transmit_gate = gate;
        self
    }

    /// Frames in flight per link before senders wait.
    ///
    /// Default: 64
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.max_pending_frames = limit;
        self
    }

    /// Writer channel capacity per link.
    ///
    /// Default: 256
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Time a sender waits on a full link.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Pass received data-plane bytes downstream.
    ///
    /// Default: on for peers, off for the master
    pub fn relay_data(mut self, relay: bool) -> Self {
        self.config.relay_data = Some(relay);
        self
    }

    /// Where status lines are printed.
    ///
    /// Default: stdout
    pub fn console(mut self, console: Arc<Console>) -> Self {
        self.console = Some(console);
        self
    }

    /// Validate the configuration, wire the components and spawn the tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self, control: PlaneLink, data: PlaneLink) -> Result<Stack> {
        self.config.validate()?;

        let config = self.config;
        let address = config.address;
        let console = self.console.unwrap_or_else(|| Arc::new(Console::stdout()));
        let role = self
            .role
            .unwrap_or_else(|| default_role(config.role, console.clone()));
        let ring: Arc<dyn RingMembership> = match self.membership {
            Some(membership) => membership,
            None => Arc::new(config.static_ring()),
        };

        let queue = Arc::new(TransmitQueue::new());
        let token = Arc::new(TokenManager::new(address));
        let backlog = Arc::new(DataBacklog::new());

        let transport = Arc::new(DualPlaneTransport::start(
            address,
            control,
            data,
            token.clone(),
            role.data_sink(),
            TransportConfig {
                writer: config.writer_config(),
                relay_data: config.relays_data(),
            },
        ));

        let pump = TransmitPump {
            queue: queue.clone(),
            token: token.clone(),
            ring: ring.clone(),
            transport: transport.clone(),
            gate: config.transmit_gate,
            hold: config.token_hold(),
        };

        let mut tasks = vec![
            tokio::spawn(pump.run()),
            tokio::spawn(run_reception(
                transport.clone(),
                role.clone(),
                queue.clone(),
            )),
            tokio::spawn(
                StreamPackager::new(backlog.clone(), config.max_data_plane_payload_size)
                    .run(transport.clone()),
            ),
        ];
        if role.kind() == NodeRole::Master {
            tasks.push(tokio::spawn(run_watchdog(
                token.clone(),
                config.token_generation_delay(),
            )));
        }

        tracing::info!(
            "Node {} started as {:?} on a ring of {}",
            address,
            role.kind(),
            ring.size()
        );

        Ok(Stack {
            config,
            ring,
            queue,
            token,
            backlog,
            transport,
            role,
            console,
            tasks,
        })
    }
}

fn default_role(kind: NodeRole, console: Arc<Console>) -> Arc<dyn Role> {
    match kind {
        NodeRole::Master => Arc::new(MasterRole::new(console)),
        NodeRole::Peer => Arc::new(PeerRole::new(console)),
    }
}

/// A running node.
///
/// Share it behind an `Arc` to feed it from several places. Dropping it
/// stops every task of the node.
pub struct Stack {
    config: StackConfig,
    ring: Arc<dyn RingMembership>,
    queue: Arc<TransmitQueue>,
    token: Arc<TokenManager>,
    backlog: Arc<DataBacklog>,
    transport: Arc<DualPlaneTransport>,
    role: Arc<dyn Role>,
    console: Arc<Console>,
    tasks: Vec<JoinHandle<()>>,
}

impl Stack {
    /// Create a builder for the node at `address`.
    pub fn builder(address: NodeAddress) -> StackBuilder {
        StackBuilder::new(address)
    }

    /// This node's address.
    #[inline]
    pub fn address(&self) -> NodeAddress {
        self.config.address
    }

    /// The configuration the node runs with.
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// The node's role.
    pub fn role(&self) -> &Arc<dyn Role> {
        &self.role
    }

    /// The status console.
    pub fn console(&self) -> &Arc<Console> {
        &self.console
    }

    /// Ring membership.
    pub fn ring(&self) -> &Arc<dyn RingMembership> {
        &self.ring
    }

    /// Push raw stream bytes for the data plane.
    ///
    /// Never waits; callable from any thread, including non-async audio
    /// callbacks.
    pub fn on_bytes_received(&self, data: &[u8]) {
        self.backlog.on_bytes_received(data);
    }

    /// Queue a control packet, replicated to every ring member if
    /// `broadcast` is set.
    pub fn queue_packet(&self, packet: Packet, broadcast: bool) {
        self.enqueue(packet, DeliveryMode::from_broadcast_flag(broadcast));
    }

    /// Queue a control packet.
    pub fn enqueue(&self, packet: Packet, mode: DeliveryMode) {
        self.queue.enqueue(packet, mode);
    }

    /// Token state of this node.
    pub fn token_state(&self) -> TokenState {
        self.token.state()
    }

    /// Tokens this node regenerated after a loss.
    pub fn token_regenerations(&self) -> u64 {
        self.token.regeneration_count()
    }

    /// Stream bytes not yet packaged.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Control packets waiting for transmission.
    pub fn queued_packets(&self) -> usize {
        self.queue.len()
    }

    /// Data frames submitted but not yet written.
    pub fn pending_data_frames(&self) -> usize {
        self.transport.pending_data_frames()
    }

    /// Stop every task of the node.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Moves queued packets onto the control link and the token along the ring.
struct TransmitPump {
    queue: Arc<TransmitQueue>,
    token: Arc<TokenManager>,
    ring: Arc<dyn RingMembership>,
    transport: Arc<DualPlaneTransport>,
    gate: TransmitGate,
    hold: Duration,
}

impl TransmitPump {
    async fn run(self) {
        let address = self.transport.address();

        loop {
            let holding = self.token.is_holding();

            if (holding || self.gate == TransmitGate::Free) && self.drain().await.is_err() {
                break;
            }

            if holding {
                if let Some(next) = self.ring.next_after(address) {
                    tokio::time::sleep(self.hold).await;
                    if self.drain().await.is_err() {
                        break;
                    }

                    // Marked passed before the send: the token may come back
                    // while the send is still pending.
                    let frame = self.token.token_frame(next);
                    self.token.on_token_passed();
                    match self.transport.send_control_packet(frame).await {
                        Ok(()) => {}
                        Err(BlueteethError::ConnectionClosed) => break,
                        Err(e) => {
                            self.token.on_pass_failed();
                            tracing::warn!("Failed to pass the token to {}: {}", next, e);
                        }
                    }
                    continue;
                }
            }

            tokio::select! {
                () = self.queue.wait_ready() => {}
                () = self.token.wait_granted() => {}
            }
        }

        tracing::debug!("Transmit pump on node {} stopped", address);
    }

    /// Send everything queued. Fails only once the control link has closed.
    async fn drain(&self) -> Result<()> {
        while let Some(packets) = self.queue.next_transmissions(self.ring.as_ref()) {
            if packets.is_empty() {
                tracing::debug!("Broadcast dropped: no other ring members");
            }

            for packet in packets {
                match self.transport.send_control_packet(packet).await {
                    Ok(()) => {}
                    Err(BlueteethError::ConnectionClosed) => {
                        return Err(BlueteethError::ConnectionClosed)
                    }
                    Err(e) => tracing::warn!(
                        "Dropping {} to {}: {}",
                        packet.kind,
                        packet.destination,
                        e
                    ),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketType, PACKET_SIZE, SELF_PLACEHOLDER};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    struct Wires {
        control_in: DuplexStream,
        control_out: DuplexStream,
        _data_in: DuplexStream,
        data_out: DuplexStream,
    }

    fn links() -> (PlaneLink, PlaneLink, Wires) {
        let (control_in, control_upstream) = duplex(4096);
        let (control_downstream, control_out) = duplex(4096);
        let (data_in, data_upstream) = duplex(4096);
        let (data_downstream, data_out) = duplex(4096);
        (
            PlaneLink::new(control_upstream, control_downstream),
            PlaneLink::new(data_upstream, data_downstream),
            Wires {
                control_in,
                control_out,
                _data_in: data_in,
                data_out,
            },
        )
    }

    async fn read_packet(stream: &mut DuplexStream) -> Packet {
        let mut buf = [0u8; PACKET_SIZE];
        stream.read_exact(&mut buf).await.unwrap();
        Packet::decode(&buf).unwrap()
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Stack::builder(10)
            .role(NodeRole::Master)
            .ring([10, 1, 2])
            .max_data_plane_payload_size(350)
            .token_generation_delay(Duration::from_millis(200))
            .token_hold(Duration::from_millis(1))
            .transmit_gate(TransmitGate::Free)
            .max_pending_frames(8)
            .channel_capacity(16)
            .backpressure_timeout(Duration::from_secs(1))
            .relay_data(true);

        let config = &builder.config;
        assert_eq!(config.address, 10);
        assert_eq!(config.role, NodeRole::Master);
        assert_eq!(config.ring, vec![10, 1, 2]);
        assert_eq!(config.max_data_plane_payload_size, 350);
        assert_eq!(config.token_generation_delay_ms, 200);
        assert_eq!(config.token_hold_ms, 1);
        assert_eq!(config.transmit_gate, TransmitGate::Free);
        assert_eq!(config.max_pending_frames, 8);
        assert_eq!(config.channel_capacity, 16);
        assert_eq!(config.backpressure_timeout_ms, 1000);
        assert_eq!(config.relay_data, Some(true));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let (control, data, _wires) = links();
        let result = Stack::builder(SELF_PLACEHOLDER).start(control, data);
        assert!(matches!(result, Err(BlueteethError::Config(_))));
    }

    #[tokio::test]
    async fn test_free_gate_sends_without_token() {
        let (control, data, mut wires) = links();
        let stack = Stack::builder(2)
            .ring([1, 2])
            .transmit_gate(TransmitGate::Free)
            .console(Arc::new(Console::discard()))
            .start(control, data)
            .unwrap();

        stack.queue_packet(Packet::empty(PacketType::Test, 2, 1), false);

        let packet = read_packet(&mut wires.control_out).await;
        assert_eq!(packet.kind, PacketType::Test);
        assert_eq!(stack.token_state(), TokenState::NoToken);
    }

    #[tokio::test]
    async fn test_token_gate_holds_packets_until_token_arrives() {
        use tokio::io::AsyncWriteExt;

        let (control, data, mut wires) = links();
        let stack = Stack::builder(2)
            .ring([1, 2])
            .token_hold(Duration::from_millis(1))
            .console(Arc::new(Console::discard()))
            .start(control, data)
            .unwrap();

        stack.queue_packet(Packet::empty(PacketType::Test, 2, 1), false);

        // Nothing leaves the node without the token.
        let mut peek = [0u8; 1];
        let early =
            tokio::time::timeout(Duration::from_millis(50), wires.control_out.read(&mut peek))
                .await;
        assert!(early.is_err());
        assert_eq!(stack.queued_packets(), 1);

        wires
            .control_in
            .write_all(&Packet::empty(PacketType::Token, 1, 2).encode())
            .await
            .unwrap();

        let first = read_packet(&mut wires.control_out).await;
        assert_eq!(first.kind, PacketType::Test);

        // The token goes back upstream once the queue is empty.
        let second = read_packet(&mut wires.control_out).await;
        assert!(second.is_token());
        assert_eq!(second.destination, 1);
    }

    #[tokio::test]
    async fn test_master_generates_first_token() {
        let (control, data, mut wires) = links();
        let stack = Stack::builder(10)
            .role(NodeRole::Master)
            .ring([10, 1])
            .token_hold(Duration::from_millis(1))
            .console(Arc::new(Console::discard()))
            .start(control, data)
            .unwrap();

        let token = read_packet(&mut wires.control_out).await;
        assert!(token.is_token());
        assert_eq!(token.source, 10);
        assert_eq!(token.destination, 1);
        assert_eq!(stack.token_regenerations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_token_regenerated_once_per_period() {
        let (control, data, mut wires) = links();
        let start = tokio::time::Instant::now();
        let stack = Stack::builder(10)
            .role(NodeRole::Master)
            .ring([10, 1])
            .token_hold(Duration::from_millis(1))
            .token_generation_delay(Duration::from_millis(100))
            .console(Arc::new(Console::discard()))
            .start(control, data)
            .unwrap();

        let first = read_packet(&mut wires.control_out).await;
        assert!(first.is_token());
        assert_eq!(first.destination, 1);
        assert_eq!(stack.token_regenerations(), 1);

        // Node 1 never hands it back, so the next period makes exactly one
        // new token.
        let second = read_packet(&mut wires.control_out).await;
        let elapsed = start.elapsed();
        assert!(second.is_token());
        assert_eq!(second.destination, 1);
        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(200), "{:?}", elapsed);
        assert_eq!(stack.token_regenerations(), 2);

        let mut extra = [0u8; 1];
        let quiet =
            tokio::time::timeout(Duration::from_millis(50), wires.control_out.read(&mut extra))
                .await;
        assert!(quiet.is_err());
        assert_eq!(stack.token_regenerations(), 2);
    }

    #[tokio::test]
    async fn test_on_bytes_received_drains_backlog() {
        let (control, data, mut wires) = links();
        let stack = Stack::builder(10)
            .console(Arc::new(Console::discard()))
            .start(control, data)
            .unwrap();

        stack.on_bytes_received(&[1, 2, 3, 4, 5, 6, 7]);

        let mut frame = [0u8; 9];
        wires.data_out.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [0xFF, 0x00, 0x40, 0x40, 0x30, 0x20, 0x14, 0x0C, 0x07]);
        assert_eq!(stack.backlog_len(), 0);
    }
}
