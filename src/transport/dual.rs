//! Dual-plane transport.
//!
//! Each node sits on two rings at once: a control ring carrying fixed-size
//! packet records and a data ring carrying septet-encoded frames. For both
//! planes the node reads from its upstream neighbour and writes to its
//! downstream neighbour.
//!
//! ```text
//!              control records               control records
//!  upstream ─────────────────► [ node ] ─────────────────► downstream
//!  upstream ─────────────────► [      ] ─────────────────► downstream
//!              encoded frames                encoded frames
//! ```
//!
//! The control reader decides what happens to every record:
//!
//! | Destination         | Action                                       |
//! |---------------------|----------------------------------------------|
//! | this node, TOKEN    | hand to the token manager                    |
//! | this node           | deliver to [`DualPlaneTransport::receive_control_packet`] |
//! | `RING_BROADCAST`    | deliver and forward, unless it came back     |
//! | another node        | forward, unless it came back to its source   |
//! | `SELF_PLACEHOLDER`  | drop                                         |
//! | outside the ring    | drop (source or destination not a member)    |
//!
//! Malformed records are dropped and logged by the reader; they never
//! surface as errors. A record that cannot be forwarded is dropped too, so
//! only a closed link ends the reader.
//!
//! Data frames are never dropped: a sender keeps retrying the same frame
//! while the downstream link is stalled.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::codec::FrameDecoder;
use crate::error::{BlueteethError, Result};
use crate::protocol::{
    is_member_address, NodeAddress, Packet, PacketBuffer, RING_BROADCAST, SELF_PLACEHOLDER,
};
use crate::token::TokenManager;
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Read buffer size for both planes.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the channel of locally delivered control packets.
const INBOUND_CAPACITY: usize = 64;

/// Boxed read half of a link.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Boxed write half of a link.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// One of the two planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    /// Packet records.
    Control,
    /// Encoded stream frames.
    Data,
}

impl Plane {
    /// Lowercase name used in socket paths and logs.
    pub fn name(self) -> &'static str {
        match self {
            Plane::Control => "control",
            Plane::Data => "data",
        }
    }
}

/// The links of one plane: read from upstream, write to downstream.
pub struct PlaneLink {
    upstream: BoxedReader,
    downstream: BoxedWriter,
}

impl PlaneLink {
    /// Create a plane link from any read and write halves.
    pub fn new<R, W>(upstream: R, downstream: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            upstream: Box::new(upstream),
            downstream: Box::new(downstream),
        }
    }
}

/// Consumer of decoded data-plane bytes.
pub trait DataSink: Send + Sync + 'static {
    /// Called with every run of bytes decoded from the data plane.
    fn on_data(&self, data: &[u8]);
}

/// A sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl DataSink for DiscardSink {
    fn on_data(&self, _data: &[u8]) {}
}

/// Options of the transport.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Writer settings for both planes.
    pub writer: WriterConfig,
    /// Pass received data-plane bytes on to the downstream neighbour.
    pub relay_data: bool,
}

/// What the control reader does with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Token for this node.
    Token,
    /// Addressed to this node.
    Deliver,
    /// Ring-wide: deliver here and pass on.
    DeliverAndForward,
    /// Addressed to someone else.
    Forward,
    /// Unresolved or foreign address, or a packet that went all the way
    /// round.
    Drop,
}

/// Decide where a record received by node `address` goes.
pub fn route(packet: &Packet, address: NodeAddress) -> Route {
    match packet.destination {
        SELF_PLACEHOLDER => Route::Drop,
        // No node would ever consume these, so they would circulate forever.
        _ if !is_member_address(packet.source) => Route::Drop,
        dst if dst != RING_BROADCAST && !is_member_address(dst) => Route::Drop,
        dst if dst == address && packet.is_token() => Route::Token,
        dst if dst == address => Route::Deliver,
        _ if packet.source == address => Route::Drop,
        RING_BROADCAST => Route::DeliverAndForward,
        _ => Route::Forward,
    }
}

/// Control and data links of one node.
pub struct DualPlaneTransport {
    address: NodeAddress,
    control: WriterHandle,
    data: WriterHandle,
    loopback: mpsc::WeakSender<Packet>,
    inbound: Mutex<mpsc::Receiver<Packet>>,
    tasks: Vec<JoinHandle<()>>,
    writers: Vec<JoinHandle<Result<()>>>,
}

impl DualPlaneTransport {
    /// Start the reader and writer tasks of both planes.
    pub fn start(
        address: NodeAddress,
        control: PlaneLink,
        data: PlaneLink,
        token: Arc<TokenManager>,
        sink: Arc<dyn DataSink>,
        config: TransportConfig,
    ) -> Self {
        let (control_writer, control_task) =
            spawn_writer_task(control.downstream, config.writer.clone());
        let (data_writer, data_task) = spawn_writer_task(data.downstream, config.writer);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let relay = config.relay_data.then(|| data_writer.clone());
        let loopback = inbound_tx.downgrade();

        let tasks = vec![
            spawn_reader(
                Plane::Control,
                address,
                control_read_loop(
                    control.upstream,
                    address,
                    token,
                    control_writer.clone(),
                    inbound_tx,
                ),
            ),
            spawn_reader(
                Plane::Data,
                address,
                data_read_loop(data.upstream, sink, relay),
            ),
        ];

        Self {
            address,
            control: control_writer,
            data: data_writer,
            loopback,
            inbound: Mutex::new(inbound_rx),
            tasks,
            writers: vec![control_task, data_task],
        }
    }

    /// Address of this node.
    #[inline]
    pub fn address(&self) -> NodeAddress {
        self.address
    }

    /// Send one packet as one record on the control plane.
    ///
    /// Packets still addressed to `SELF_PLACEHOLDER` are dropped and logged.
    /// Packets addressed to this node are delivered locally without touching
    /// the link.
    pub async fn send_control_packet(&self, packet: Packet) -> Result<()> {
        if packet.is_unresolved() {
            tracing::warn!(
                "Dropping {} from {} with unresolved destination",
                packet.kind,
                packet.source
            );
            return Ok(());
        }

        if packet.destination == self.address {
            let loopback = self
                .loopback
                .upgrade()
                .ok_or(BlueteethError::ConnectionClosed)?;
            return loopback
                .send(packet)
                .await
                .map_err(|_| BlueteethError::ConnectionClosed);
        }

        tracing::debug!(
            "Sending {} {} -> {}",
            packet.kind,
            packet.source,
            packet.destination
        );
        self.control.send(OutboundFrame::control(&packet)).await
    }

    /// Send pre-encoded frame bytes on the data plane.
    ///
    /// Waits while the data link is at capacity, however long the stall
    /// lasts. Fails only once the link has closed.
    pub async fn send_data_frame(&self, frame: Bytes) -> Result<()> {
        send_until_accepted(&self.data, frame).await
    }

    /// Wait for the next control packet delivered to this node.
    ///
    /// Returns `None` once the control link has closed and every delivered
    /// packet was taken.
    pub async fn receive_control_packet(&self) -> Option<Packet> {
        self.inbound.lock().await.recv().await
    }

    /// Data frames submitted but not yet written.
    pub fn pending_data_frames(&self) -> usize {
        self.data.pending_count()
    }
}

impl Drop for DualPlaneTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        for writer in &self.writers {
            writer.abort();
        }
    }
}

/// Submit a data frame, retrying the same frame across backpressure
/// timeouts.
async fn send_until_accepted(link: &WriterHandle, frame: Bytes) -> Result<()> {
    let mut stalled = false;

    loop {
        match link.send(OutboundFrame::data(frame.clone())).await {
            Err(BlueteethError::BackpressureTimeout) => {
                if !stalled {
                    tracing::warn!("Data link stalled, holding {} byte frame", frame.len());
                    stalled = true;
                }
            }
            Ok(()) => {
                if stalled {
                    tracing::info!("Data link drained, stream resumed");
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Pass a record on downstream. A record that cannot be sent is dropped;
/// only a closed link is an error.
async fn forward(downstream: &WriterHandle, packet: &Packet) -> Result<()> {
    match downstream.send(OutboundFrame::control(packet)).await {
        Ok(()) => Ok(()),
        Err(BlueteethError::ConnectionClosed) => Err(BlueteethError::ConnectionClosed),
        Err(e) => {
            tracing::warn!(
                "Dropping {} {} -> {}, downstream not accepting: {}",
                packet.kind,
                packet.source,
                packet.destination,
                e
            );
            Ok(())
        }
    }
}

fn spawn_reader<F>(plane: Plane, address: NodeAddress, task: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match task.await {
            Ok(()) => tracing::debug!("Node {} {} link closed", address, plane.name()),
            Err(e) => tracing::error!("Node {} {} read error: {}", address, plane.name(), e),
        }
    })
}

async fn control_read_loop(
    mut reader: BoxedReader,
    address: NodeAddress,
    token: Arc<TokenManager>,
    downstream: WriterHandle,
    inbound: mpsc::Sender<Packet>,
) -> Result<()> {
    let mut records = PacketBuffer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(BlueteethError::Io(e)),
        };

        for packet in records.push(&buf[..n]) {
            match route(&packet, address) {
                Route::Token => token.on_token_received(),
                Route::Deliver => {
                    if inbound.send(packet).await.is_err() {
                        return Ok(());
                    }
                }
                Route::DeliverAndForward => {
                    forward(&downstream, &packet).await?;
                    if inbound.send(packet).await.is_err() {
                        return Ok(());
                    }
                }
                Route::Forward => {
                    tracing::trace!(
                        "Forwarding {} {} -> {}",
                        packet.kind,
                        packet.source,
                        packet.destination
                    );
                    forward(&downstream, &packet).await?;
                }
                Route::Drop => {
                    tracing::debug!(
                        "Dropping {} {} -> {} at node {}",
                        packet.kind,
                        packet.source,
                        packet.destination,
                        address
                    );
                }
            }
        }
    }
}

async fn data_read_loop(
    mut reader: BoxedReader,
    sink: Arc<dyn DataSink>,
    mut relay: Option<WriterHandle>,
) -> Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return Err(BlueteethError::Io(e)),
        };

        if let Some(link) = &relay {
            if let Err(e) = send_until_accepted(link, Bytes::copy_from_slice(&buf[..n])).await {
                tracing::warn!("Data relay stopped: {}", e);
                relay = None;
            }
        }

        let decoded = decoder.push(&buf[..n]);
        if !decoded.is_empty() {
            sink.on_data(&decoded);
        }
    }

    if decoder.resync_count() > 0 {
        tracing::warn!(
            "Data plane closed after {} resynchronisations ({} bytes skipped)",
            decoder.resync_count(),
            decoder.skipped_bytes()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, pad_to_group};
    use crate::protocol::{PacketType, PACKET_SIZE};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    #[derive(Default)]
    struct CollectSink(StdMutex<Vec<u8>>);

    impl DataSink for CollectSink {
        fn on_data(&self, data: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(data);
        }
    }

    struct Harness {
        transport: DualPlaneTransport,
        token: Arc<TokenManager>,
        sink: Arc<CollectSink>,
        control_in: DuplexStream,
        control_out: DuplexStream,
        data_in: DuplexStream,
        data_out: DuplexStream,
    }

    fn harness(address: NodeAddress, relay_data: bool) -> Harness {
        let config = TransportConfig {
            relay_data,
            ..TransportConfig::default()
        };
        harness_with(address, config, 4096, 64 * 1024)
    }

    /// Harness with custom writer settings and downstream pipe sizes.
    fn harness_with(
        address: NodeAddress,
        config: TransportConfig,
        control_downstream_buffer: usize,
        data_downstream_buffer: usize,
    ) -> Harness {
        let (control_in, control_upstream) = duplex(4096);
        let (control_downstream, control_out) = duplex(control_downstream_buffer);
        let (data_in, data_upstream) = duplex(64 * 1024);
        let (data_downstream, data_out) = duplex(data_downstream_buffer);

        let token = Arc::new(TokenManager::new(address));
        let sink = Arc::new(CollectSink::default());
        let transport = DualPlaneTransport::start(
            address,
            PlaneLink::new(control_upstream, control_downstream),
            PlaneLink::new(data_upstream, data_downstream),
            token.clone(),
            sink.clone(),
            config,
        );

        Harness {
            transport,
            token,
            sink,
            control_in,
            control_out,
            data_in,
            data_out,
        }
    }

    /// One frame in flight and a short timeout, so a stalled link times
    /// senders out quickly.
    fn stalling_config() -> TransportConfig {
        TransportConfig {
            writer: WriterConfig {
                max_pending_frames: 1,
                channel_capacity: 4,
                backpressure_timeout: Duration::from_millis(20),
            },
            relay_data: false,
        }
    }

    async fn read_packet(stream: &mut DuplexStream) -> Packet {
        let mut buf = [0u8; PACKET_SIZE];
        stream.read_exact(&mut buf).await.unwrap();
        Packet::decode(&buf).unwrap()
    }

    #[test]
    fn test_route_table() {
        let at = |kind, src, dst| route(&Packet::empty(kind, src, dst), 2);

        assert_eq!(at(PacketType::Token, 1, 2), Route::Token);
        assert_eq!(at(PacketType::Ping, 1, 2), Route::Deliver);
        assert_eq!(at(PacketType::Ping, 1, 3), Route::Forward);
        assert_eq!(at(PacketType::Ping, 2, 3), Route::Drop);
        assert_eq!(at(PacketType::Initialization, 1, RING_BROADCAST), Route::DeliverAndForward);
        assert_eq!(at(PacketType::Initialization, 2, RING_BROADCAST), Route::Drop);
        assert_eq!(at(PacketType::Ping, 1, SELF_PLACEHOLDER), Route::Drop);
    }

    #[test]
    fn test_records_outside_the_ring_are_dropped_everywhere() {
        for node in [10, 1, 2] {
            let at = |src, dst| route(&Packet::empty(PacketType::Ping, src, dst), node);

            assert_eq!(at(0, 0), Route::Drop);
            assert_eq!(at(1, 0), Route::Drop);
            assert_eq!(at(0, 3), Route::Drop);
            assert_eq!(at(0, RING_BROADCAST), Route::Drop);
            assert_eq!(at(RING_BROADCAST, 3), Route::Drop);
            assert_eq!(at(SELF_PLACEHOLDER, 3), Route::Drop);
        }
    }

    #[tokio::test]
    async fn test_send_control_packet_writes_one_record() {
        let mut h = harness(3, false);

        let ping = Packet::empty(PacketType::Ping, 3, 1);
        h.transport.send_control_packet(ping).await.unwrap();

        assert_eq!(read_packet(&mut h.control_out).await, ping);
    }

    #[tokio::test]
    async fn test_local_packet_is_delivered() {
        let mut h = harness(2, false);

        let record = Packet::new(PacketType::Ping, 1, 2, b"1").unwrap().encode();
        // Split the record across two writes.
        h.control_in.write_all(&record[..7]).await.unwrap();
        h.control_in.write_all(&record[7..]).await.unwrap();

        let packet = h.transport.receive_control_packet().await.unwrap();
        assert_eq!(packet.kind, PacketType::Ping);
        assert_eq!(packet.payload_trimmed(), b"1");
    }

    #[tokio::test]
    async fn test_foreign_packet_is_forwarded() {
        let mut h = harness(2, false);

        let packet = Packet::new(PacketType::Test, 1, 3, b"relay").unwrap();
        h.control_in.write_all(&packet.encode()).await.unwrap();

        assert_eq!(read_packet(&mut h.control_out).await, packet);
    }

    #[tokio::test]
    async fn test_stalled_downstream_does_not_stop_reception() {
        // The downstream pipe holds one record and nobody reads it yet.
        let mut h = harness_with(2, stalling_config(), PACKET_SIZE, 64 * 1024);

        let forwarded: Vec<Packet> = (0..3u8)
            .map(|i| Packet::new(PacketType::Test, 1, 3, &[i + 1]).unwrap())
            .collect();
        for packet in &forwarded {
            h.control_in.write_all(&packet.encode()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The first two got through; the third timed out and was dropped.
        assert_eq!(read_packet(&mut h.control_out).await, forwarded[0]);
        assert_eq!(read_packet(&mut h.control_out).await, forwarded[1]);

        let ping = Packet::empty(PacketType::Ping, 1, 2);
        h.control_in.write_all(&ping.encode()).await.unwrap();
        let delivered =
            tokio::time::timeout(Duration::from_secs(1), h.transport.receive_control_packet())
                .await
                .unwrap();
        assert_eq!(delivered, Some(ping));

        let mut extra = [0u8; PACKET_SIZE];
        let nothing =
            tokio::time::timeout(Duration::from_millis(50), h.control_out.read_exact(&mut extra))
                .await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_token_goes_to_manager() {
        let mut h = harness(2, false);

        h.control_in
            .write_all(&Packet::empty(PacketType::Token, 1, 2).encode())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), h.token.wait_granted())
            .await
            .unwrap();
        assert!(h.token.is_holding());
    }

    #[tokio::test]
    async fn test_unresolved_destination_not_sent() {
        let mut h = harness(3, false);

        let unresolved = Packet::empty(PacketType::Stream, 3, SELF_PLACEHOLDER);
        h.transport.send_control_packet(unresolved).await.unwrap();

        let ping = Packet::empty(PacketType::Ping, 3, 1);
        h.transport.send_control_packet(ping).await.unwrap();

        // Only the resolved packet reached the link.
        assert_eq!(read_packet(&mut h.control_out).await, ping);
    }

    #[tokio::test]
    async fn test_packet_to_self_loops_back() {
        let h = harness(4, false);

        let packet = Packet::empty(PacketType::Test, 4, 4);
        h.transport.send_control_packet(packet).await.unwrap();

        assert_eq!(h.transport.receive_control_packet().await, Some(packet));
    }

    #[tokio::test]
    async fn test_data_frames_reach_sink_and_relay() {
        let mut h = harness(2, true);

        let raw: Vec<u8> = (1..=20).collect();
        let frame = encode(&pad_to_group(&raw)).unwrap();
        h.data_in.write_all(&frame).await.unwrap();

        let mut relayed = vec![0u8; frame.len()];
        h.data_out.read_exact(&mut relayed).await.unwrap();
        assert_eq!(relayed, frame);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let received = h.sink.0.lock().unwrap().clone();
        assert_eq!(&received[..20], &raw[..]);
    }

    #[tokio::test]
    async fn test_send_data_frame() {
        let mut h = harness(10, false);

        let frame = Bytes::from(encode(&[1, 2, 3, 4, 5, 6, 7]).unwrap());
        h.transport.send_data_frame(frame.clone()).await.unwrap();

        let mut buf = vec![0u8; frame.len()];
        h.data_out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &frame[..]);
    }

    #[tokio::test]
    async fn test_data_frames_survive_stall_longer_than_timeout() {
        // A 64-byte downstream pipe stalls the first 800-byte frame.
        let Harness {
            transport,
            mut data_out,
            ..
        } = harness_with(10, stalling_config(), 4096, 64);

        let frames: Vec<Bytes> = (1..=5u8)
            .map(|i| Bytes::from(encode(&pad_to_group(&[i; 700])).unwrap()))
            .collect();
        let expected = frames.concat();

        let send = async {
            for frame in &frames {
                transport.send_data_frame(frame.clone()).await.unwrap();
            }
        };
        let receive = async {
            // Ten backpressure timeouts pass before anyone reads.
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut received = vec![0u8; expected.len()];
            data_out.read_exact(&mut received).await.unwrap();
            received
        };

        let ((), received) = tokio::join!(send, receive);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_receive_ends_when_link_closes() {
        let Harness {
            transport,
            control_in,
            ..
        } = harness(2, false);

        drop(control_in);
        let result =
            tokio::time::timeout(Duration::from_secs(1), transport.receive_control_packet())
                .await
                .unwrap();
        assert!(result.is_none());
    }
}
