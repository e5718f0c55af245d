//! Dedicated writer task per link.
//!
//! Every producer that writes to a link (the transmit pump, the forwarding
//! path of the control reader, the token watchdog, the stream packager) goes
//! through a cloneable [`WriterHandle`]. The handle submits whole frames over
//! an mpsc channel to a single task that owns the write half, so frames from
//! different producers never interleave on the wire.
//!
//! # Architecture
//!
//! ```text
//! Transmit pump ─┐
//! Forwarding    ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Link
//! Watchdog      ─┘
//! ```
//!
//! Frames that are ready together are batched into one vectored write.

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backpressure::{BackpressureController, DEFAULT_MAX_PENDING, DEFAULT_TIMEOUT};
use crate::error::{BlueteethError, Result};
use crate::protocol::Packet;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 32;

/// A frame ready to be written to a link.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    bytes: Bytes,
}

impl OutboundFrame {
    /// A serialized control record.
    #[inline]
    pub fn control(packet: &Packet) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(&packet.encode()),
        }
    }

    /// Pre-encoded data-plane frame bytes.
    #[inline]
    pub fn data(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// Frame contents.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for a link writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Frames in flight before senders wait.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Handle for sending frames to a writer task.
///
/// Cheaply cloneable; every clone feeds the same link.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    backpressure: BackpressureController,
}

impl WriterHandle {
    /// Send a frame, waiting while the link is at capacity.
    ///
    /// # Errors
    ///
    /// - `BackpressureTimeout` if the link did not drain in time
    /// - `ConnectionClosed` if the writer task has stopped
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let slot = self.backpressure.reserve().await?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| BlueteethError::ConnectionClosed)?;
        slot.disarm();
        Ok(())
    }

    /// Frames submitted but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }
}

/// Spawn the writer task for one link.
///
/// Returns the handle used to submit frames and the task's `JoinHandle`. The
/// task ends cleanly once every handle is dropped, or with an error if the
/// link fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let backpressure =
        BackpressureController::with_timeout(config.max_pending_frames, config.backpressure_timeout);

    let handle = WriterHandle {
        tx,
        backpressure: backpressure.clone(),
    };
    let task = tokio::spawn(writer_loop(rx, writer, backpressure));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    backpressure: BackpressureController,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let result = write_batch(&mut writer, &batch).await;
        backpressure.release_many(batch.len());
        batch.clear();

        if let Err(e) = result {
            tracing::error!("Link write failed: {}", e);
            return Err(e);
        }
    }

    Ok(())
}

/// Write a batch of frames with as few vectored writes as possible.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(BlueteethError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering everything after the first `skip_bytes` of the batch.
fn remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.size();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.as_bytes()[start..]));
        }
        offset = end;
    }

    slices
}
