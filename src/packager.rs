//! Stream packager and its data backlog.
//!
//! The audio producer pushes raw bytes into the [`DataBacklog`] from any
//! thread, without waiting. The [`StreamPackager`] task drains the backlog
//! in chunks of at most `max_payload` bytes, zero-pads each chunk to a whole
//! number of groups, encodes it and submits it to the data plane.
//!
//! ```text
//! producer ─► DataBacklog ─► take ≤ max_payload ─► pad ─► encode ─► data link
//!                 │                                                    ▲
//!                 └──── notify on empty → non-empty ─► packager ───────┘
//! ```
//!
//! The packager parks on a `Notify` when the backlog is empty. The producer
//! only notifies on the empty to non-empty transition; a notification sent
//! before the packager parks is stored, so a wake-up is never lost.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::codec::{encode, pad_to_group};
use crate::error::{BlueteethError, Result};
use crate::transport::DualPlaneTransport;

/// Default maximum raw bytes per data-plane frame.
pub const MAX_DATA_PLANE_PAYLOAD_SIZE: usize = 700;

/// Unbounded FIFO of raw stream bytes.
#[derive(Debug, Default)]
pub struct DataBacklog {
    bytes: Mutex<VecDeque<u8>>,
    ready: Notify,
}

impl DataBacklog {
    /// Create an empty backlog.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append bytes. Never waits on the link.
    pub fn on_bytes_received(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let was_empty = {
            let mut bytes = self.lock();
            let was_empty = bytes.is_empty();
            bytes.extend(data);
            was_empty
        };

        if was_empty {
            self.ready.notify_one();
        }
    }

    /// Remove up to `max` bytes from the front.
    pub fn take_chunk(&self, max: usize) -> Vec<u8> {
        let mut bytes = self.lock();
        let n = max.min(bytes.len());
        bytes.drain(..n).collect()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the backlog is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait for the empty to non-empty transition.
    pub async fn wait_ready(&self) {
        self.ready.notified().await;
    }
}

/// Turns backlog bytes into encoded data-plane frames.
pub struct StreamPackager {
    backlog: Arc<DataBacklog>,
    max_payload: usize,
}

impl StreamPackager {
    /// Create a packager for `backlog` with the given frame size limit.
    pub fn new(backlog: Arc<DataBacklog>, max_payload: usize) -> Self {
        Self {
            backlog,
            max_payload,
        }
    }

    /// Take the next chunk off the backlog and encode it.
    ///
    /// Returns `Ok(None)` when the backlog is empty.
    pub fn next_frame(&self) -> Result<Option<Bytes>> {
        let chunk = self.backlog.take_chunk(self.max_payload);
        if chunk.is_empty() {
            return Ok(None);
        }
        let frame = encode(&pad_to_group(&chunk))?;
        Ok(Some(Bytes::from(frame)))
    }

    /// Drain the backlog into `transport` forever.
    ///
    /// A stalled data link holds the packager on the current frame until it
    /// drains, so no stream bytes are skipped. Returns when the data link has
    /// closed.
    pub async fn run(self, transport: Arc<DualPlaneTransport>) {
        let mut frames: u64 = 0;

        loop {
            match self.next_frame() {
                Ok(Some(frame)) => match transport.send_data_frame(frame).await {
                    Ok(()) => frames += 1,
                    Err(BlueteethError::ConnectionClosed) => {
                        tracing::debug!("Data link closed after {} frames", frames);
                        return;
                    }
                    Err(e) => tracing::warn!("Failed to send data frame: {}", e),
                },
                Ok(None) => {
                    tracing::trace!("Backlog drained after {} frames", frames);
                    self.backlog.wait_ready().await;
                }
                Err(e) => tracing::error!("Failed to package stream chunk: {}", e),
            }
        }
    }
}
