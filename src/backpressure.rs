//! Backpressure for link writes.
//!
//! Each link's writer task drains a channel of outbound frames. The
//! [`BackpressureController`] counts frames that were submitted but not yet
//! written; a sender that finds the link at capacity waits, polling every
//! `CHECK_INTERVAL`, until the writer catches up or the timeout expires.
//!
//! The data plane relies on this to slow the stream packager down to the
//! link's pace instead of dropping audio. Control records are small and rare,
//! so the control link almost never waits.
//!
//! # Configuration
//!
//! - `max_pending`: frames in flight before senders wait (default: 64)
//! - `timeout`: how long a sender waits before giving up (default: 5s)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{BlueteethError, Result};

/// Default maximum frames in flight per link.
pub const DEFAULT_MAX_PENDING: usize = 64;

/// Default time a sender waits for the link to drain.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between capacity checks while waiting.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Tracks frames in flight on one link.
///
/// Clones share the same counter, so the writer task and every sender see
/// one count.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl BackpressureController {
    /// Create a controller that lets senders wait up to `timeout`.
    pub fn with_timeout(max_pending: usize, timeout: Duration) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending,
            timeout,
        }
    }

    /// Check if a frame can be submitted without waiting.
    #[inline]
    pub fn can_accept(&self) -> bool {
        self.pending.load(Ordering::Acquire) < self.max_pending
    }

    /// Frames submitted but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Reserve a slot, waiting while the link is at capacity.
    ///
    /// Returns `Err(BackpressureTimeout)` if the link did not drain in time.
    pub async fn reserve(&self) -> Result<BackpressureGuard> {
        let start = Instant::now();

        loop {
            if self.can_accept() {
                self.pending.fetch_add(1, Ordering::AcqRel);
                return Ok(BackpressureGuard::new(self.clone()));
            }

            if start.elapsed() > self.timeout {
                return Err(BlueteethError::BackpressureTimeout);
            }

            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// Release slots after the writer flushed `count` frames.
    #[inline]
    pub fn release_many(&self, count: usize) {
        self.pending.fetch_sub(count, Ordering::Release);
    }
}

/// A reserved slot. Released on drop unless handed to the writer task.
pub struct BackpressureGuard {
    controller: BackpressureController,
    armed: bool,
}

impl BackpressureGuard {
    fn new(controller: BackpressureController) -> Self {
        Self {
            controller,
            armed: true,
        }
    }

    /// The frame reached the writer task, which releases the slot after the
    /// write.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BackpressureGuard {
    fn drop(&mut self) {
        if self.armed {
            self.controller.release_many(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_pending: usize) -> BackpressureController {
        BackpressureController::with_timeout(max_pending, Duration::from_millis(10))
    }

    #[test]
    fn test_controller_creation() {
        let ctrl = controller(100);
        assert_eq!(ctrl.pending_count(), 0);
        assert!(ctrl.can_accept());
    }

    #[tokio::test]
    async fn test_reserve_at_capacity_times_out() {
        let ctrl = controller(2);

        ctrl.reserve().await.unwrap().disarm();
        ctrl.reserve().await.unwrap().disarm();
        assert!(!ctrl.can_accept());

        let result = ctrl.reserve().await;
        assert!(matches!(result, Err(BlueteethError::BackpressureTimeout)));
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let ctrl = controller(10);

        {
            let _guard = ctrl.reserve().await.unwrap();
            assert_eq!(ctrl.pending_count(), 1);
        }

        assert_eq!(ctrl.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disarmed_guard_waits_for_writer() {
        let ctrl = controller(10);

        ctrl.reserve().await.unwrap().disarm();
        ctrl.reserve().await.unwrap().disarm();
        assert_eq!(ctrl.pending_count(), 2);

        ctrl.release_many(2);
        assert_eq!(ctrl.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let ctrl1 = controller(10);
        let ctrl2 = ctrl1.clone();

        ctrl1.reserve().await.unwrap().disarm();
        assert_eq!(ctrl2.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_reserve_timeout() {
        let ctrl = controller(1);
        ctrl.reserve().await.unwrap().disarm();

        let start = Instant::now();
        let result = ctrl.reserve().await;

        assert!(matches!(result, Err(BlueteethError::BackpressureTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_reserve_waits_for_release() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_secs(1));
        ctrl.reserve().await.unwrap().disarm();

        let writer = ctrl.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.release_many(1);
        });

        let guard = ctrl.reserve().await.unwrap();
        assert_eq!(ctrl.pending_count(), 1);
        drop(guard);
        assert_eq!(ctrl.pending_count(), 0);
    }
}
