//! Ring token manager.
//!
//! The token is a permission, not data: a node that holds it may originate
//! control traffic, then hands it to its downstream neighbour with a TOKEN
//! frame. Token frames are only ever built here ([`TokenManager::token_frame`]).
//!
//! ```text
//!              on_token_received / regenerate
//!   NoToken ──────────────────────────────────► Holding
//!   Passed  ──────────────────────────────────►   │
//!      ▲                                          │
//!      └────────────── on_token_passed ───────────┘
//! ```
//!
//! Loss is detected by [`run_watchdog`]: every period it consumes the
//! "seen since last check" flag and regenerates the token if nothing arrived.
//! A delayed (rather than lost) token can therefore be duplicated; that is
//! accepted and left to higher layers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};

use crate::protocol::{NodeAddress, Packet, PacketType};

/// Default watchdog period in milliseconds.
pub const RING_TOKEN_GENERATION_DELAY_MS: u64 = 1000;

/// Token possession state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Never held since start.
    NoToken,
    /// Held by this node.
    Holding,
    /// Handed to the downstream neighbour.
    Passed,
}

/// Result of a watchdog check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// A token arrived during the last period.
    Seen,
    /// Nothing arrived: the token is considered lost and must be regenerated.
    Regenerate,
}

#[derive(Debug)]
struct TokenInner {
    state: TokenState,
    seen: bool,
    last_seen: Option<Instant>,
    regenerations: u64,
}

/// Tracks token possession for one node.
#[derive(Debug)]
pub struct TokenManager {
    address: NodeAddress,
    inner: Mutex<TokenInner>,
    granted: Notify,
}

impl TokenManager {
    /// Create a manager for the node at `address`, starting in `NoToken`.
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            inner: Mutex::new(TokenInner {
                state: TokenState::NoToken,
                seen: false,
                last_seen: None,
                regenerations: 0,
            }),
            granted: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TokenInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address of the owning node.
    #[inline]
    pub fn address(&self) -> NodeAddress {
        self.address
    }

    /// Current state.
    pub fn state(&self) -> TokenState {
        self.lock().state
    }

    /// Check if this node holds the token.
    pub fn is_holding(&self) -> bool {
        self.lock().state == TokenState::Holding
    }

    /// When a token frame last arrived from the wire.
    pub fn last_seen(&self) -> Option<Instant> {
        self.lock().last_seen
    }

    /// Number of tokens this node has regenerated.
    pub fn regeneration_count(&self) -> u64 {
        self.lock().regenerations
    }

    /// A token frame addressed to this node arrived.
    pub fn on_token_received(&self) {
        {
            let mut inner = self.lock();
            inner.state = TokenState::Holding;
            inner.seen = true;
            inner.last_seen = Some(Instant::now());
        }
        tracing::trace!("Node {} received the token", self.address);
        self.granted.notify_one();
    }

    /// Consume the seen flag.
    ///
    /// Reports [`WatchdogOutcome::Regenerate`] if no token arrived since the
    /// previous check. The flag is cleared in every case.
    pub fn watchdog_check(&self) -> WatchdogOutcome {
        let mut inner = self.lock();
        let outcome = if inner.seen {
            WatchdogOutcome::Seen
        } else {
            WatchdogOutcome::Regenerate
        };
        inner.seen = false;
        outcome
    }

    /// Create a fresh token locally after a loss.
    ///
    /// The node holds the new token; the transmit pump forwards it to the
    /// downstream neighbour like any other token it holds. Regeneration does
    /// not count as the token being seen.
    pub fn regenerate(&self) {
        {
            let mut inner = self.lock();
            inner.state = TokenState::Holding;
            inner.regenerations += 1;
        }
        self.granted.notify_one();
    }

    /// The held token was handed downstream.
    pub fn on_token_passed(&self) {
        let mut inner = self.lock();
        if inner.state == TokenState::Holding {
            inner.state = TokenState::Passed;
        } else {
            tracing::warn!(
                "Node {} passed a token it does not hold ({:?})",
                self.address,
                inner.state
            );
        }
    }

    /// Handing the token downstream failed, so the token never left.
    ///
    /// A token that arrived again in the meantime is kept as well.
    pub fn on_pass_failed(&self) {
        let mut inner = self.lock();
        if inner.state == TokenState::Passed {
            inner.state = TokenState::Holding;
        }
    }

    /// Build the TOKEN frame that hands the token to `next_hop`.
    pub fn token_frame(&self, next_hop: NodeAddress) -> Packet {
        Packet::empty(PacketType::Token, self.address, next_hop)
    }

    /// Wait until the token is granted (received or regenerated) after the
    /// previous wait.
    pub async fn wait_granted(&self) {
        self.granted.notified().await;
    }
}

/// Periodically check for token loss and regenerate.
///
/// Runs until the task is aborted. The node generates the first token
/// immediately, since no token exists when the ring starts.
pub async fn run_watchdog(token: Arc<TokenManager>, period: Duration) {
    tracing::debug!(
        "Token watchdog started on node {} ({:?} period)",
        token.address(),
        period
    );
    token.regenerate();

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if token.watchdog_check() == WatchdogOutcome::Regenerate {
            tracing::info!("Generating a new token on node {}", token.address());
            token.regenerate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_without_token() {
        let token = TokenManager::new(3);
        assert_eq!(token.state(), TokenState::NoToken);
        assert!(!token.is_holding());
        assert!(token.last_seen().is_none());
    }

    #[test]
    fn test_receive_then_pass() {
        let token = TokenManager::new(3);

        token.on_token_received();
        assert_eq!(token.state(), TokenState::Holding);
        assert!(token.last_seen().is_some());

        token.on_token_passed();
        assert_eq!(token.state(), TokenState::Passed);

        token.on_token_received();
        assert_eq!(token.state(), TokenState::Holding);
    }

    #[test]
    fn test_pass_without_holding_keeps_state() {
        let token = TokenManager::new(3);
        token.on_token_passed();
        assert_eq!(token.state(), TokenState::NoToken);
    }

    #[test]
    fn test_token_returning_during_pass_is_kept() {
        let token = TokenManager::new(10);
        token.regenerate();

        token.on_token_passed();
        token.on_token_received();

        assert!(token.is_holding());
    }

    #[test]
    fn test_failed_pass_keeps_token() {
        let token = TokenManager::new(10);
        token.regenerate();

        token.on_token_passed();
        assert_eq!(token.state(), TokenState::Passed);
        token.on_pass_failed();
        assert!(token.is_holding());

        let idle = TokenManager::new(2);
        idle.on_pass_failed();
        assert_eq!(idle.state(), TokenState::NoToken);
    }

    #[test]
    fn test_silent_period_regenerates_once() {
        let token = TokenManager::new(10);

        token.on_token_received();
        assert_eq!(token.watchdog_check(), WatchdogOutcome::Seen);

        // One silent period: exactly one regeneration request.
        assert_eq!(token.watchdog_check(), WatchdogOutcome::Regenerate);

        // The flag was cleared; a new arrival is needed to report Seen again.
        token.on_token_received();
        assert_eq!(token.watchdog_check(), WatchdogOutcome::Seen);
        assert_eq!(token.watchdog_check(), WatchdogOutcome::Regenerate);
    }

    #[test]
    fn test_regenerate_does_not_mark_seen() {
        let token = TokenManager::new(10);
        token.regenerate();

        assert!(token.is_holding());
        assert_eq!(token.regeneration_count(), 1);
        assert_eq!(token.watchdog_check(), WatchdogOutcome::Regenerate);
    }

    #[test]
    fn test_token_frame() {
        let token = TokenManager::new(10);
        let frame = token.token_frame(1);

        assert!(frame.is_token());
        assert_eq!(frame.source, 10);
        assert_eq!(frame.destination, 1);
        assert!(frame.has_empty_payload());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_regenerates_per_silent_period() {
        let token = Arc::new(TokenManager::new(10));
        let period = Duration::from_millis(RING_TOKEN_GENERATION_DELAY_MS);
        let task = tokio::spawn(run_watchdog(token.clone(), period));

        // Initial token at start.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(token.regeneration_count(), 1);

        // Token arrives during the first period: no regeneration.
        token.on_token_received();
        tokio::time::sleep(period).await;
        assert_eq!(token.regeneration_count(), 1);

        // Silent second period: exactly one regeneration.
        tokio::time::sleep(period).await;
        assert_eq!(token.regeneration_count(), 2);

        task.abort();
    }

    #[tokio::test]
    async fn test_grant_wakes_waiter() {
        let token = Arc::new(TokenManager::new(2));
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.wait_granted().await })
        };

        token.on_token_received();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
    }
}
