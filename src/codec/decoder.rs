//! Streaming, resynchronising decoder for the data plane.
//!
//! Bytes read off the data link arrive in arbitrary chunks and may be
//! corrupted or truncated. The decoder is a small state machine:
//! - `Hunting`: discard bytes until a sentinel is seen
//! - `Collecting`: sentinel seen, gathering the 8 septets of the group
//!
//! A sentinel or a byte with its top bit set inside a group aborts the
//! partial group. A sentinel immediately starts the next group, so a single
//! lost byte costs at most one group.
//!
//! # Example
//!
//! ```
//! use blueteeth::codec::{encode, FrameDecoder};
//!
//! let framed = encode(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
//! let mut decoder = FrameDecoder::new();
//!
//! assert!(decoder.push(&framed[..4]).is_empty());
//! assert_eq!(&decoder.push(&framed[4..])[..], &[1, 2, 3, 4, 5, 6, 7]);
//! ```

use bytes::{Bytes, BytesMut};

use super::septet::{decode_group, RAW_GROUP_SIZE, SENTINEL, SEPTETS_PER_GROUP};

/// Decoder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Looking for the next sentinel.
    Hunting,
    /// Inside a group, `filled` septets collected so far.
    Collecting { filled: usize },
}

/// Incremental decoder that turns raw link bytes back into payload bytes.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    septets: [u8; SEPTETS_PER_GROUP],
    /// Groups abandoned because of a malformed byte.
    resyncs: u64,
    /// Bytes discarded while hunting for a sentinel.
    skipped: u64,
    /// Groups decoded successfully.
    groups: u64,
}

impl FrameDecoder {
    /// Create a decoder waiting for the first sentinel.
    pub fn new() -> Self {
        Self {
            state: State::Hunting,
            septets: [0; SEPTETS_PER_GROUP],
            resyncs: 0,
            skipped: 0,
            groups: 0,
        }
    }

    /// Push link bytes and return every payload byte completed by them.
    ///
    /// A partially received group is kept for the next call.
    pub fn push(&mut self, data: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(data.len() / 9 * RAW_GROUP_SIZE + RAW_GROUP_SIZE);

        for &byte in data {
            match self.state {
                State::Hunting => {
                    if byte == SENTINEL {
                        self.state = State::Collecting { filled: 0 };
                    } else {
                        self.skipped += 1;
                    }
                }
                State::Collecting { filled } => {
                    if byte == SENTINEL {
                        // Previous group was cut short; this sentinel starts a new one.
                        self.resyncs += 1;
                        tracing::debug!("Data plane resync after {} septets", filled);
                        self.state = State::Collecting { filled: 0 };
                        continue;
                    }

                    self.septets[filled] = byte;
                    let filled = filled + 1;

                    if filled < SEPTETS_PER_GROUP {
                        self.state = State::Collecting { filled };
                        continue;
                    }

                    self.state = State::Hunting;
                    match decode_group(&self.septets) {
                        Some(raw) => {
                            self.groups += 1;
                            out.extend_from_slice(&raw);
                        }
                        None => {
                            self.resyncs += 1;
                            tracing::debug!("Dropping data plane group with invalid septet");
                        }
                    }
                }
            }
        }

        out.freeze()
    }

    /// Number of groups abandoned because of malformed input.
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    /// Number of bytes discarded while looking for a sentinel.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    /// Number of groups decoded.
    pub fn group_count(&self) -> u64 {
        self.groups
    }

    /// Check if a group is partially received.
    pub fn is_mid_group(&self) -> bool {
        matches!(self.state, State::Collecting { .. })
    }

    /// Drop any partial group and hunt for the next sentinel.
    pub fn reset(&mut self) {
        self.state = State::Hunting;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
