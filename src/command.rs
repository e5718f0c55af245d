//! Operator commands.
//!
//! The terminal turns typed lines into [`Command`]s and applies them to a
//! running [`Stack`]. Applying a command only queues work, so it never waits
//! on the token or on a link.
//!
//! | Line     | Effect                                                    |
//! |----------|-----------------------------------------------------------|
//! | `ping`   | Broadcast an empty PING; every node answers with its address |
//! | `stream` | Feed the test pattern to the data plane and announce it   |
//! | `init`   | Send INITIALIZATION around the ring                       |

use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{BlueteethError, Result};
use crate::protocol::{Packet, PacketType, StreamRequest, RING_BROADCAST, SELF_PLACEHOLDER};
use crate::stack::Stack;

/// Length of the stream test pattern.
pub const STREAM_TEST_LENGTH: usize = 40_000;

/// Build the stream test pattern: the values 1 to 255 repeated, then a
/// 0, 1, 2... tail up to [`STREAM_TEST_LENGTH`] bytes.
///
/// Zero is left out of the repeated part so a receiver that drops zero
/// bytes shows up as a checksum mismatch.
pub fn stream_test_pattern() -> Vec<u8> {
    let mut pattern = Vec::with_capacity(STREAM_TEST_LENGTH);
    while pattern.len() + 255 <= STREAM_TEST_LENGTH {
        pattern.extend(1..=255u8);
    }
    let tail = STREAM_TEST_LENGTH - pattern.len();
    pattern.extend((0..tail).map(|i| i as u8));
    pattern
}

/// A command the operator can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask every ring member for a ping response.
    Ping,
    /// Run the stream test.
    Stream,
    /// Start ring initialisation.
    Initialize,
    /// Queue an arbitrary packet.
    Send { packet: Packet, broadcast: bool },
}

impl FromStr for Command {
    type Err = BlueteethError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ping" => Ok(Command::Ping),
            "stream" => Ok(Command::Stream),
            "init" | "initialize" => Ok(Command::Initialize),
            other => Err(BlueteethError::UnknownCommand(other.to_string())),
        }
    }
}

impl Command {
    /// Queue the packets (and stream bytes) this command stands for.
    pub fn apply(self, stack: &Stack) -> Result<()> {
        let address = stack.address();

        match self {
            Command::Ping => {
                stack.queue_packet(Packet::empty(PacketType::Ping, address, SELF_PLACEHOLDER), true);
            }
            Command::Stream => {
                let pattern = stream_test_pattern();
                let request = StreamRequest {
                    length: pattern.len() as u32,
                };
                let packet = Packet::new(
                    PacketType::Stream,
                    address,
                    SELF_PLACEHOLDER,
                    &request.to_payload(),
                )?;

                stack.on_bytes_received(&pattern);
                stack.queue_packet(packet, true);
            }
            Command::Initialize => {
                let packet = Packet::new(PacketType::Initialization, address, RING_BROADCAST, &[1])?;
                stack.queue_packet(packet, false);
            }
            Command::Send { packet, broadcast } => stack.queue_packet(packet, broadcast),
        }

        tracing::debug!("Node {} applied {:?}", address, self);
        Ok(())
    }
}

/// Read commands line by line from `input` and apply them until EOF.
///
/// Blank lines are skipped. Unknown commands are reported on the stack's
/// console and do not stop the loop.
pub async fn run_commands<R>(input: R, stack: &Stack) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<Command>() {
            Ok(command) => command.apply(stack)?,
            Err(e) => stack.console().line(&e.to_string()),
        }
    }

    Ok(())
}
