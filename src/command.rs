//! Client command encoding.
//!
//! Commands are line-oriented; `IDENTIFY`, `AUTH`, `PUB`, and `MPUB` carry a
//! big-endian length-prefixed body after the newline:
//!
//! ```text
//! IDENTIFY\n<u32 size><json body>
//! SUB <topic> <channel>\n
//! PUB <topic>\n<u32 size><body>
//! MPUB <topic>\n<u32 size><u32 count>(<u32 size><body>)*
//! RDY <count>\n
//! FIN <id>\n
//! REQ <id> <ms>\n
//! TOUCH <id>\n
//! CLS\n
//! NOP\n
//! AUTH\n<u32 size><secret>
//! ```

use std::io::{self, Write};
use std::time::Duration;

use crate::message::MessageId;

/// A client command ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Negotiate protocol options; `body` is the marshalled JSON from
    /// [`crate::identify::Identify`].
    Identify { body: Vec<u8> },
    /// Present an opaque auth secret.
    Auth { secret: Vec<u8> },
    /// Subscribe to a channel on a topic.
    Sub { topic: String, channel: String },
    /// Publish one message.
    Pub { topic: String, body: Vec<u8> },
    /// Publish a batch atomically.
    Mpub { topic: String, bodies: Vec<Vec<u8>> },
    /// Grant the server delivery credit.
    Rdy { count: u32 },
    /// Acknowledge a message.
    Fin { id: MessageId },
    /// Requeue a message after a delay.
    Req { id: MessageId, delay: Duration },
    /// Extend a message's in-flight timeout.
    Touch { id: MessageId },
    /// Begin a clean close.
    Cls,
    /// Heartbeat reply.
    Nop,
}

impl Command {
    /// The command verb, as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify { .. } => "IDENTIFY",
            Command::Auth { .. } => "AUTH",
            Command::Sub { .. } => "SUB",
            Command::Pub { .. } => "PUB",
            Command::Mpub { .. } => "MPUB",
            Command::Rdy { .. } => "RDY",
            Command::Fin { .. } => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch { .. } => "TOUCH",
            Command::Cls => "CLS",
            Command::Nop => "NOP",
        }
    }

    /// Serialize onto `w`. The caller flushes; one flush per command is the
    /// discipline the connection enforces.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Command::Identify { body } => {
                w.write_all(b"IDENTIFY\n")?;
                write_body(w, body)
            }
            Command::Auth { secret } => {
                w.write_all(b"AUTH\n")?;
                write_body(w, secret)
            }
            Command::Sub { topic, channel } => {
                writeln!(w, "SUB {topic} {channel}")
            }
            Command::Pub { topic, body } => {
                writeln!(w, "PUB {topic}")?;
                write_body(w, body)
            }
            Command::Mpub { topic, bodies } => {
                writeln!(w, "MPUB {topic}")?;
                let total: usize = 4 + bodies.iter().map(|b| 4 + b.len()).sum::<usize>();
                w.write_all(&(total as u32).to_be_bytes())?;
                w.write_all(&(bodies.len() as u32).to_be_bytes())?;
                for body in bodies {
                    write_body(w, body)?;
                }
                Ok(())
            }
            Command::Rdy { count } => writeln!(w, "RDY {count}"),
            Command::Fin { id } => {
                w.write_all(b"FIN ")?;
                w.write_all(id.as_bytes())?;
                w.write_all(b"\n")
            }
            Command::Req { id, delay } => {
                w.write_all(b"REQ ")?;
                w.write_all(id.as_bytes())?;
                writeln!(w, " {}", delay.as_millis())
            }
            Command::Touch { id } => {
                w.write_all(b"TOUCH ")?;
                w.write_all(id.as_bytes())?;
                w.write_all(b"\n")
            }
            Command::Cls => w.write_all(b"CLS\n"),
            Command::Nop => w.write_all(b"NOP\n"),
        }
    }
}

fn write_body<W: Write>(w: &mut W, body: &[u8]) -> io::Result<()> {
    w.write_all(&(body.len() as u32).to_be_bytes())?;
    w.write_all(body)
}
