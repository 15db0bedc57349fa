//! Message payload codec and the consumer-side completion handle.
//!
//! A [`Message`] delivered by a consumer carries a non-owning back-reference
//! to the connection it arrived on so the caller can [`finish`],
//! [`requeue`], or [`touch`] it without holding the connection itself.
//! Once the origin connection closes, the handle goes stale and these calls
//! fail with the benign [`Error::Closed`].
//!
//! [`finish`]: Message::finish
//! [`requeue`]: Message::requeue
//! [`touch`]: Message::touch

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Duration;

use crate::command::Command;
use crate::conn::ConnShared;
use crate::error::{Error, Result};

/// Minimum message payload: timestamp (8) + attempts (2) + id (16).
const MIN_PAYLOAD: usize = 8 + 2 + 16;

/// Opaque 16-byte message identifier assigned by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    /// The raw wire bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Broker ids are printable ASCII in practice.
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// A message delivered on a consumer connection.
pub struct Message {
    /// Broker-assigned identifier.
    pub id: MessageId,
    /// Delivery attempt count; at least 1 on every delivery.
    pub attempts: u16,
    /// Broker-side arrival timestamp, nanoseconds.
    pub timestamp: i64,
    /// Opaque payload bytes.
    pub body: Vec<u8>,

    conn: Weak<ConnShared>,
    acked: AtomicBool,
}

impl Message {
    /// Decode a message from a Message frame payload.
    ///
    /// Layout (big-endian): `timestamp: i64 | attempts: u16 | id: 16 bytes |
    /// body`.
    pub fn decode(payload: &[u8]) -> Result<Message> {
        if payload.len() < MIN_PAYLOAD {
            return Err(Error::BadFrame(format!(
                "message payload too short: {} bytes",
                payload.len()
            )));
        }
        let timestamp = i64::from_be_bytes(payload[0..8].try_into().expect("8-byte slice"));
        let attempts = u16::from_be_bytes([payload[8], payload[9]]);
        let mut id = [0u8; 16];
        id.copy_from_slice(&payload[10..26]);
        Ok(Message {
            id: MessageId(id),
            attempts,
            timestamp,
            body: payload[26..].to_vec(),
            conn: Weak::new(),
            acked: AtomicBool::new(false),
        })
    }

    /// Encode into a Message frame payload (the inverse of [`decode`]).
    ///
    /// [`decode`]: Message::decode
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_PAYLOAD + self.body.len());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.attempts.to_be_bytes());
        buf.extend_from_slice(&self.id.0);
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Bind this message to the connection it arrived on.
    pub(crate) fn attach(&mut self, conn: Weak<ConnShared>) {
        self.conn = conn;
    }

    /// Acknowledge successful handling: writes `FIN <id>` and releases the
    /// in-flight slot.
    ///
    /// Idempotent on the client side; repeated calls are no-ops.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] if the origin connection is gone, or the write
    /// failure if the connection died mid-call.
    pub fn finish(&self) -> Result<()> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.conn.upgrade().ok_or(Error::Closed)?;
        conn.write_command(&Command::Fin { id: self.id })?;
        conn.release_in_flight();
        Ok(())
    }

    /// Hand the message back for redelivery after `delay`: writes
    /// `REQ <id> <ms>` and releases the in-flight slot.
    ///
    /// No-op if the message was already finished or requeued.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`finish`].
    ///
    /// [`finish`]: Message::finish
    pub fn requeue(&self, delay: Duration) -> Result<()> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.conn.upgrade().ok_or(Error::Closed)?;
        conn.write_command(&Command::Req { id: self.id, delay })?;
        conn.release_in_flight();
        Ok(())
    }

    /// Extend the server-side in-flight timeout: writes `TOUCH <id>`.
    ///
    /// No-op once the message has been finished or requeued.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`finish`].
    ///
    /// [`finish`]: Message::finish
    pub fn touch(&self) -> Result<()> {
        if self.acked.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.conn.upgrade().ok_or(Error::Closed)?;
        conn.write_command(&Command::Touch { id: self.id })
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .field("timestamp", &self.timestamp)
            .field("body_len", &self.body.len())
            .finish()
    }
}
