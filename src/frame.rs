//! Wire frame codec.
//!
//! Every unit on the stream after the handshake magic is a frame:
//!
//! ```text
//! [u32 BE: size] [u32 BE: frame_type] [payload: size - 4 bytes]
//! ```
//!
//! Frame types:
//! - `0`: Response (UTF-8 text, e.g. `OK`, `_heartbeat_`, identify JSON)
//! - `1`: Error (UTF-8 text, `E_*` code plus optional detail)
//! - `2`: Message (see [`crate::message::Message`] for the payload layout)

use std::io::{Read, Write};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{Error, Result, ServerError};
use crate::message::Message;

/// Frame type constants.
pub mod frame_type {
    /// Text response.
    pub const RESPONSE: u32 = 0;
    /// Text error.
    pub const ERROR: u32 = 1;
    /// Message delivery.
    pub const MESSAGE: u32 = 2;
}

/// A decoded frame.
#[derive(Debug)]
pub enum Frame {
    /// Text response from the server.
    Response(String),
    /// Error reported by the server.
    Error(ServerError),
    /// A delivered message.
    Message(Message),
}

impl Frame {
    /// Read one frame, blocking until it is complete.
    ///
    /// # Errors
    ///
    /// I/O errors (including unexpected EOF mid-frame) and framing
    /// violations: undersized or oversized size headers, unknown frame
    /// types, non-UTF-8 text payloads.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Frame> {
        let mut header = [0u8; 4];
        r.read_exact(&mut header)?;
        let size = u32::from_be_bytes(header);
        if size < 4 {
            return Err(Error::BadFrame(format!("frame size {size} below header")));
        }
        if size > MAX_FRAME_SIZE {
            return Err(Error::BadFrame(format!(
                "frame size {size} exceeds limit {MAX_FRAME_SIZE}"
            )));
        }

        r.read_exact(&mut header)?;
        let frame_type = u32::from_be_bytes(header);

        let mut payload = vec![0u8; (size - 4) as usize];
        r.read_exact(&mut payload)?;

        match frame_type {
            frame_type::RESPONSE => Ok(Frame::Response(text(payload)?)),
            frame_type::ERROR => Ok(Frame::Error(ServerError(text(payload)?))),
            frame_type::MESSAGE => Ok(Frame::Message(Message::decode(&payload)?)),
            other => Err(Error::BadFrame(format!("unknown frame type {other}"))),
        }
    }

    /// Serialize this frame, the server side of the codec.
    ///
    /// The client never sends frames (commands go out instead); this is
    /// used by mock brokers in tests and kept with the codec it mirrors.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let (frame_type, payload) = match self {
            Frame::Response(s) => (frame_type::RESPONSE, s.as_bytes().to_vec()),
            Frame::Error(e) => (frame_type::ERROR, e.0.as_bytes().to_vec()),
            Frame::Message(m) => (frame_type::MESSAGE, m.encode_payload()),
        };
        w.write_all(&((payload.len() as u32 + 4).to_be_bytes()))?;
        w.write_all(&frame_type.to_be_bytes())?;
        w.write_all(&payload)
    }
}

fn text(payload: Vec<u8>) -> Result<String> {
    String::from_utf8(payload)
        .map_err(|_| Error::BadFrame("text frame payload is not UTF-8".to_string()))
}
