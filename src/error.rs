//! Error taxonomy.
//!
//! Two distinct layers, never conflated:
//!
//! - **Transport**: I/O failures, unexpected EOF, malformed frames. Always
//!   fatal to the affected connection; pools cure them by reconnecting.
//! - **Protocol**: stringly-typed `E_*` codes carried in Error frames.
//!   A handful abort the connection (identify/auth); the rest fail only
//!   the outstanding request.
//!
//! Lookup engine errors live in [`crate::lookup::EngineError`], a third
//! taxonomy of their own.

use std::fmt;
use std::io;

use thiserror::Error;

/// Well-known server error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed or unrecognized command.
    Invalid,
    /// Body failed to parse or violated size limits.
    BadBody,
    /// Topic name rejected.
    BadTopic,
    /// Channel name rejected.
    BadChannel,
    /// Message rejected.
    BadMessage,
    /// PUB could not be applied.
    PubFailed,
    /// MPUB could not be applied.
    MpubFailed,
    /// FIN referenced an unknown or already-finished message.
    FinFailed,
    /// REQ referenced an unknown message.
    ReqFailed,
    /// TOUCH referenced an unknown message.
    TouchFailed,
    /// AUTH secret rejected.
    AuthFailed,
    /// Operation attempted without required authorization.
    Unauthorized,
}

impl ErrorCode {
    /// Parse a wire code. Returns `None` for codes this library does not
    /// recognize; unknown codes are treated as non-fatal.
    pub fn parse(code: &str) -> Option<ErrorCode> {
        Some(match code {
            "E_INVALID" => ErrorCode::Invalid,
            "E_BAD_BODY" => ErrorCode::BadBody,
            "E_BAD_TOPIC" => ErrorCode::BadTopic,
            "E_BAD_CHANNEL" => ErrorCode::BadChannel,
            "E_BAD_MESSAGE" => ErrorCode::BadMessage,
            "E_PUB_FAILED" => ErrorCode::PubFailed,
            "E_MPUB_FAILED" => ErrorCode::MpubFailed,
            "E_FIN_FAILED" => ErrorCode::FinFailed,
            "E_REQ_FAILED" => ErrorCode::ReqFailed,
            "E_TOUCH_FAILED" => ErrorCode::TouchFailed,
            "E_AUTH_FAILED" => ErrorCode::AuthFailed,
            "E_UNAUTHORIZED" => ErrorCode::Unauthorized,
            _ => return None,
        })
    }

    /// The wire representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Invalid => "E_INVALID",
            ErrorCode::BadBody => "E_BAD_BODY",
            ErrorCode::BadTopic => "E_BAD_TOPIC",
            ErrorCode::BadChannel => "E_BAD_CHANNEL",
            ErrorCode::BadMessage => "E_BAD_MESSAGE",
            ErrorCode::PubFailed => "E_PUB_FAILED",
            ErrorCode::MpubFailed => "E_MPUB_FAILED",
            ErrorCode::FinFailed => "E_FIN_FAILED",
            ErrorCode::ReqFailed => "E_REQ_FAILED",
            ErrorCode::TouchFailed => "E_TOUCH_FAILED",
            ErrorCode::AuthFailed => "E_AUTH_FAILED",
            ErrorCode::Unauthorized => "E_UNAUTHORIZED",
        }
    }

    /// Whether receiving this code aborts the connection.
    ///
    /// Identify/auth failures poison the session; everything else fails
    /// only the request that triggered it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::Invalid
                | ErrorCode::BadBody
                | ErrorCode::AuthFailed
                | ErrorCode::Unauthorized
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An Error frame payload as reported by the server.
///
/// The payload is kept verbatim; the leading token is the `E_*` code and
/// anything after it is human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ServerError(pub String);

impl ServerError {
    /// The recognized code, if the leading token is one this library knows.
    pub fn code(&self) -> Option<ErrorCode> {
        let token = self.0.split_whitespace().next().unwrap_or("");
        ErrorCode::parse(token)
    }

    /// Whether this error aborts the connection it arrived on.
    /// Unrecognized codes are conservatively non-fatal.
    pub fn is_fatal(&self) -> bool {
        self.code().is_some_and(|c| c.is_fatal())
    }
}

/// Errors surfaced by the client library.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure; fatal to the connection it occurred on.
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    /// An Error frame from the server, carrying the exact `E_*` code.
    #[error("server: {0}")]
    Server(#[from] ServerError),

    /// The peer violated the framing protocol.
    #[error("malformed frame: {0}")]
    BadFrame(String),

    /// Handshake or negotiation did not go as expected.
    #[error("handshake: {0}")]
    Handshake(String),

    /// JSON in the identify/lookup exchange failed to parse.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// A lookup directory poll failed; logged and retried, never fatal.
    #[error("lookup: {0}")]
    Lookup(String),

    /// TLS layer failure.
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    /// Operation on a connection that is already closed, including calls
    /// through a stale message handle.
    #[error("connection closed")]
    Closed,

    /// Operation on a pool after `stop()`.
    #[error("pool stopped")]
    Stopped,

    /// Publish wait expired. The request may still reach the wire.
    #[error("publish timed out")]
    PublishTimeout,

    /// Invalid caller-supplied configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the connection this error occurred on must be torn down.
    pub(crate) fn is_connection_fatal(&self) -> bool {
        match self {
            Error::Io(_) | Error::BadFrame(_) | Error::Closed | Error::Tls(_) => true,
            Error::Server(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
