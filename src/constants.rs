//! Protocol constants and library defaults.
//!
//! Centralizes the wire magic, well-known response payloads, and the
//! timing/sizing defaults used by the connection pools so they are
//! discoverable in one place.

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// User-Agent reported in the IDENTIFY body when the caller leaves it unset.
///
/// Version-stamped so brokers can track client versions in the wild.
pub fn user_agent() -> String {
    format!("nsq/{}", env!("CARGO_PKG_VERSION"))
}

// ============================================================================
// Wire protocol
// ============================================================================

/// Protocol magic written immediately after the TCP connection opens.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Response payload acknowledging a command.
pub const RESPONSE_OK: &str = "OK";

/// Server-initiated keepalive; the client must answer with `NOP`.
pub const RESPONSE_HEARTBEAT: &str = "_heartbeat_";

/// Server acknowledgment of `CLS`; messages may still drain afterwards.
pub const RESPONSE_CLOSE_WAIT: &str = "CLOSE_WAIT";

/// Upper bound on a single frame, guarding against corrupt size headers.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

// ============================================================================
// Negotiation defaults
// ============================================================================

/// Deflate level used when the caller enables deflate without picking one.
pub const DEFAULT_DEFLATE_LEVEL: u32 = 6;

/// RDY ceiling assumed when the server skips feature negotiation and
/// replies with a bare `OK`.
pub const DEFAULT_MAX_RDY_COUNT: u32 = 2500;

// ============================================================================
// Timing
// ============================================================================

/// First reconnect delay after a connection failure; doubles per attempt.
pub const RECONNECT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Reconnect backoff ceiling.
pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Interval between consumer reconciliations against the discovered
/// broker set.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(15);

/// Interval between lookup directory polls.
pub const DEFAULT_LOOKUP_INTERVAL: Duration = Duration::from_secs(15);

/// Heartbeat cadence assumed from the server. A connection that produces
/// no frames for two full intervals is declared dead.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
