//! IDENTIFY negotiation.
//!
//! The first command on every connection. The client announces itself and
//! requests optional transports; the server answers either with a bare `OK`
//! or, since we always request feature negotiation, with a JSON object
//! listing what it accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_DEFLATE_LEVEL, DEFAULT_MAX_RDY_COUNT, RESPONSE_OK};
use crate::error::Result;

/// Client-side IDENTIFY options.
///
/// All fields are optional; [`Producer`](crate::Producer) and
/// [`Consumer`](crate::Consumer) fill the defaults before connecting:
/// `user_agent` from [`crate::constants::user_agent`], `hostname` from the
/// OS, `deflate_level` 6 when deflate is on and no level was chosen.
#[derive(Debug, Clone, Default)]
pub struct Identify {
    /// Unique identifier for this client.
    pub client_id: String,
    /// Client hostname; defaults to the OS hostname.
    pub hostname: String,
    /// Client software identifier; defaults to the library constant.
    pub user_agent: String,
    /// Upgrade the connection to TLS after the identify response.
    pub tls_v1: bool,
    /// Wrap the connection in a deflate stream after the response.
    pub deflate: bool,
    /// Deflate level 1-9; 0 means unset.
    pub deflate_level: u32,
    /// Wrap the connection in a snappy stream after the response.
    pub snappy: bool,
    /// Server-side in-flight timeout for messages on this session.
    pub msg_timeout: Option<Duration>,
}

impl Identify {
    /// Copy with unset fields resolved to their defaults.
    pub(crate) fn with_defaults(&self) -> Identify {
        let mut resolved = self.clone();
        if resolved.user_agent.is_empty() {
            resolved.user_agent = crate::constants::user_agent();
        }
        if resolved.hostname.is_empty() {
            resolved.hostname = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        if resolved.deflate && !(1..=9).contains(&resolved.deflate_level) {
            resolved.deflate_level = DEFAULT_DEFLATE_LEVEL;
        }
        resolved
    }

    /// Marshal the JSON command body. Unset fields are omitted; feature
    /// negotiation is always requested.
    pub(crate) fn body(&self) -> Result<Vec<u8>> {
        let body = IdentifyBody {
            client_id: &self.client_id,
            hostname: &self.hostname,
            user_agent: &self.user_agent,
            msg_timeout: self.msg_timeout.map(|t| t.as_millis() as u64),
            deflate_level: self.deflate_level,
            tls_v1: self.tls_v1,
            deflate: self.deflate,
            snappy: self.snappy,
            feature_negotiation: true,
        };
        Ok(serde_json::to_vec(&body)?)
    }
}

/// Wire shape of the IDENTIFY body.
#[derive(Serialize)]
struct IdentifyBody<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    client_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    hostname: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    user_agent: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg_timeout: Option<u64>,
    #[serde(skip_serializing_if = "is_zero")]
    deflate_level: u32,
    #[serde(skip_serializing_if = "is_false")]
    tls_v1: bool,
    #[serde(skip_serializing_if = "is_false")]
    deflate: bool,
    #[serde(skip_serializing_if = "is_false")]
    snappy: bool,
    feature_negotiation: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Server capabilities accepted during negotiation.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentifyResponse {
    /// Largest RDY count this server will honor per connection.
    #[serde(default = "default_max_rdy")]
    pub max_rdy_count: u32,
    /// TLS upgrade accepted.
    #[serde(default, rename = "tls_v1")]
    pub tls_v1: bool,
    /// Deflate upgrade accepted.
    #[serde(default)]
    pub deflate: bool,
    /// Snappy upgrade accepted.
    #[serde(default)]
    pub snappy: bool,
    /// The client must AUTH before issuing other commands.
    #[serde(default)]
    pub auth_required: bool,
}

fn default_max_rdy() -> u32 {
    DEFAULT_MAX_RDY_COUNT
}

impl Default for IdentifyResponse {
    fn default() -> Self {
        IdentifyResponse {
            max_rdy_count: DEFAULT_MAX_RDY_COUNT,
            tls_v1: false,
            deflate: false,
            snappy: false,
            auth_required: false,
        }
    }
}

impl IdentifyResponse {
    /// Interpret the identify response text: a bare `OK` means the server
    /// skipped negotiation and defaults apply; anything else is JSON.
    pub fn parse(response: &str) -> Result<IdentifyResponse> {
        if response == RESPONSE_OK {
            return Ok(IdentifyResponse::default());
        }
        Ok(serde_json::from_str(response)?)
    }
}
