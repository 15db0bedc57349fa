//! Directory engine interface.
//!
//! An [`Engine`] is the registry a broker fleet reports into and consumers
//! discover from. The in-memory implementation lives in
//! [`super::LocalEngine`]; the trait is the seam an HTTP façade or an
//! alternative backend would plug into.

use thiserror::Error;

use serde::{Deserialize, Serialize};

/// A broker node as advertised to the directory.
///
/// Identity is `(broadcast_address, tcp_port)`; two descriptors refer to
/// the same node exactly when that pair matches. The serde field names are
/// the directory HTTP payload format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct NodeInfo {
    /// Address the registration connection came from.
    #[serde(default)]
    pub remote_address: String,
    /// Address the node asks clients to reach it on.
    pub broadcast_address: String,
    /// Node hostname.
    pub hostname: String,
    /// Pub/sub TCP port.
    pub tcp_port: u16,
    /// HTTP API port.
    pub http_port: u16,
    /// Broker software version.
    pub version: String,
}

impl NodeInfo {
    /// The identity key: broadcast address and TCP port.
    pub fn key(&self) -> String {
        self.tcp_address()
    }

    /// The `host:port` clients dial for pub/sub.
    pub fn tcp_address(&self) -> String {
        format!("{}:{}", self.broadcast_address, self.tcp_port)
    }
}

/// Directory engine errors, deliberately separate from the transport
/// taxonomy in [`crate::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The referenced node is not registered (or has been swept).
    #[error("unknown node: {0}")]
    UnknownNode(String),
    /// The referenced topic has no registrations.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    /// The referenced channel has no registrations.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

/// Engine identification, surfaced by diagnostics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    /// Engine type tag, e.g. `"local"`.
    #[serde(rename = "type")]
    pub engine_type: String,
    /// Engine software version.
    pub version: String,
}

/// A topic/channel directory.
///
/// Every operation is concurrent-safe and atomic with respect to the
/// registry; lookups return copies, never aliased state.
pub trait Engine: Send + Sync {
    /// Insert `node` or refresh its registration; last-seen becomes now.
    fn register_node(&self, node: NodeInfo) -> Result<(), EngineError>;

    /// Remove `node` with all its topics, channels, and tombstones.
    /// A no-op for an unknown node.
    fn unregister_node(&self, node: &NodeInfo) -> Result<(), EngineError>;

    /// Refresh `node`'s last-seen timestamp.
    fn ping_node(&self, node: &NodeInfo) -> Result<(), EngineError>;

    /// Record that `node` produces `topic`.
    fn register_topic(&self, node: &NodeInfo, topic: &str) -> Result<(), EngineError>;

    /// Forget that `node` produces `topic`; never tombstones. A no-op when
    /// the registration does not exist.
    fn unregister_topic(&self, node: &NodeInfo, topic: &str) -> Result<(), EngineError>;

    /// Record that `node` hosts `(topic, channel)`, implicitly registering
    /// the topic.
    fn register_channel(
        &self,
        node: &NodeInfo,
        topic: &str,
        channel: &str,
    ) -> Result<(), EngineError>;

    /// Forget `(topic, channel)` on `node`, leaving the topic registration
    /// alone. A no-op when the registration does not exist.
    fn unregister_channel(
        &self,
        node: &NodeInfo,
        topic: &str,
        channel: &str,
    ) -> Result<(), EngineError>;

    /// Stamp a tombstone dated now on `(node, topic)`, hiding the node
    /// from the topic's producer set until the tombstone expires.
    fn tombstone_topic(&self, node: &NodeInfo, topic: &str) -> Result<(), EngineError>;

    /// All live nodes.
    fn lookup_nodes(&self) -> Result<Vec<NodeInfo>, EngineError>;

    /// All topics registered by at least one live node and not tombstoned
    /// on every registrant.
    fn lookup_topics(&self) -> Result<Vec<String>, EngineError>;

    /// All channels any live node hosts for `topic`.
    fn lookup_channels(&self, topic: &str) -> Result<Vec<String>, EngineError>;

    /// All live nodes producing `topic` whose tombstone, if any, expired.
    fn lookup_producers(&self, topic: &str) -> Result<Vec<NodeInfo>, EngineError>;

    /// Cheap liveness probe.
    fn check_health(&self) -> Result<(), EngineError>;

    /// Engine identification.
    fn lookup_info(&self) -> EngineInfo;

    /// Stop background work. Idempotent; the registry stays queryable.
    fn close(&self);
}
