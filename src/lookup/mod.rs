//! Lookup directory: the registry engine brokers report into and the
//! client consumers discover brokers through.
//!
//! - [`Engine`] is the directory interface; [`LocalEngine`] is the
//!   in-memory implementation with soft-state node expiry and topic
//!   tombstones.
//! - [`LookupClient`] polls a set of directory HTTP endpoints and unions
//!   the advertised producers for a topic.

mod client;
mod engine;
mod local;

pub use client::{LookupClient, LookupConfig};
pub use engine::{Engine, EngineError, EngineInfo, NodeInfo};
pub use local::{LocalConfig, LocalEngine, DEFAULT_NODE_TIMEOUT, DEFAULT_TOMBSTONE_TIMEOUT};
