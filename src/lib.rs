//! Client library and lookup directory for the NSQ pub/sub protocol.
//!
//! Three pieces:
//!
//! - [`Producer`]: a pool of connections to one broker that serializes
//!   concurrent publishes, pairs each with its response, and reconnects
//!   with capped backoff.
//! - [`Consumer`]: subscriptions to a `(topic, channel)` pair across every
//!   broker advertising the topic, with RDY credit flow control and a
//!   bounded delivery channel as the backpressure boundary.
//! - [`lookup`]: the directory, an in-memory registry engine with
//!   soft-state expiry and tombstones, plus the HTTP polling client
//!   consumers use for discovery.
//!
//! ```no_run
//! use nsq::{Consumer, ConsumerConfig, Producer, ProducerConfig};
//!
//! # fn main() -> nsq::Result<()> {
//! let consumer = Consumer::start(ConsumerConfig {
//!     topic: "events".to_string(),
//!     channel: "archive".to_string(),
//!     lookup: vec!["127.0.0.1:4161".to_string()],
//!     max_in_flight: 32,
//!     ..ConsumerConfig::default()
//! })?;
//!
//! let producer = Producer::start(ProducerConfig {
//!     address: "127.0.0.1:4150".to_string(),
//!     topic: "events".to_string(),
//!     max_concurrency: 3,
//!     ..ProducerConfig::default()
//! })?;
//!
//! producer.publish(b"hello".to_vec())?;
//! let msg = consumer.messages().recv().expect("consumer running");
//! msg.finish()?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod constants;
pub mod conn;
pub mod consumer;
pub mod error;
pub mod frame;
pub mod identify;
pub mod lookup;
pub mod message;
pub mod producer;

// Re-export the public surface at the crate root.
pub use command::Command;
pub use conn::{Connection, TlsSettings};
pub use consumer::{Consumer, ConsumerConfig};
pub use error::{Error, ErrorCode, Result, ServerError};
pub use frame::Frame;
pub use identify::{Identify, IdentifyResponse};
pub use message::{Message, MessageId};
pub use producer::{Producer, ProducerConfig};
