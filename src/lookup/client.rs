//! Lookup directory poller.
//!
//! Polls `GET <endpoint>/lookup?topic=<topic>` on every configured
//! directory at a fixed interval and keeps a deduplicated union of the
//! advertised producers. A directory that fails to answer keeps
//! contributing its last known node set, so consumers ride out partial
//! directory outages without churning connections.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::Deserialize;

use crate::constants::DEFAULT_LOOKUP_INTERVAL;
use crate::error::{Error, Result};

use super::engine::NodeInfo;

/// HTTP request timeout for directory polls.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`LookupClient`].
#[derive(Debug, Clone, Default)]
pub struct LookupConfig {
    /// Directory endpoints, with or without an `http://` scheme.
    pub endpoints: Vec<String>,
    /// Topic to discover producers for.
    pub topic: String,
    /// Poll cadence; zero means 15 s.
    pub poll_interval: Duration,
}

/// Wire shape of a directory lookup response.
#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<NodeInfo>,
}

struct LookupShared {
    endpoints: Vec<String>,
    topic: String,
    http: reqwest::blocking::Client,
    /// Last successful node set per endpoint; unions into the snapshot.
    per_endpoint: Mutex<HashMap<String, Vec<NodeInfo>>>,
}

/// Periodic poller over a set of lookup directories.
pub struct LookupClient {
    shared: Arc<LookupShared>,
    poller: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
}

impl LookupClient {
    /// Start polling. The first poll fires immediately but asynchronously;
    /// [`nodes`] is empty until it lands.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an empty endpoint list or topic, or an HTTP
    /// client that fails to build.
    ///
    /// [`nodes`]: LookupClient::nodes
    pub fn start(config: LookupConfig) -> Result<LookupClient> {
        if config.endpoints.is_empty() {
            return Err(Error::Config("lookup endpoints are required".to_string()));
        }
        if config.topic.is_empty() {
            return Err(Error::Config("lookup topic is required".to_string()));
        }
        let interval = if config.poll_interval.is_zero() {
            DEFAULT_LOOKUP_INTERVAL
        } else {
            config.poll_interval
        };

        let http = reqwest::blocking::Client::builder()
            .timeout(POLL_TIMEOUT)
            .user_agent(crate::constants::user_agent())
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;

        let shared = Arc::new(LookupShared {
            endpoints: config.endpoints,
            topic: config.topic,
            http,
            per_endpoint: Mutex::new(HashMap::new()),
        });

        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        let poller = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("nsq-lookup-poller".to_string())
                .spawn(move || poller_loop(&shared, interval, &shutdown_rx))
                .map_err(Error::Io)?
        };

        Ok(LookupClient {
            shared,
            poller: Mutex::new(Some(poller)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Snapshot of the current union, deduplicated by node identity.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        let per_endpoint = self.shared.per_endpoint.lock().unwrap();
        let mut seen: HashMap<String, NodeInfo> = HashMap::new();
        for nodes in per_endpoint.values() {
            for node in nodes {
                seen.entry(node.key()).or_insert_with(|| node.clone());
            }
        }
        seen.into_values().collect()
    }

    /// Poll every directory once, synchronously. Used on top of the
    /// background cadence when fresh data is worth blocking for.
    pub fn poll_once(&self) {
        poll_all(&self.shared);
    }

    /// Stop the poller and join it. Idempotent.
    pub fn stop(&self) {
        self.shutdown_tx.lock().unwrap().take();
        if let Some(handle) = self.poller.lock().unwrap().take() {
            handle.join().ok();
        }
    }
}

impl Drop for LookupClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for LookupClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupClient")
            .field("endpoints", &self.shared.endpoints)
            .field("topic", &self.shared.topic)
            .finish()
    }
}

fn poller_loop(shared: &Arc<LookupShared>, interval: Duration, shutdown: &Receiver<()>) {
    loop {
        poll_all(shared);
        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return,
        }
    }
}

fn poll_all(shared: &LookupShared) {
    for endpoint in &shared.endpoints {
        match poll_endpoint(shared, endpoint) {
            Ok(nodes) => {
                log::debug!(
                    "[lookup] {endpoint} advertises {} producers for {}",
                    nodes.len(),
                    shared.topic
                );
                shared
                    .per_endpoint
                    .lock()
                    .unwrap()
                    .insert(endpoint.clone(), nodes);
            }
            Err(e) => {
                // Keep the endpoint's last known set.
                log::warn!("[lookup] poll {endpoint} failed: {e}");
            }
        }
    }
}

fn poll_endpoint(shared: &LookupShared, endpoint: &str) -> Result<Vec<NodeInfo>> {
    let base = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    };
    let url = format!("{base}/lookup?topic={}", shared.topic);

    let response = shared
        .http
        .get(&url)
        .send()
        .map_err(|e| Error::Lookup(format!("request: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::Lookup(format!("status {}", response.status())));
    }
    let body: LookupResponse = response
        .json()
        .map_err(|e| Error::Lookup(format!("response: {e}")))?;
    Ok(body.producers)
}
