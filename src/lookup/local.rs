//! In-memory directory engine.
//!
//! State is soft: a node counts as registered only while its last-seen
//! timestamp is within the node timeout, and a tombstone suppresses a node
//! from a topic's producer set only until the tombstone timeout passes.
//! Both are evaluated lazily at query time against the monotonic clock, so
//! correctness never depends on the sweeper; the background sweep exists
//! purely to reclaim memory held by expired entries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::engine::{Engine, EngineError, EngineInfo, NodeInfo};

/// Default window a node stays live without a ping.
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default tombstone lifetime.
pub const DEFAULT_TOMBSTONE_TIMEOUT: Duration = Duration::from_secs(45);

/// Configuration for [`LocalEngine`].
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Window a node stays live without a ping; zero means the default.
    pub node_timeout: Duration,
    /// Tombstone lifetime; zero means the default.
    pub tombstone_timeout: Duration,
    /// Sweep cadence; `None` derives one from the two timeouts.
    pub sweep_interval: Option<Duration>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        LocalConfig {
            node_timeout: DEFAULT_NODE_TIMEOUT,
            tombstone_timeout: DEFAULT_TOMBSTONE_TIMEOUT,
            sweep_interval: None,
        }
    }
}

/// Everything the directory knows about one node.
struct NodeState {
    info: NodeInfo,
    last_seen: Instant,
    topics: HashSet<String>,
    channels: HashMap<String, HashSet<String>>,
    tombstones: HashMap<String, Instant>,
}

impl NodeState {
    fn new(info: NodeInfo) -> NodeState {
        NodeState {
            info,
            last_seen: Instant::now(),
            topics: HashSet::new(),
            channels: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    fn live(&self, node_timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_seen) < node_timeout
    }

    fn tombstoned(&self, topic: &str, tombstone_timeout: Duration, now: Instant) -> bool {
        self.tombstones
            .get(topic)
            .is_some_and(|stamped| now.duration_since(*stamped) < tombstone_timeout)
    }
}

/// The in-memory [`Engine`] (type tag `"local"`).
pub struct LocalEngine {
    registry: Arc<RwLock<HashMap<String, NodeState>>>,
    node_timeout: Duration,
    tombstone_timeout: Duration,
    closed: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LocalEngine {
    /// Build the engine and start its sweeper.
    pub fn new(config: LocalConfig) -> LocalEngine {
        let node_timeout = if config.node_timeout.is_zero() {
            DEFAULT_NODE_TIMEOUT
        } else {
            config.node_timeout
        };
        let tombstone_timeout = if config.tombstone_timeout.is_zero() {
            DEFAULT_TOMBSTONE_TIMEOUT
        } else {
            config.tombstone_timeout
        };
        let sweep_interval = config
            .sweep_interval
            .unwrap_or_else(|| (node_timeout.min(tombstone_timeout) / 2).max(Duration::from_millis(10)));

        let registry: Arc<RwLock<HashMap<String, NodeState>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();

        let sweeper = {
            let registry = Arc::clone(&registry);
            thread::Builder::new()
                .name("nsq-lookup-sweeper".to_string())
                .spawn(move || {
                    sweeper_loop(
                        &registry,
                        node_timeout,
                        tombstone_timeout,
                        sweep_interval,
                        &shutdown_rx,
                    );
                })
                .ok()
        };

        LocalEngine {
            registry,
            node_timeout,
            tombstone_timeout,
            closed: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            sweeper: Mutex::new(sweeper),
        }
    }
}

fn sweeper_loop(
    registry: &RwLock<HashMap<String, NodeState>>,
    node_timeout: Duration,
    tombstone_timeout: Duration,
    interval: Duration,
    shutdown: &Receiver<()>,
) {
    loop {
        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return,
        }

        let now = Instant::now();
        let mut registry = registry.write().unwrap();
        let before = registry.len();
        registry.retain(|_, state| state.live(node_timeout, now));
        for state in registry.values_mut() {
            state
                .tombstones
                .retain(|_, stamped| now.duration_since(*stamped) < tombstone_timeout);
        }
        let swept = before - registry.len();
        if swept > 0 {
            log::debug!("[lookup] swept {swept} expired nodes");
        }
    }
}

impl Engine for LocalEngine {
    fn register_node(&self, node: NodeInfo) -> Result<(), EngineError> {
        let mut registry = self.registry.write().unwrap();
        match registry.get_mut(&node.key()) {
            Some(state) => {
                state.info = node;
                state.last_seen = Instant::now();
            }
            None => {
                registry.insert(node.key(), NodeState::new(node));
            }
        }
        Ok(())
    }

    fn unregister_node(&self, node: &NodeInfo) -> Result<(), EngineError> {
        self.registry.write().unwrap().remove(&node.key());
        Ok(())
    }

    fn ping_node(&self, node: &NodeInfo) -> Result<(), EngineError> {
        let mut registry = self.registry.write().unwrap();
        let state = registry
            .get_mut(&node.key())
            .ok_or_else(|| EngineError::UnknownNode(node.key()))?;
        // An expired-but-unswept node resurrects here; once the sweeper
        // has removed it, the ping fails instead.
        state.last_seen = Instant::now();
        Ok(())
    }

    fn register_topic(&self, node: &NodeInfo, topic: &str) -> Result<(), EngineError> {
        let mut registry = self.registry.write().unwrap();
        let state = registry
            .get_mut(&node.key())
            .ok_or_else(|| EngineError::UnknownNode(node.key()))?;
        state.topics.insert(topic.to_string());
        Ok(())
    }

    fn unregister_topic(&self, node: &NodeInfo, topic: &str) -> Result<(), EngineError> {
        let mut registry = self.registry.write().unwrap();
        if let Some(state) = registry.get_mut(&node.key()) {
            state.topics.remove(topic);
            // A node that no longer produces the topic hosts none of its
            // channels either.
            state.channels.remove(topic);
        }
        Ok(())
    }

    fn register_channel(
        &self,
        node: &NodeInfo,
        topic: &str,
        channel: &str,
    ) -> Result<(), EngineError> {
        let mut registry = self.registry.write().unwrap();
        let state = registry
            .get_mut(&node.key())
            .ok_or_else(|| EngineError::UnknownNode(node.key()))?;
        state
            .channels
            .entry(topic.to_string())
            .or_default()
            .insert(channel.to_string());
        state.topics.insert(topic.to_string());
        Ok(())
    }

    fn unregister_channel(
        &self,
        node: &NodeInfo,
        topic: &str,
        channel: &str,
    ) -> Result<(), EngineError> {
        let mut registry = self.registry.write().unwrap();
        if let Some(state) = registry.get_mut(&node.key()) {
            if let Some(channels) = state.channels.get_mut(topic) {
                channels.remove(channel);
                if channels.is_empty() {
                    state.channels.remove(topic);
                }
            }
        }
        Ok(())
    }

    fn tombstone_topic(&self, node: &NodeInfo, topic: &str) -> Result<(), EngineError> {
        let mut registry = self.registry.write().unwrap();
        let state = registry
            .get_mut(&node.key())
            .ok_or_else(|| EngineError::UnknownNode(node.key()))?;
        state.tombstones.insert(topic.to_string(), Instant::now());
        Ok(())
    }

    fn lookup_nodes(&self) -> Result<Vec<NodeInfo>, EngineError> {
        let now = Instant::now();
        let registry = self.registry.read().unwrap();
        Ok(registry
            .values()
            .filter(|state| state.live(self.node_timeout, now))
            .map(|state| state.info.clone())
            .collect())
    }

    fn lookup_topics(&self) -> Result<Vec<String>, EngineError> {
        let now = Instant::now();
        let registry = self.registry.read().unwrap();
        let mut topics = HashSet::new();
        for state in registry.values() {
            if !state.live(self.node_timeout, now) {
                continue;
            }
            for topic in &state.topics {
                if !state.tombstoned(topic, self.tombstone_timeout, now) {
                    topics.insert(topic.clone());
                }
            }
        }
        Ok(topics.into_iter().collect())
    }

    fn lookup_channels(&self, topic: &str) -> Result<Vec<String>, EngineError> {
        let now = Instant::now();
        let registry = self.registry.read().unwrap();
        let mut known = false;
        let mut channels = HashSet::new();
        for state in registry.values() {
            if !state.live(self.node_timeout, now) {
                continue;
            }
            if state.topics.contains(topic) || state.channels.contains_key(topic) {
                known = true;
            }
            if let Some(set) = state.channels.get(topic) {
                channels.extend(set.iter().cloned());
            }
        }
        if !known {
            return Err(EngineError::UnknownTopic(topic.to_string()));
        }
        Ok(channels.into_iter().collect())
    }

    fn lookup_producers(&self, topic: &str) -> Result<Vec<NodeInfo>, EngineError> {
        let now = Instant::now();
        let registry = self.registry.read().unwrap();
        Ok(registry
            .values()
            .filter(|state| {
                state.live(self.node_timeout, now)
                    && state.topics.contains(topic)
                    && !state.tombstoned(topic, self.tombstone_timeout, now)
            })
            .map(|state| state.info.clone())
            .collect())
    }

    fn check_health(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn lookup_info(&self) -> EngineInfo {
        EngineInfo {
            engine_type: "local".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.lock().unwrap().take();
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.join().ok();
        }
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LocalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEngine")
            .field("nodes", &self.registry.read().unwrap().len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_TIMEOUT: Duration = Duration::from_secs(60);
    const TOMB_TIMEOUT: Duration = Duration::from_millis(10);

    fn test_engine() -> LocalEngine {
        LocalEngine::new(LocalConfig {
            node_timeout: NODE_TIMEOUT,
            tombstone_timeout: TOMB_TIMEOUT,
            // Keep the sweeper out of timing-sensitive assertions.
            sweep_interval: Some(Duration::from_secs(3600)),
        })
    }

    fn make_node(i: usize) -> NodeInfo {
        NodeInfo {
            remote_address: format!("10.0.0.{i}:35000"),
            broadcast_address: format!("10.0.0.{i}"),
            hostname: format!("host-{i}"),
            tcp_port: 4150,
            http_port: 4151,
            version: "1.2.1".to_string(),
        }
    }

    fn check_equal_nodes(mut want: Vec<NodeInfo>, mut got: Vec<NodeInfo>) {
        want.sort();
        got.sort();
        assert_eq!(want, got);
    }

    fn check_equal_strings(want: &[&str], mut got: Vec<String>) {
        let mut want: Vec<String> = want.iter().map(|s| s.to_string()).collect();
        want.sort();
        got.sort();
        assert_eq!(want, got);
    }

    #[test]
    fn test_lookup_info_and_health() {
        let engine = test_engine();
        assert_eq!(engine.lookup_info().engine_type, "local");
        assert!(engine.check_health().is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let engine = test_engine();
        engine.close();
        engine.close();
        // Registry remains queryable after close.
        assert!(engine.lookup_nodes().unwrap().is_empty());
    }

    #[test]
    fn test_register_nodes() {
        let engine = test_engine();
        let nodes: Vec<_> = (1..=3).map(make_node).collect();
        for node in &nodes {
            engine.register_node(node.clone()).unwrap();
        }
        check_equal_nodes(nodes, engine.lookup_nodes().unwrap());
    }

    #[test]
    fn test_unregister_node_removes_everything() {
        let engine = test_engine();
        let nodes: Vec<_> = (1..=3).map(make_node).collect();
        for node in &nodes {
            engine.register_node(node.clone()).unwrap();
        }
        engine.register_topic(&nodes[0], "A").unwrap();
        engine.register_channel(&nodes[0], "A", "1").unwrap();
        engine.tombstone_topic(&nodes[0], "A").unwrap();

        engine.unregister_node(&nodes[0]).unwrap();

        check_equal_nodes(nodes[1..].to_vec(), engine.lookup_nodes().unwrap());
        assert!(engine.lookup_producers("A").unwrap().is_empty());
        // Unregistering again is a no-op.
        engine.unregister_node(&nodes[0]).unwrap();
    }

    #[test]
    fn test_ping_nodes() {
        let engine = test_engine();
        let nodes: Vec<_> = (1..=3).map(make_node).collect();
        for node in &nodes {
            engine.register_node(node.clone()).unwrap();
        }
        for node in &nodes {
            engine.ping_node(node).unwrap();
        }
        assert_eq!(
            engine.ping_node(&make_node(9)),
            Err(EngineError::UnknownNode("10.0.0.9:4150".to_string()))
        );
    }

    #[test]
    fn test_register_topics() {
        let engine = test_engine();
        let nodes: Vec<_> = (1..=3).map(make_node).collect();
        let topics: [&[&str]; 3] = [&["A"], &["A", "B", "C"], &[]];

        for node in &nodes {
            engine.register_node(node.clone()).unwrap();
        }
        for (node, topics) in nodes.iter().zip(topics) {
            for topic in topics {
                engine.register_topic(node, topic).unwrap();
            }
        }

        check_equal_nodes(
            vec![nodes[0].clone(), nodes[1].clone()],
            engine.lookup_producers("A").unwrap(),
        );
        check_equal_nodes(vec![nodes[1].clone()], engine.lookup_producers("B").unwrap());
        check_equal_nodes(vec![nodes[1].clone()], engine.lookup_producers("C").unwrap());
        assert!(engine.lookup_producers("D").unwrap().is_empty());
        check_equal_strings(&["A", "B", "C"], engine.lookup_topics().unwrap());
    }

    #[test]
    fn test_register_topic_on_unknown_node_fails() {
        let engine = test_engine();
        assert!(matches!(
            engine.register_topic(&make_node(1), "A"),
            Err(EngineError::UnknownNode(_))
        ));
        assert!(matches!(
            engine.register_channel(&make_node(1), "A", "1"),
            Err(EngineError::UnknownNode(_))
        ));
        assert!(matches!(
            engine.tombstone_topic(&make_node(1), "A"),
            Err(EngineError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_unregister_topics() {
        let engine = test_engine();
        let nodes: Vec<_> = (1..=3).map(make_node).collect();
        let topics: [&[&str]; 3] = [&["A"], &["A", "B", "C"], &[]];

        for node in &nodes {
            engine.register_node(node.clone()).unwrap();
        }
        for (node, topics) in nodes.iter().zip(topics) {
            for topic in topics {
                engine.register_topic(node, topic).unwrap();
            }
        }
        // Includes node 3, which never registered A: still a no-op success.
        for node in &nodes {
            engine.unregister_topic(node, "A").unwrap();
        }

        assert!(engine.lookup_producers("A").unwrap().is_empty());
        check_equal_nodes(vec![nodes[1].clone()], engine.lookup_producers("B").unwrap());
        check_equal_nodes(vec![nodes[1].clone()], engine.lookup_producers("C").unwrap());
        check_equal_strings(&["B", "C"], engine.lookup_topics().unwrap());
    }

    #[test]
    fn test_tombstone_topic_bracket() {
        let engine = test_engine();
        let nodes: Vec<_> = (1..=3).map(make_node).collect();
        let topics: [&[&str]; 3] = [&["A"], &["A", "B", "C"], &[]];

        for node in &nodes {
            engine.register_node(node.clone()).unwrap();
        }
        for (node, topics) in nodes.iter().zip(topics) {
            for topic in topics {
                engine.register_topic(node, topic).unwrap();
            }
        }
        for node in &nodes {
            engine.tombstone_topic(node, "A").unwrap();
        }

        // Inside the tombstone window: A is hidden everywhere.
        assert!(engine.lookup_producers("A").unwrap().is_empty());
        check_equal_nodes(vec![nodes[1].clone()], engine.lookup_producers("B").unwrap());
        check_equal_nodes(vec![nodes[1].clone()], engine.lookup_producers("C").unwrap());
        check_equal_strings(&["B", "C"], engine.lookup_topics().unwrap());

        std::thread::sleep(TOMB_TIMEOUT * 2);

        // Expired: everything restored, nothing else disturbed.
        check_equal_nodes(
            vec![nodes[0].clone(), nodes[1].clone()],
            engine.lookup_producers("A").unwrap(),
        );
        check_equal_nodes(vec![nodes[1].clone()], engine.lookup_producers("B").unwrap());
        check_equal_nodes(vec![nodes[1].clone()], engine.lookup_producers("C").unwrap());
        check_equal_strings(&["A", "B", "C"], engine.lookup_topics().unwrap());
    }

    #[test]
    fn test_register_channels() {
        let engine = test_engine();
        let nodes: Vec<_> = (1..=3).map(make_node).collect();
        let channels: [&[&str]; 3] = [&["1"], &["1", "2", "3"], &[]];

        for node in &nodes {
            engine.register_node(node.clone()).unwrap();
        }
        for (node, channels) in nodes.iter().zip(channels) {
            for channel in channels {
                engine.register_channel(node, "A", channel).unwrap();
            }
        }

        check_equal_strings(&["1", "2", "3"], engine.lookup_channels("A").unwrap());
        // Channel registration implicitly registered the topic.
        check_equal_strings(&["A"], engine.lookup_topics().unwrap());
        assert_eq!(
            engine.lookup_channels("missing"),
            Err(EngineError::UnknownTopic("missing".to_string()))
        );
    }

    #[test]
    fn test_unregister_channels() {
        let engine = test_engine();
        let nodes: Vec<_> = (1..=3).map(make_node).collect();
        let channels: [&[&str]; 3] = [&["1"], &["1", "2", "3"], &[]];

        for node in &nodes {
            engine.register_node(node.clone()).unwrap();
        }
        for (node, channels) in nodes.iter().zip(channels) {
            for channel in channels {
                engine.register_channel(node, "A", channel).unwrap();
            }
        }
        for node in &nodes {
            engine.unregister_channel(node, "A", "1").unwrap();
        }

        check_equal_strings(&["2", "3"], engine.lookup_channels("A").unwrap());
        // The topic registration survives channel removal, even the last.
        for node in &nodes[..2] {
            engine.unregister_channel(node, "A", "2").unwrap();
            engine.unregister_channel(node, "A", "3").unwrap();
        }
        assert!(engine.lookup_channels("A").unwrap().is_empty());
        check_equal_strings(&["A"], engine.lookup_topics().unwrap());
    }

    #[test]
    fn test_node_expiry_and_ping_resurrection() {
        let engine = LocalEngine::new(LocalConfig {
            node_timeout: Duration::from_millis(50),
            tombstone_timeout: TOMB_TIMEOUT,
            sweep_interval: Some(Duration::from_secs(3600)),
        });
        let node = make_node(1);
        engine.register_node(node.clone()).unwrap();
        engine.register_topic(&node, "A").unwrap();

        std::thread::sleep(Duration::from_millis(120));

        // Expired: invisible to every lookup.
        assert!(engine.lookup_nodes().unwrap().is_empty());
        assert!(engine.lookup_producers("A").unwrap().is_empty());
        assert!(engine.lookup_topics().unwrap().is_empty());

        // Not yet swept: a ping resurrects it, registrations intact.
        engine.ping_node(&node).unwrap();
        check_equal_nodes(vec![node.clone()], engine.lookup_nodes().unwrap());
        check_equal_nodes(vec![node], engine.lookup_producers("A").unwrap());
    }

    #[test]
    fn test_ping_fails_after_sweep() {
        let engine = LocalEngine::new(LocalConfig {
            node_timeout: Duration::from_millis(20),
            tombstone_timeout: TOMB_TIMEOUT,
            sweep_interval: Some(Duration::from_millis(10)),
        });
        let node = make_node(1);
        engine.register_node(node.clone()).unwrap();

        std::thread::sleep(Duration::from_millis(100));

        assert!(matches!(
            engine.ping_node(&node),
            Err(EngineError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_concurrent_mutation_and_query() {
        let engine = Arc::new(test_engine());
        let mut handles = Vec::new();
        for t in 0..4 {
            let engine = Arc::clone(&engine);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    let node = make_node(t * 50 + i);
                    engine.register_node(node.clone()).unwrap();
                    engine.register_topic(&node, "A").unwrap();
                    engine.ping_node(&node).unwrap();
                    engine.lookup_nodes().unwrap();
                    engine.lookup_producers("A").unwrap();
                    if i % 2 == 0 {
                        engine.unregister_node(&node).unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(engine.lookup_nodes().unwrap().len(), 100);
    }

    #[test]
    fn test_reads_return_copies() {
        let engine = test_engine();
        let node = make_node(1);
        engine.register_node(node.clone()).unwrap();

        let mut snapshot = engine.lookup_nodes().unwrap();
        snapshot[0].hostname = "mutated".to_string();

        assert_eq!(engine.lookup_nodes().unwrap()[0].hostname, "host-1");
    }
}
