//! Subscription pool.
//!
//! A [`Consumer`] subscribes to one `(topic, channel)` pair across every
//! broker currently advertising the topic, whether from a static address
//! list, a set of lookup directories, or both. A supervisor thread reconciles the live
//! connection set against the discovered broker set on a fixed interval and
//! watches heartbeat liveness; one reader thread per connection decodes
//! frames and pushes messages through a bounded channel, which is the
//! backpressure boundary: a slow caller stalls the readers, not the
//! process.
//!
//! Completion (`finish`/`requeue`/`touch`) happens through the handle each
//! [`Message`] carries; RDY credit is refilled from both the delivery and
//! completion paths, so credit recovers as fast as the caller works.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::command::Command;
use crate::conn::{ConnShared, Connection, TlsSettings};
use crate::constants::{
    DEFAULT_RECONCILE_INTERVAL, HEARTBEAT_INTERVAL, RESPONSE_CLOSE_WAIT, RESPONSE_HEARTBEAT,
    RESPONSE_OK,
};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::identify::Identify;
use crate::lookup::{LookupClient, LookupConfig};
use crate::message::Message;

/// How long a closing connection may drain before its socket is forced
/// shut.
const CLOSE_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Supervisor wake-up ceiling; reconciliation and liveness checks run on
/// this cadence or faster.
const SUPERVISOR_TICK: Duration = Duration::from_secs(1);

/// Consumer configuration. `topic`, `channel`, and at least one broker
/// source (`addresses` or `lookup`) are required.
#[derive(Debug, Clone, Default)]
pub struct ConsumerConfig {
    /// Topic to subscribe to.
    pub topic: String,
    /// Channel to join on that topic.
    pub channel: String,
    /// Static broker `host:port` addresses.
    pub addresses: Vec<String>,
    /// Lookup directory HTTP endpoints to discover brokers from.
    pub lookup: Vec<String>,
    /// Ceiling on unacknowledged deliveries per connection; 0 means 1.
    /// Also clamps the negotiated RDY count.
    pub max_in_flight: usize,
    /// IDENTIFY options sent on each connection.
    pub identify: Identify,
    /// TLS material, used when `identify.tls_v1` is set.
    pub tls: Option<TlsSettings>,
    /// Secret presented if the server requires AUTH.
    pub auth_secret: Option<String>,
    /// Interval between broker-set reconciliations; zero means 15 s.
    pub reconcile_interval: Duration,
    /// Outbound message queue capacity; zero sizes it to `max_in_flight`.
    pub queue_capacity: usize,
}

struct BrokerLink {
    conn: Arc<ConnShared>,
    reader: JoinHandle<()>,
    failed: Arc<AtomicBool>,
}

/// A connection being retired: `CLS` sent, draining until the server
/// closes or the grace period forces it.
struct Draining {
    conn: Arc<ConnShared>,
    reader: JoinHandle<()>,
    deadline: Instant,
}

struct ConsumerShared {
    config: ConsumerConfig,
    lookup: Option<LookupClient>,
    conns: Mutex<HashMap<String, BrokerLink>>,
    draining: Mutex<Vec<Draining>>,
    messages_tx: Sender<Message>,
    stopping: AtomicBool,
}

/// Pool of subscriptions for one `(topic, channel)` pair.
pub struct Consumer {
    shared: Arc<ConsumerShared>,
    messages_rx: Receiver<Message>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    stopped: AtomicBool,
}

impl Consumer {
    /// Start the consumer. Connections come up asynchronously on the first
    /// reconciliation pass, which runs immediately.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for a missing topic, channel, or broker source.
    pub fn start(config: ConsumerConfig) -> Result<Consumer> {
        if config.topic.is_empty() {
            return Err(Error::Config("consumer topic is required".to_string()));
        }
        if config.channel.is_empty() {
            return Err(Error::Config("consumer channel is required".to_string()));
        }
        if config.addresses.is_empty() && config.lookup.is_empty() {
            return Err(Error::Config(
                "consumer needs broker addresses or lookup endpoints".to_string(),
            ));
        }

        let lookup = if config.lookup.is_empty() {
            None
        } else {
            Some(LookupClient::start(LookupConfig {
                endpoints: config.lookup.clone(),
                topic: config.topic.clone(),
                poll_interval: Duration::ZERO,
            })?)
        };

        let capacity = if config.queue_capacity > 0 {
            config.queue_capacity
        } else {
            config.max_in_flight.max(1)
        };
        let (messages_tx, messages_rx) = bounded(capacity);
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();

        let shared = Arc::new(ConsumerShared {
            config,
            lookup,
            conns: Mutex::new(HashMap::new()),
            draining: Mutex::new(Vec::new()),
            messages_tx,
            stopping: AtomicBool::new(false),
        });

        let supervisor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("nsq-consumer-supervisor".to_string())
                .spawn(move || supervisor_loop(&shared, &shutdown_rx))
                .map_err(Error::Io)?
        };

        Ok(Consumer {
            shared,
            messages_rx,
            supervisor: Mutex::new(Some(supervisor)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            stopped: AtomicBool::new(false),
        })
    }

    /// The delivery channel. Receiving blocks until a message arrives;
    /// the channel ends when the consumer stops.
    pub fn messages(&self) -> &Receiver<Message> {
        &self.messages_rx
    }

    /// Shut down: `CLS` every connection, requeue messages still queued
    /// for delivery (delay 0), close the sockets, and join all threads.
    /// Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shutdown_tx.lock().unwrap().take();

        let links: Vec<BrokerLink> = {
            let mut conns = self.shared.conns.lock().unwrap();
            conns.drain().map(|(_, link)| link).collect()
        };
        for link in &links {
            link.conn.write_command(&Command::Cls).ok();
        }

        // Hand back whatever was delivered to the queue but never consumed.
        // Nothing new arrives after CLOSE_WAIT, so once the queue is empty
        // and no deliveries are outstanding there is nothing left to drain.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match self.messages_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(msg) => {
                    msg.requeue(Duration::ZERO).ok();
                }
                Err(_) => {
                    let readers_done = links.iter().all(|l| l.reader.is_finished());
                    let quiescent = self.messages_rx.is_empty()
                        && links.iter().all(|l| l.conn.in_flight() == 0);
                    if readers_done || quiescent || Instant::now() >= deadline {
                        break;
                    }
                }
            }
        }

        for link in &links {
            link.conn.close();
        }
        // Keep draining while readers wind down; one may still be parked on
        // a full queue and needs its send accepted before it can observe
        // the close.
        while !links.iter().all(|l| l.reader.is_finished()) {
            if let Ok(msg) = self.messages_rx.recv_timeout(Duration::from_millis(10)) {
                msg.requeue(Duration::ZERO).ok();
            }
        }
        for link in links {
            link.reader.join().ok();
        }

        let draining: Vec<Draining> = self.shared.draining.lock().unwrap().drain(..).collect();
        for d in &draining {
            d.conn.close();
        }
        for d in draining {
            d.reader.join().ok();
        }

        if let Some(handle) = self.supervisor.lock().unwrap().take() {
            handle.join().ok();
        }

        // The supervisor may have opened a connection between our drain and
        // its own shutdown; retire any straggler the same way.
        let stragglers: Vec<BrokerLink> = {
            let mut conns = self.shared.conns.lock().unwrap();
            conns.drain().map(|(_, link)| link).collect()
        };
        for link in &stragglers {
            link.conn.write_command(&Command::Cls).ok();
            link.conn.close();
        }
        while !stragglers.iter().all(|l| l.reader.is_finished()) {
            if let Ok(msg) = self.messages_rx.recv_timeout(Duration::from_millis(10)) {
                msg.requeue(Duration::ZERO).ok();
            }
        }
        for link in stragglers {
            link.reader.join().ok();
        }

        if let Some(lookup) = &self.shared.lookup {
            lookup.stop();
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("topic", &self.shared.config.topic)
            .field("channel", &self.shared.config.channel)
            .field("connections", &self.shared.conns.lock().unwrap().len())
            .finish()
    }
}

// ─── Supervisor ─────────────────────────────────────────────────────────────

fn supervisor_loop(shared: &Arc<ConsumerShared>, shutdown: &Receiver<()>) {
    let interval = if shared.config.reconcile_interval.is_zero() {
        DEFAULT_RECONCILE_INTERVAL
    } else {
        shared.config.reconcile_interval
    };
    let tick = interval.min(SUPERVISOR_TICK);
    // Prime discovery so the first reconciliation sees a broker set.
    if let Some(lookup) = &shared.lookup {
        lookup.poll_once();
    }
    // Backdated so the first tick reconciles immediately.
    let mut last_reconcile = Instant::now() - interval;

    loop {
        reap_failed(shared);
        enforce_drain_deadlines(shared);

        if last_reconcile.elapsed() >= interval && !shared.stopping.load(Ordering::SeqCst) {
            last_reconcile = Instant::now();
            reconcile(shared);
        }

        match shutdown.recv_timeout(tick) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => return,
        }
    }
}

/// Drop connections whose reader exited or whose heartbeats went silent
/// for two full intervals. The broker stays eligible for re-adding on the
/// next reconciliation.
fn reap_failed(shared: &Arc<ConsumerShared>) {
    let mut conns = shared.conns.lock().unwrap();
    let mut dead = Vec::new();
    for (addr, link) in conns.iter() {
        if link.failed.load(Ordering::SeqCst) {
            log::info!("[consumer] connection to {addr} ended");
            dead.push(addr.clone());
        } else if link.conn.idle_for() > HEARTBEAT_INTERVAL * 2 {
            log::warn!("[consumer] {addr} missed two heartbeats, dropping connection");
            link.conn.close();
            dead.push(addr.clone());
        }
    }
    drop(conns);

    for addr in dead {
        if let Some(link) = shared.conns.lock().unwrap().remove(&addr) {
            link.conn.close();
            shared.draining.lock().unwrap().push(Draining {
                conn: link.conn,
                reader: link.reader,
                deadline: Instant::now(),
            });
        }
    }
}

/// Force-close retiring connections whose drain grace expired, and forget
/// the ones whose reader already finished.
fn enforce_drain_deadlines(shared: &Arc<ConsumerShared>) {
    let mut draining = shared.draining.lock().unwrap();
    for d in draining.iter() {
        if Instant::now() >= d.deadline {
            d.conn.close();
        }
    }
    draining.retain(|d| !d.reader.is_finished());
}

/// Diff the desired broker set against live connections; open what is
/// missing, retire what is gone.
fn reconcile(shared: &Arc<ConsumerShared>) {
    let mut targets: HashSet<String> = shared.config.addresses.iter().cloned().collect();
    if let Some(lookup) = &shared.lookup {
        for node in lookup.nodes() {
            targets.insert(node.tcp_address());
        }
    }

    let current: HashSet<String> = shared.conns.lock().unwrap().keys().cloned().collect();

    for addr in current.difference(&targets) {
        if let Some(link) = shared.conns.lock().unwrap().remove(addr) {
            log::info!("[consumer] {addr} no longer advertised, closing");
            link.conn.write_command(&Command::Cls).ok();
            shared.draining.lock().unwrap().push(Draining {
                conn: link.conn,
                reader: link.reader,
                deadline: Instant::now() + CLOSE_DRAIN_GRACE,
            });
        }
    }

    for addr in targets.difference(&current) {
        match connect_broker(shared, addr) {
            Ok(link) => {
                log::info!("[consumer] subscribed to {addr}");
                shared.conns.lock().unwrap().insert(addr.clone(), link);
            }
            Err(e) => {
                log::warn!("[consumer] connect {addr} failed: {e}");
            }
        }
    }
}

/// Open, identify, subscribe, and grant initial credit on one broker.
fn connect_broker(shared: &Arc<ConsumerShared>, addr: &str) -> Result<BrokerLink> {
    let config = &shared.config;
    let mut conn = Connection::connect(
        addr,
        &config.identify,
        config.tls.as_ref(),
        config.auth_secret.as_deref(),
    )?;

    conn.write_command(&Command::Sub {
        topic: config.topic.clone(),
        channel: config.channel.clone(),
    })?;
    loop {
        match conn.read_frame()? {
            Frame::Response(s) if s == RESPONSE_OK => break,
            Frame::Response(s) if s == RESPONSE_HEARTBEAT => {
                conn.write_command(&Command::Nop)?;
            }
            Frame::Response(_) => {}
            Frame::Error(e) => return Err(Error::Server(e)),
            Frame::Message(_) => {
                return Err(Error::Handshake(
                    "message frame before subscribe ack".to_string(),
                ))
            }
        }
    }

    let max_rdy = conn
        .identify_response()
        .max_rdy_count
        .min(config.max_in_flight.max(1) as u32)
        .max(1);
    conn.shared().set_max_rdy(max_rdy);
    conn.write_command(&Command::Rdy { count: max_rdy })?;
    conn.shared().note_rdy(max_rdy);

    let failed = Arc::new(AtomicBool::new(false));
    let conn_shared = Arc::clone(conn.shared());
    let reader = {
        let tx = shared.messages_tx.clone();
        let failed = Arc::clone(&failed);
        let addr = addr.to_string();
        thread::Builder::new()
            .name(format!("nsq-consumer-{addr}"))
            .spawn(move || {
                reader_loop(conn, &tx, &addr);
                failed.store(true, Ordering::SeqCst);
            })
            .map_err(Error::Io)?
    };

    Ok(BrokerLink {
        conn: conn_shared,
        reader,
        failed,
    })
}

// ─── Reader ─────────────────────────────────────────────────────────────────

fn reader_loop(mut conn: Connection, tx: &Sender<Message>, addr: &str) {
    loop {
        match conn.read_frame() {
            Ok(Frame::Message(msg)) => {
                // Blocking send: the bounded queue is the backpressure
                // boundary when the caller falls behind.
                if tx.send(msg).is_err() {
                    break;
                }
                conn.shared().maybe_refill().ok();
            }
            Ok(Frame::Response(s)) if s == RESPONSE_HEARTBEAT => {
                if conn.write_command(&Command::Nop).is_err() {
                    break;
                }
            }
            Ok(Frame::Response(s)) if s == RESPONSE_CLOSE_WAIT => {
                log::debug!("[consumer] {addr} acknowledged close, draining");
            }
            Ok(Frame::Response(s)) => {
                log::debug!("[consumer] {addr} response {s:?}");
            }
            Ok(Frame::Error(e)) => {
                log::warn!("[consumer] {addr} server error: {e}");
                if e.is_fatal() {
                    break;
                }
            }
            Err(e) => {
                if !matches!(e, Error::Closed) {
                    log::debug!("[consumer] {addr} read ended: {e}");
                }
                break;
            }
        }
    }
    conn.close();
}
