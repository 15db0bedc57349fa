//! In-process mock broker for integration tests.
//!
//! Speaks enough of the protocol to exercise producers and consumers end
//! to end: IDENTIFY negotiation, SUB/RDY dispatch with credit accounting,
//! PUB/MPUB queuing, FIN/REQ/TOUCH bookkeeping, and CLS teardown. One
//! subscriber per topic, which is all the tests need.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

struct Subscriber {
    sock: TcpStream,
    rdy: i64,
}

#[derive(Default)]
struct TopicState {
    queue: VecDeque<Vec<u8>>,
    sub: Option<Subscriber>,
}

struct BrokerState {
    topics: Mutex<HashMap<String, TopicState>>,
    published: Mutex<Vec<Vec<u8>>>,
    finished: Mutex<Vec<String>>,
    requeued: Mutex<Vec<(String, u64)>>,
    touched: Mutex<Vec<String>>,
    next_id: AtomicU64,
    stopping: AtomicBool,
}

pub struct MockBroker {
    addr: String,
    state: Arc<BrokerState>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl MockBroker {
    pub fn start() -> MockBroker {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock broker");
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(BrokerState {
            topics: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            requeued: Mutex::new(Vec::new()),
            touched: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
        });

        let accept = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                for sock in listener.incoming() {
                    if state.stopping.load(Ordering::SeqCst) {
                        return;
                    }
                    let Ok(sock) = sock else { return };
                    let state = Arc::clone(&state);
                    thread::spawn(move || serve_conn(&state, sock));
                }
            })
        };

        MockBroker {
            addr,
            state,
            accept: Mutex::new(Some(accept)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Bodies received via PUB/MPUB, in arrival order.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.state.published.lock().unwrap().clone()
    }

    /// Message ids acknowledged with FIN.
    pub fn finished(&self) -> Vec<String> {
        self.state.finished.lock().unwrap().clone()
    }

    /// `(id, delay_ms)` pairs received via REQ.
    pub fn requeued(&self) -> Vec<(String, u64)> {
        self.state.requeued.lock().unwrap().clone()
    }

    /// Message ids received via TOUCH.
    pub fn touched(&self) -> Vec<String> {
        self.state.touched.lock().unwrap().clone()
    }

    pub fn stop(&self) {
        self.state.stopping.store(true, Ordering::SeqCst);
        // Nudge the accept loop awake.
        TcpStream::connect(&self.addr).ok();
        if let Some(handle) = self.accept.lock().unwrap().take() {
            handle.join().ok();
        }
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─── Connection serving ─────────────────────────────────────────────────────

fn serve_conn(state: &Arc<BrokerState>, mut sock: TcpStream) {
    let mut magic = [0u8; 4];
    if sock.read_exact(&mut magic).is_err() || &magic != b"  V2" {
        return;
    }

    let mut subscribed: Option<String> = None;
    loop {
        let line = match read_line(&mut sock) {
            Ok(Some(line)) => line,
            _ => break,
        };
        let mut parts = line.split(' ');
        let verb = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        let ok = match verb {
            "IDENTIFY" => handle_identify(&mut sock),
            "SUB" => handle_sub(state, &mut sock, &args, &mut subscribed),
            "RDY" => handle_rdy(state, &args, subscribed.as_deref()),
            "PUB" => handle_pub(state, &mut sock, &args),
            "MPUB" => handle_mpub(state, &mut sock, &args),
            "FIN" => {
                record(&state.finished, &args);
                true
            }
            "REQ" => {
                if let (Some(id), Some(ms)) = (args.first(), args.get(1)) {
                    let ms = ms.parse().unwrap_or(0);
                    state
                        .requeued
                        .lock()
                        .unwrap()
                        .push((id.to_string(), ms));
                }
                true
            }
            "TOUCH" => {
                record(&state.touched, &args);
                true
            }
            "CLS" => {
                // Stop delivering, but keep reading: the client may still
                // FIN/REQ messages it holds before closing its end.
                if let Some(topic) = subscribed.take() {
                    if let Some(ts) = state.topics.lock().unwrap().get_mut(&topic) {
                        ts.sub = None;
                    }
                }
                write_response(&mut sock, "CLOSE_WAIT").is_ok()
            }
            "NOP" => true,
            _ => {
                write_error(&mut sock, "E_INVALID unknown command").ok();
                false
            }
        };
        if !ok {
            break;
        }
    }

    if let Some(topic) = subscribed {
        if let Some(ts) = state.topics.lock().unwrap().get_mut(&topic) {
            ts.sub = None;
        }
    }
}

fn handle_identify(sock: &mut TcpStream) -> bool {
    if read_body(sock).is_err() {
        return false;
    }
    write_response(sock, r#"{"max_rdy_count":2500}"#).is_ok()
}

fn handle_sub(
    state: &Arc<BrokerState>,
    sock: &mut TcpStream,
    args: &[&str],
    subscribed: &mut Option<String>,
) -> bool {
    let Some(topic) = args.first() else {
        return false;
    };
    let Ok(clone) = sock.try_clone() else {
        return false;
    };
    if write_response(sock, "OK").is_err() {
        return false;
    }
    let mut topics = state.topics.lock().unwrap();
    topics.entry(topic.to_string()).or_default().sub = Some(Subscriber {
        sock: clone,
        rdy: 0,
    });
    *subscribed = Some(topic.to_string());
    true
}

fn handle_rdy(state: &Arc<BrokerState>, args: &[&str], subscribed: Option<&str>) -> bool {
    let Some(topic) = subscribed else {
        return true;
    };
    let count: i64 = args.first().and_then(|c| c.parse().ok()).unwrap_or(0);
    let mut topics = state.topics.lock().unwrap();
    if let Some(ts) = topics.get_mut(topic) {
        if let Some(sub) = &mut ts.sub {
            sub.rdy = count;
        }
        flush_topic(&state.next_id, ts);
    }
    true
}

fn handle_pub(state: &Arc<BrokerState>, sock: &mut TcpStream, args: &[&str]) -> bool {
    let Some(topic) = args.first() else {
        return false;
    };
    let Ok(body) = read_body(sock) else {
        return false;
    };
    publish(state, topic, vec![body]);
    write_response(sock, "OK").is_ok()
}

fn handle_mpub(state: &Arc<BrokerState>, sock: &mut TcpStream, args: &[&str]) -> bool {
    let Some(topic) = args.first() else {
        return false;
    };
    let Ok(batch) = read_body(sock) else {
        return false;
    };
    if batch.len() < 4 {
        return false;
    }
    let count = u32::from_be_bytes(batch[0..4].try_into().unwrap()) as usize;
    let mut bodies = Vec::with_capacity(count);
    let mut offset = 4;
    for _ in 0..count {
        if batch.len() < offset + 4 {
            return false;
        }
        let len = u32::from_be_bytes(batch[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        if batch.len() < offset + len {
            return false;
        }
        bodies.push(batch[offset..offset + len].to_vec());
        offset += len;
    }
    publish(state, topic, bodies);
    write_response(sock, "OK").is_ok()
}

fn publish(state: &Arc<BrokerState>, topic: &str, bodies: Vec<Vec<u8>>) {
    let mut topics = state.topics.lock().unwrap();
    let ts = topics.entry(topic.to_string()).or_default();
    for body in bodies {
        state.published.lock().unwrap().push(body.clone());
        ts.queue.push_back(body);
    }
    flush_topic(&state.next_id, ts);
}

/// Deliver queued messages while the subscriber has credit. Always called
/// with the topics lock held, which serializes writes to the subscriber
/// socket.
fn flush_topic(next_id: &AtomicU64, ts: &mut TopicState) {
    while ts.queue.front().is_some() {
        let Some(sub) = &mut ts.sub else { return };
        if sub.rdy <= 0 {
            return;
        }
        let body = ts.queue.pop_front().unwrap();
        let n = next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{n:016x}");
        if write_message(&mut sub.sock, id.as_bytes(), &body).is_err() {
            ts.queue.push_front(body);
            ts.sub = None;
            return;
        }
        sub.rdy -= 1;
    }
}

// ─── Wire helpers ───────────────────────────────────────────────────────────

fn read_line(sock: &mut TcpStream) -> io::Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match sock.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && line.is_empty() => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        }
        if byte[0] == b'\n' {
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        line.push(byte[0]);
    }
}

fn read_body(sock: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut size = [0u8; 4];
    sock.read_exact(&mut size)?;
    let mut body = vec![0u8; u32::from_be_bytes(size) as usize];
    sock.read_exact(&mut body)?;
    Ok(body)
}

fn write_frame(sock: &mut TcpStream, frame_type: u32, payload: &[u8]) -> io::Result<()> {
    sock.write_all(&((payload.len() as u32 + 4).to_be_bytes()))?;
    sock.write_all(&frame_type.to_be_bytes())?;
    sock.write_all(payload)?;
    sock.flush()
}

pub fn write_response(sock: &mut TcpStream, text: &str) -> io::Result<()> {
    write_frame(sock, 0, text.as_bytes())
}

pub fn write_error(sock: &mut TcpStream, text: &str) -> io::Result<()> {
    write_frame(sock, 1, text.as_bytes())
}

pub fn write_message(sock: &mut TcpStream, id: &[u8], body: &[u8]) -> io::Result<()> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    let mut payload = Vec::with_capacity(26 + body.len());
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload.extend_from_slice(&1u16.to_be_bytes());
    payload.extend_from_slice(&id[..16]);
    payload.extend_from_slice(body);
    write_frame(sock, 2, &payload)
}

fn record(store: &Mutex<Vec<String>>, args: &[&str]) {
    if let Some(id) = args.first() {
        store.lock().unwrap().push(id.to_string());
    }
}
