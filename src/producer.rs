//! Publish pool.
//!
//! A [`Producer`] holds up to `max_concurrency` connections to a single
//! broker, each driven by a worker thread. Callers enqueue publish requests
//! onto an unbounded channel; workers pair each request with the next
//! response frame on their own connection, so responses never cross
//! requests. A worker whose connection dies reports the failed request,
//! reconnects with capped exponential backoff, and rejoins the pool while
//! the other workers keep serving.
//!
//! Ordering holds per worker (FIFO on one connection); nothing is promised
//! across connections.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::command::Command;
use crate::conn::{Connection, TlsSettings};
use crate::constants::{
    RECONNECT_BACKOFF_BASE, RECONNECT_BACKOFF_MAX, RESPONSE_HEARTBEAT, RESPONSE_OK,
};
use crate::error::{Error, Result};
use crate::identify::Identify;

/// Producer configuration. `address` and `topic` are required.
#[derive(Debug, Clone, Default)]
pub struct ProducerConfig {
    /// Broker `host:port` to publish to.
    pub address: String,
    /// Topic every publish goes to.
    pub topic: String,
    /// Number of pooled connections; 0 means 1.
    pub max_concurrency: usize,
    /// IDENTIFY options sent on each connection.
    pub identify: Identify,
    /// TLS material, used when `identify.tls_v1` is set.
    pub tls: Option<TlsSettings>,
    /// Secret presented if the server requires AUTH.
    pub auth_secret: Option<String>,
    /// Bound on the wait for a publish response, measured from enqueue.
    /// Expiry abandons the wait; a request already on the wire is not
    /// recalled.
    pub publish_timeout: Option<Duration>,
}

enum Payload {
    Single(Vec<u8>),
    Batch(Vec<Vec<u8>>),
}

struct Request {
    payload: Payload,
    reply: Sender<Result<()>>,
}

/// Pool of publish connections to one broker.
pub struct Producer {
    requests_tx: Mutex<Option<Sender<Request>>>,
    requests_rx: Receiver<Request>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    publish_timeout: Option<Duration>,
}

impl Producer {
    /// Spin up the worker pool. Connections are established lazily by the
    /// workers, so a downed broker delays publishes rather than failing
    /// startup.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when `address` or `topic` is empty.
    pub fn start(config: ProducerConfig) -> Result<Producer> {
        if config.address.is_empty() {
            return Err(Error::Config("producer address is required".to_string()));
        }
        if config.topic.is_empty() {
            return Err(Error::Config("producer topic is required".to_string()));
        }

        let concurrency = config.max_concurrency.max(1);
        let (requests_tx, requests_rx) = unbounded::<Request>();
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        let config = Arc::new(config);

        let mut workers = Vec::with_capacity(concurrency);
        for i in 0..concurrency {
            let config = Arc::clone(&config);
            let requests = requests_rx.clone();
            let shutdown = shutdown_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("nsq-producer-{i}"))
                .spawn(move || worker_loop(&config, &requests, &shutdown))
                .map_err(Error::Io)?;
            workers.push(handle);
        }

        Ok(Producer {
            requests_tx: Mutex::new(Some(requests_tx)),
            requests_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            workers: Mutex::new(workers),
            publish_timeout: config.publish_timeout,
        })
    }

    /// Publish one message, blocking until a worker has a response for it.
    ///
    /// # Errors
    ///
    /// The exact server `E_*` code on rejection, the transport error if the
    /// serving connection died mid-request, [`Error::PublishTimeout`] when
    /// the configured wait expires, or [`Error::Stopped`] after `stop()`.
    pub fn publish(&self, body: impl Into<Vec<u8>>) -> Result<()> {
        self.submit(Payload::Single(body.into()))
    }

    /// Publish a batch atomically via `MPUB`. Same dispatch, pairing, and
    /// retry behavior as [`publish`].
    ///
    /// [`publish`]: Producer::publish
    pub fn multi_publish(&self, bodies: Vec<Vec<u8>>) -> Result<()> {
        self.submit(Payload::Batch(bodies))
    }

    fn submit(&self, payload: Payload) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        {
            let guard = self.requests_tx.lock().unwrap();
            let tx = guard.as_ref().ok_or(Error::Stopped)?;
            tx.send(Request {
                payload,
                reply: reply_tx,
            })
            .map_err(|_| Error::Stopped)?;
        }

        match self.publish_timeout {
            Some(timeout) => match reply_rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(Error::PublishTimeout),
                Err(RecvTimeoutError::Disconnected) => Err(Error::Stopped),
            },
            None => reply_rx.recv().map_err(|_| Error::Stopped)?,
        }
    }

    /// Shut the pool down: close the request channel, let workers drain
    /// what is already queued, and block until every worker has exited.
    /// Requests no worker could serve fail with [`Error::Stopped`].
    /// Idempotent.
    pub fn stop(&self) {
        self.requests_tx.lock().unwrap().take();
        // Separate signal so workers parked in reconnect backoff leave
        // immediately instead of sleeping it out.
        self.shutdown_tx.lock().unwrap().take();

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in workers {
            handle.join().ok();
        }

        for request in self.requests_rx.try_iter() {
            request.reply.send(Err(Error::Stopped)).ok();
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("stopped", &self.requests_tx.lock().unwrap().is_none())
            .finish()
    }
}

fn worker_loop(config: &ProducerConfig, requests: &Receiver<Request>, shutdown: &Receiver<()>) {
    let mut backoff = RECONNECT_BACKOFF_BASE;
    loop {
        let mut conn = match Connection::connect(
            &config.address,
            &config.identify,
            config.tls.as_ref(),
            config.auth_secret.as_deref(),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("[producer] connect {} failed: {e}", config.address);
                match shutdown.recv_timeout(backoff) {
                    Err(RecvTimeoutError::Timeout) => {
                        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                        continue;
                    }
                    // Stop requested; leftovers are failed by stop().
                    _ => return,
                }
            }
        };
        log::debug!("[producer] connected to {}", config.address);
        backoff = RECONNECT_BACKOFF_BASE;

        loop {
            let Request { payload, reply } = match requests.recv() {
                Ok(request) => request,
                Err(_) => {
                    // Channel closed and drained: clean exit.
                    conn.close();
                    return;
                }
            };

            let result = serve_request(&mut conn, &config.topic, payload);
            let fatal = result
                .as_ref()
                .err()
                .is_some_and(Error::is_connection_fatal);
            reply.send(result).ok();

            if fatal {
                log::warn!("[producer] connection to {} lost, reconnecting", config.address);
                conn.close();
                break;
            }
        }
    }
}

/// Write one publish command and block for its response, answering any
/// heartbeats that interleave.
fn serve_request(conn: &mut Connection, topic: &str, payload: Payload) -> Result<()> {
    let command = match payload {
        Payload::Single(body) => Command::Pub {
            topic: topic.to_string(),
            body,
        },
        Payload::Batch(bodies) => Command::Mpub {
            topic: topic.to_string(),
            bodies,
        },
    };
    conn.write_command(&command)?;

    loop {
        match conn.read_frame()? {
            crate::frame::Frame::Response(s) if s == RESPONSE_OK => return Ok(()),
            crate::frame::Frame::Response(s) if s == RESPONSE_HEARTBEAT => {
                conn.write_command(&Command::Nop)?;
            }
            crate::frame::Frame::Response(s) => {
                log::debug!("[producer] ignoring response {s:?}");
            }
            crate::frame::Frame::Error(e) => return Err(Error::Server(e)),
            crate::frame::Frame::Message(_) => {
                log::debug!("[producer] ignoring stray message frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_requires_address_and_topic() {
        assert!(matches!(
            Producer::start(ProducerConfig {
                topic: "t".to_string(),
                ..ProducerConfig::default()
            }),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Producer::start(ProducerConfig {
                address: "127.0.0.1:4150".to_string(),
                ..ProducerConfig::default()
            }),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_publish_after_stop_fails() {
        // Workers spin against a dead address; stop() must still win.
        let producer = Producer::start(ProducerConfig {
            address: "127.0.0.1:1".to_string(),
            topic: "t".to_string(),
            ..ProducerConfig::default()
        })
        .unwrap();
        producer.stop();
        assert!(matches!(producer.publish(b"x".to_vec()), Err(Error::Stopped)));
    }
}
