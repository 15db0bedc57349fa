//! Broker connection lifecycle.
//!
//! A [`Connection`] is single-shot: open, handshake, serve, close, and
//! never reopened. The handshake writes the protocol magic and IDENTIFY, applies
//! whatever transport upgrades were negotiated (TLS, then one compression
//! codec), and authenticates when the server demands it.
//!
//! Reads belong to exactly one thread (a producer worker or a consumer
//! reader). Writes go through [`ConnShared`], which serializes them under a
//! mutex so acks, credit refills, and heartbeat replies can originate from
//! any thread. [`ConnShared`] also carries the per-connection in-flight and
//! RDY counters, letting message handles release credit without reaching
//! back into the pool.

mod transport;

pub use transport::TlsSettings;

use std::fmt;
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::command::Command;
use crate::constants::{MAGIC_V2, RESPONSE_OK};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::identify::{Identify, IdentifyResponse};

use transport::{BaseReader, BaseWriter, TransportReader, TransportWriter};

/// State shared between a connection's reader and everything that writes:
/// the pool, message handles, heartbeat replies.
pub(crate) struct ConnShared {
    writer: Mutex<TransportWriter>,
    sock: TcpStream,
    closed: AtomicBool,
    /// Messages delivered to the caller and not yet finished or requeued.
    in_flight: AtomicI64,
    /// Delivery credit the server still holds from the last RDY.
    rdy: AtomicI64,
    /// Negotiated RDY ceiling; zero on producer connections.
    max_rdy: AtomicI64,
    last_frame: Mutex<Instant>,
}

impl ConnShared {
    fn new(writer: TransportWriter, sock: TcpStream) -> ConnShared {
        ConnShared {
            writer: Mutex::new(writer),
            sock,
            closed: AtomicBool::new(false),
            in_flight: AtomicI64::new(0),
            rdy: AtomicI64::new(0),
            max_rdy: AtomicI64::new(0),
            last_frame: Mutex::new(Instant::now()),
        }
    }

    /// Serialize one command onto the wire and flush it.
    pub(crate) fn write_command(&self, cmd: &Command) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut writer = self.writer.lock().unwrap();
        cmd.write_to(&mut *writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Mark closed and shut the socket down, unblocking a pending read.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.sock.shutdown(Shutdown::Both).ok();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Configure the RDY ceiling once negotiation settles (consumer only).
    pub(crate) fn set_max_rdy(&self, max: u32) {
        self.max_rdy.store(i64::from(max), Ordering::SeqCst);
    }

    pub(crate) fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Account for a delivered message: one more in flight, one credit
    /// consumed server-side.
    fn note_delivery(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.rdy.fetch_sub(1, Ordering::SeqCst);
    }

    /// A message was finished or requeued; release its slot and top the
    /// server's credit back up if it ran low. Refill failures are left to
    /// the reader to discover; the connection is already dying.
    pub(crate) fn release_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.maybe_refill().ok();
    }

    /// Issue `RDY <max>` when outstanding credit plus in-flight deliveries
    /// falls below a quarter of the ceiling.
    pub(crate) fn maybe_refill(&self) -> Result<()> {
        let max = self.max_rdy.load(Ordering::SeqCst);
        if max == 0 {
            return Ok(());
        }
        let outstanding = self.rdy.load(Ordering::SeqCst) + self.in_flight.load(Ordering::SeqCst);
        if outstanding < (max / 4).max(1) {
            self.write_command(&Command::Rdy { count: max as u32 })?;
            self.rdy.store(max, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Record credit granted by an explicit `RDY` write.
    pub(crate) fn note_rdy(&self, count: u32) {
        self.rdy.store(i64::from(count), Ordering::SeqCst);
    }

    fn note_frame(&self) {
        *self.last_frame.lock().unwrap() = Instant::now();
    }

    /// Time since any frame arrived; drives heartbeat liveness checks.
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_frame.lock().unwrap().elapsed()
    }
}

/// A framed connection to one broker.
pub struct Connection {
    shared: Arc<ConnShared>,
    reader: BufReader<TransportReader>,
    response: IdentifyResponse,
}

impl Connection {
    /// Open a connection and complete the full handshake: magic, IDENTIFY,
    /// negotiated TLS/compression upgrades, and AUTH when required.
    ///
    /// # Errors
    ///
    /// Connect/handshake I/O failures, rejected negotiation, or a fatal
    /// server error frame.
    pub fn connect(
        address: &str,
        identify: &Identify,
        tls: Option<&TlsSettings>,
        auth_secret: Option<&str>,
    ) -> Result<Connection> {
        let identify = identify.with_defaults();
        let sock = TcpStream::connect(address)?;
        sock.set_nodelay(true)?;

        {
            let mut w = &sock;
            w.write_all(MAGIC_V2)?;
            Command::Identify {
                body: identify.body()?,
            }
            .write_to(&mut w)?;
            w.flush()?;
        }

        let response = match Frame::read_from(&mut (&sock))? {
            Frame::Response(text) => IdentifyResponse::parse(&text)?,
            Frame::Error(e) => return Err(Error::Server(e)),
            Frame::Message(_) => {
                return Err(Error::Handshake(
                    "message frame during negotiation".to_string(),
                ))
            }
        };

        let use_tls = identify.tls_v1 && response.tls_v1;
        let use_deflate = identify.deflate && response.deflate;
        let use_snappy = identify.snappy && response.snappy && !use_deflate;

        let (mut base_r, base_w) = if use_tls {
            let (r, w) = transport::tls_upgrade(&sock, tls, host_of(address))?;
            (BaseReader::Tls(r), BaseWriter::Tls(w))
        } else {
            (
                BaseReader::Plain(sock.try_clone()?),
                BaseWriter::Plain(sock.try_clone()?),
            )
        };
        if use_tls {
            // The server confirms the secured stream before anything else
            // crosses it.
            expect_ok(&mut base_r)?;
        }

        let (t_reader, t_writer) = if use_deflate {
            (
                TransportReader::deflate(base_r),
                TransportWriter::deflate(base_w, identify.deflate_level),
            )
        } else if use_snappy {
            (
                TransportReader::snappy(base_r),
                TransportWriter::snappy(base_w),
            )
        } else {
            (
                TransportReader::Plain(base_r),
                TransportWriter::Plain(base_w),
            )
        };

        let mut reader = BufReader::new(t_reader);
        if use_deflate || use_snappy {
            // Same confirmation, now through the compressed stream.
            expect_ok(&mut reader)?;
        }

        let shared = Arc::new(ConnShared::new(t_writer, sock));
        let mut conn = Connection {
            shared,
            reader,
            response,
        };

        if conn.response.auth_required {
            let secret = auth_secret.ok_or_else(|| {
                Error::Handshake("server requires auth but no secret is configured".to_string())
            })?;
            conn.write_command(&Command::Auth {
                secret: secret.as_bytes().to_vec(),
            })?;
            match conn.read_frame()? {
                Frame::Response(_) => {}
                Frame::Error(e) => return Err(Error::Server(e)),
                Frame::Message(_) => {
                    return Err(Error::Handshake("message frame during auth".to_string()))
                }
            }
        }

        Ok(conn)
    }

    /// Serialize a command onto the wire; safe from any thread.
    pub fn write_command(&self, cmd: &Command) -> Result<()> {
        self.shared.write_command(cmd)
    }

    /// Read the next frame, blocking until one is complete.
    ///
    /// Delivered messages come back already bound to this connection so
    /// their finish/requeue/touch handles work, and already counted in the
    /// in-flight/RDY bookkeeping.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let mut frame = match Frame::read_from(&mut self.reader) {
            Ok(f) => f,
            Err(_) if self.shared.is_closed() => return Err(Error::Closed),
            Err(e) => return Err(e),
        };
        self.shared.note_frame();
        if let Frame::Message(m) = &mut frame {
            m.attach(Arc::downgrade(&self.shared));
            self.shared.note_delivery();
        }
        Ok(frame)
    }

    /// Close the connection, unblocking any pending read. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// What the server accepted during negotiation.
    pub fn identify_response(&self) -> &IdentifyResponse {
        &self.response
    }

    pub(crate) fn shared(&self) -> &Arc<ConnShared> {
        &self.shared
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.shared.is_closed())
            .field("in_flight", &self.shared.in_flight())
            .finish()
    }
}

/// Read one frame and require it to be the `OK` response.
fn expect_ok<R: Read>(r: &mut R) -> Result<()> {
    match Frame::read_from(r)? {
        Frame::Response(s) if s == RESPONSE_OK => Ok(()),
        Frame::Response(s) => Err(Error::Handshake(format!("expected OK, got {s:?}"))),
        Frame::Error(e) => Err(Error::Server(e)),
        Frame::Message(_) => Err(Error::Handshake(
            "message frame during negotiation".to_string(),
        )),
    }
}

/// Host portion of a `host:port` address, for TLS server-name checks.
fn host_of(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, _port)) => host,
        None => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
