//! Transport layering.
//!
//! A connection starts as a plain TCP stream and is upgraded in a fixed
//! order during the handshake: TLS first, then at most one compression
//! codec (deflate or snappy). Reads and writes run on different threads,
//! so every layer is split into an independent read half and write half:
//!
//! - plain TCP splits by cloning the socket handle;
//! - TLS keeps one sans-IO `rustls` session shared by both halves behind a
//!   mutex, with each half doing its own socket I/O on a cloned handle so a
//!   blocked read never starves writers;
//! - compression wraps each half separately, since the two directions are
//!   independent streams.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, RootCertStore};

use crate::error::{Error, Result};

/// TLS configuration for producers and consumers.
///
/// With no files set, the webpki root bundle verifies the server and no
/// client certificate is presented.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// PEM bundle of CA certificates that verify the server.
    pub root_file: Option<PathBuf>,
    /// PEM client certificate chain, presented when the broker requires
    /// client auth. Requires `key_file`.
    pub cert_file: Option<PathBuf>,
    /// PEM private key matching `cert_file`.
    pub key_file: Option<PathBuf>,
    /// Expected server name; defaults to the host part of the broker
    /// address.
    pub server_name: Option<String>,
}

impl TlsSettings {
    /// Build the rustls client configuration these settings describe.
    ///
    /// # Errors
    ///
    /// File I/O failures, unparseable PEM contents, or a cert/key pair the
    /// TLS library rejects.
    pub fn client_config(&self) -> Result<rustls::ClientConfig> {
        let mut roots = RootCertStore::empty();
        match &self.root_file {
            Some(path) => {
                let mut reader = BufReader::new(File::open(path)?);
                let mut added = 0;
                for cert in rustls_pemfile::certs(&mut reader) {
                    roots
                        .add(cert?)
                        .map_err(|e| Error::Config(format!("root certificate: {e}")))?;
                    added += 1;
                }
                if added == 0 {
                    return Err(Error::Config(format!(
                        "no certificates in {}",
                        path.display()
                    )));
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);

        let config = match (&self.cert_file, &self.key_file) {
            (Some(cert_path), Some(key_path)) => {
                let mut cert_reader = BufReader::new(File::open(cert_path)?);
                let certs = rustls_pemfile::certs(&mut cert_reader)
                    .collect::<io::Result<Vec<_>>>()?;
                let mut key_reader = BufReader::new(File::open(key_path)?);
                let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
                    Error::Config(format!("no private key in {}", key_path.display()))
                })?;
                builder.with_client_auth_cert(certs, key)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(Error::Config(
                    "cert_file and key_file must be set together".to_string(),
                ))
            }
        };
        Ok(config)
    }
}

// ─── TLS halves ─────────────────────────────────────────────────────────────

/// Complete the TLS handshake over `sock` and split the session into
/// independently usable halves.
pub(crate) fn tls_upgrade(
    sock: &TcpStream,
    settings: Option<&TlsSettings>,
    host: &str,
) -> Result<(TlsReadHalf, TlsWriteHalf)> {
    let default_settings = TlsSettings::default();
    let settings = settings.unwrap_or(&default_settings);
    let config = settings.client_config()?;
    let name = settings.server_name.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|e| Error::Config(format!("server name {name:?}: {e}")))?;

    let mut session = ClientConnection::new(Arc::new(config), server_name)?;
    let mut hs_sock = sock.try_clone()?;
    while session.is_handshaking() {
        session
            .complete_io(&mut hs_sock)
            .map_err(|e| Error::Handshake(format!("tls: {e}")))?;
    }

    let session = Arc::new(Mutex::new(session));
    Ok((
        TlsReadHalf {
            session: Arc::clone(&session),
            sock: sock.try_clone()?,
        },
        TlsWriteHalf {
            session,
            sock: sock.try_clone()?,
        },
    ))
}

/// Read half of a TLS connection.
///
/// Blocks on the socket without holding the session lock, so acks and
/// credit refills on the write half proceed while a read is pending.
pub(crate) struct TlsReadHalf {
    session: Arc<Mutex<ClientConnection>>,
    sock: TcpStream,
}

impl Read for TlsReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut ciphertext = [0u8; 8192];
        loop {
            {
                let mut session = self.session.lock().unwrap();
                match session.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }

            let n = self.sock.read(&mut ciphertext)?;
            if n == 0 {
                return Ok(0);
            }
            let mut session = self.session.lock().unwrap();
            let mut pending = &ciphertext[..n];
            while !pending.is_empty() {
                if session.read_tls(&mut pending)? == 0 {
                    break;
                }
                session
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
        }
    }
}

/// Write half of a TLS connection.
pub(crate) struct TlsWriteHalf {
    session: Arc<Mutex<ClientConnection>>,
    sock: TcpStream,
}

impl Write for TlsWriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut session = self.session.lock().unwrap();
        let n = session.writer().write(buf)?;
        while session.wants_write() {
            session.write_tls(&mut self.sock)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut session = self.session.lock().unwrap();
        while session.wants_write() {
            session.write_tls(&mut self.sock)?;
        }
        self.sock.flush()
    }
}

// ─── Layered halves ─────────────────────────────────────────────────────────

/// Innermost readable half: plain socket or TLS.
pub(crate) enum BaseReader {
    Plain(TcpStream),
    Tls(TlsReadHalf),
}

impl Read for BaseReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BaseReader::Plain(s) => s.read(buf),
            BaseReader::Tls(s) => s.read(buf),
        }
    }
}

/// Innermost writable half: plain socket or TLS.
pub(crate) enum BaseWriter {
    Plain(TcpStream),
    Tls(TlsWriteHalf),
}

impl Write for BaseWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BaseWriter::Plain(s) => s.write(buf),
            BaseWriter::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BaseWriter::Plain(s) => s.flush(),
            BaseWriter::Tls(s) => s.flush(),
        }
    }
}

/// Fully layered read half handed to the frame decoder.
pub(crate) enum TransportReader {
    Plain(BaseReader),
    Deflate(DeflateDecoder<BaseReader>),
    Snappy(snap::read::FrameDecoder<BaseReader>),
}

impl TransportReader {
    pub(crate) fn deflate(base: BaseReader) -> TransportReader {
        TransportReader::Deflate(DeflateDecoder::new(base))
    }

    pub(crate) fn snappy(base: BaseReader) -> TransportReader {
        TransportReader::Snappy(snap::read::FrameDecoder::new(base))
    }
}

impl Read for TransportReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TransportReader::Plain(r) => r.read(buf),
            TransportReader::Deflate(r) => r.read(buf),
            TransportReader::Snappy(r) => r.read(buf),
        }
    }
}

/// Fully layered write half guarded by the connection's write mutex.
pub(crate) enum TransportWriter {
    Plain(BaseWriter),
    Deflate(DeflateEncoder<BaseWriter>),
    Snappy(snap::write::FrameEncoder<BaseWriter>),
}

impl TransportWriter {
    pub(crate) fn deflate(base: BaseWriter, level: u32) -> TransportWriter {
        TransportWriter::Deflate(DeflateEncoder::new(base, Compression::new(level)))
    }

    pub(crate) fn snappy(base: BaseWriter) -> TransportWriter {
        TransportWriter::Snappy(snap::write::FrameEncoder::new(base))
    }
}

impl Write for TransportWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TransportWriter::Plain(w) => w.write(buf),
            TransportWriter::Deflate(w) => w.write(buf),
            TransportWriter::Snappy(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TransportWriter::Plain(w) => w.flush(),
            TransportWriter::Deflate(w) => w.flush(),
            TransportWriter::Snappy(w) => w.flush(),
        }
    }
}
