//! Optional TLS wrapping for blocking streams.
//!
//! The handshake runs on one thread against the whole [`TlsStream`]. After
//! the WebSocket upgrade the stream is split: the read half blocks on the raw
//! socket without holding any lock and only takes the session lock to feed
//! ciphertext in and pull plaintext out; the write half encrypts under the
//! session lock and writes under the socket lock. Locks are always taken
//! session first, so the halves never deadlock.

use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};

use crate::error::Error;

const SCRATCH_LEN: usize = 16 * 1024 + 256;

fn tls_error(e: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Loads a PEM certificate chain and private key into a server config.
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, Error> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| Error::Certificate(format!("{}: {}", cert_path.display(), e)))?;
    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| Error::Certificate(format!("{}: {}", key_path.display(), e)))?;

    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Client config trusting the bundled webpki roots.
pub fn default_client_config() -> Result<Arc<ClientConfig>, Error> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// A blocking TLS session over a `TcpStream`.
pub struct TlsStream {
    conn: Connection,
    sock: TcpStream,
}

impl TlsStream {
    /// Runs the server side of the TLS handshake to completion.
    pub fn accept(config: Arc<ServerConfig>, sock: TcpStream) -> io::Result<Self> {
        let conn = ServerConnection::new(config).map_err(tls_error)?;
        Self::handshake(Connection::Server(conn), sock)
    }

    /// Runs the client side of the TLS handshake to completion.
    pub fn connect(config: Arc<ClientConfig>, server_name: &str, sock: TcpStream) -> io::Result<Self> {
        let server_name = ServerName::try_from(server_name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid DNS name"))?
            .to_owned();
        let conn = ClientConnection::new(config, server_name).map_err(tls_error)?;
        Self::handshake(Connection::Client(conn), sock)
    }

    fn handshake(mut conn: Connection, mut sock: TcpStream) -> io::Result<Self> {
        while conn.is_handshaking() {
            while conn.wants_write() {
                conn.write_tls(&mut sock)?;
            }
            if !conn.is_handshaking() {
                break;
            }
            if conn.read_tls(&mut sock)? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            conn.process_new_packets().map_err(tls_error)?;
        }
        while conn.wants_write() {
            conn.write_tls(&mut sock)?;
        }
        Ok(Self { conn, sock })
    }

    /// Splits into independently usable read and write halves.
    pub fn split(self) -> io::Result<(TlsReader, TlsWriter)> {
        let read_sock = self.sock.try_clone()?;
        let shared = Arc::new(Shared {
            conn: Mutex::new(self.conn),
            write_sock: Mutex::new(self.sock),
        });
        let reader = TlsReader {
            shared: Arc::clone(&shared),
            sock: read_sock,
            pending: Vec::new(),
            scratch: vec![0u8; SCRATCH_LEN].into_boxed_slice(),
        };
        Ok((reader, TlsWriter { shared }))
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            while self.conn.wants_write() {
                self.conn.write_tls(&mut self.sock)?;
            }
            if self.conn.read_tls(&mut self.sock)? == 0 {
                return Ok(0);
            }
            self.conn.process_new_packets().map_err(tls_error)?;
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        self.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.writer().flush()?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.sock)?;
        }
        self.sock.flush()
    }
}

struct Shared {
    conn: Mutex<Connection>,
    write_sock: Mutex<TcpStream>,
}

impl Shared {
    /// Encrypts whatever the session has queued and writes it out. Called
    /// with the session lock held; the lock is released before the socket
    /// write blocks, while the socket lock keeps records in order.
    fn flush_records(&self, mut conn: parking_lot::MutexGuard<'_, Connection>) -> io::Result<()> {
        let mut records = Vec::new();
        while conn.wants_write() {
            conn.write_tls(&mut records)?;
        }
        if records.is_empty() {
            return Ok(());
        }
        let mut sock = self.write_sock.lock();
        drop(conn);
        sock.write_all(&records)?;
        sock.flush()
    }
}

/// Read half of a split [`TlsStream`].
pub struct TlsReader {
    shared: Arc<Shared>,
    sock: TcpStream,
    pending: Vec<u8>,
    scratch: Box<[u8]>,
}

impl Read for TlsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut conn = self.shared.conn.lock();
                match conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                if !self.pending.is_empty() {
                    let used = conn.read_tls(&mut &self.pending[..])?;
                    self.pending.drain(..used);
                    conn.process_new_packets().map_err(tls_error)?;
                    self.shared.flush_records(conn)?;
                    continue;
                }
            }

            let n = self.sock.read(&mut self.scratch)?;
            if n == 0 {
                return Ok(0);
            }
            self.pending.extend_from_slice(&self.scratch[..n]);
        }
    }
}

/// Write half of a split [`TlsStream`].
pub struct TlsWriter {
    shared: Arc<Shared>,
}

impl Write for TlsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut conn = self.shared.conn.lock();
        let n = conn.writer().write(buf)?;
        self.shared.flush_records(conn)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let conn = self.shared.conn.lock();
        self.shared.flush_records(conn)
    }
}
