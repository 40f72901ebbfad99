//! Listener and connection table.
//!
//! One accept thread hands every peer to its own thread, which runs the
//! optional TLS handshake and the WebSocket upgrade, registers the
//! connection, spawns the send thread and then becomes the receive thread.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use rustls::ServerConfig;

use crate::config::Config;
use crate::core::message::{self, ConnectionId, Event, Handler, Message, MessageReceiver};
use crate::core::pool::{BufferPool, SharedBuf};
use crate::error::Error;
use crate::net::connection::{Connection, Role};
use crate::net::handshake;
use crate::net::pipeline::{self, PipelineContext};
use crate::net::stream::WsStream;
use crate::net::tcp_opt;
use crate::net::tls::TlsStream;

const BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

struct Shared {
    ctx: PipelineContext,
    tls: Option<Arc<ServerConfig>>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// Peers still in the TLS or upgrade handshake, keyed by accept order.
    handshaking: DashMap<u64, Arc<Connection>>,
    next_id: AtomicI64,
    next_accept: AtomicU64,
    running: AtomicBool,
}

pub struct Server {
    shared: Arc<Shared>,
    rx: MessageReceiver,
    local_addr: SocketAddr,
    accept_thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds the configured address and starts accepting.
    pub fn start(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let tls = config.server_tls()?;
        let pool = Arc::new(config.build_pool()?);
        let listener = tcp_opt::create_listener(config.socket_addr())?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = message::channel();

        let shared = Arc::new(Shared {
            ctx: PipelineContext {
                pool,
                config: Arc::new(config),
                tx,
            },
            tls,
            connections: DashMap::new(),
            handshaking: DashMap::new(),
            next_id: AtomicI64::new(0),
            next_accept: AtomicU64::new(0),
            running: AtomicBool::new(true),
        });

        let accept_thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("ws-accept".into())
                .spawn(move || accept_loop(&shared, listener))?
        };
        info!(
            "WebSocket server listening on {} (tls: {})",
            local_addr,
            shared.tls.is_some()
        );

        Ok(Self {
            shared,
            rx,
            local_addr,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn pool(&self) -> &BufferPool {
        &self.shared.ctx.pool
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Cloned out of the table so no shard lock is held while the caller
    /// acts on it; disposal removes the entry from the same table.
    fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.shared.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Queues `bytes` for one connection. Unknown ids are logged and ignored.
    pub fn send(&self, id: ConnectionId, bytes: &[u8]) -> Result<bool, Error> {
        let buf = self.shared.ctx.pool.copy_from(bytes)?.share();
        Ok(self.send_shared(id, buf))
    }

    pub fn send_shared(&self, id: ConnectionId, buf: SharedBuf) -> bool {
        match self.connection(id) {
            Some(conn) => conn.enqueue(buf),
            None => {
                warn!("send to unknown connection {}", id);
                false
            }
        }
    }

    /// Queues one pooled copy of `bytes` on every listed connection. Each
    /// recipient holds a reference to the same buffer; returns how many
    /// connections it was queued on.
    pub fn broadcast(&self, ids: &[ConnectionId], bytes: &[u8]) -> Result<usize, Error> {
        let buf = self.shared.ctx.pool.copy_from(bytes)?.share();
        let mut delivered = 0;
        for id in ids {
            match self.connection(*id) {
                Some(conn) if conn.enqueue(buf.clone()) => delivered += 1,
                Some(_) => {}
                None => warn!("broadcast to unknown connection {}", id),
            }
        }
        buf.release();
        Ok(delivered)
    }

    /// Disposes the connection at once. Anything still queued for it is
    /// released unsent and `Disconnected` follows.
    pub fn close(&self, id: ConnectionId) {
        match self.connection(id) {
            Some(conn) => conn.dispose(),
            None => debug!("close of unknown connection {}", id),
        }
    }

    pub fn client_address(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connection(id).map(|conn| conn.peer_addr())
    }

    /// Delivers up to `max` queued messages to `handler`.
    pub fn drain_messages<H: Handler + ?Sized>(&self, max: usize, handler: &mut H) -> usize {
        message::drain_messages(&self.rx, max, handler)
    }

    /// Raw access to the message queue for consumers that prefer to block.
    pub fn messages(&self) -> &MessageReceiver {
        &self.rx
    }

    /// Stops accepting and disposes every connection, including peers that
    /// have not finished their handshake.
    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        wake_acceptor(self.local_addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }

        // A peer leaves `handshaking` only after it is in `connections`, so
        // taking this snapshot first cannot miss one that is moving across.
        let mut live: Vec<Arc<Connection>> = self
            .shared
            .handshaking
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        live.extend(
            self.shared
                .connections
                .iter()
                .map(|entry| Arc::clone(entry.value())),
        );
        for conn in &live {
            conn.dispose();
        }
        for conn in &live {
            conn.join_threads();
        }
        info!("WebSocket server on {} stopped", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Unblocks a pending `accept` by connecting to ourselves.
fn wake_acceptor(addr: SocketAddr) {
    let target = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    };
    let _ = TcpStream::connect_timeout(&target, Duration::from_secs(1));
}

fn accept_loop(shared: &Arc<Shared>, listener: TcpListener) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        let accepted = listener.accept();
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        match accepted {
            Ok((sock, peer)) => {
                backoff = BACKOFF_INITIAL;
                if let Err(e) = spawn_peer(shared, sock, peer) {
                    warn!("dropping {}: {}", peer, e);
                }
            }
            Err(e) if is_listener_fatal(&e) => {
                error!("listener failed: {}", e);
                break;
            }
            Err(e) => {
                warn!("accept failed: {}; retrying in {:?}", e, backoff);
                thread::sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }
    debug!("accept loop exited");
}

fn is_listener_fatal(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::Unsupported
    )
}

/// Builds the connection for an accepted socket and hands it to a thread
/// that will upgrade it and then run its receive loop.
fn spawn_peer(shared: &Arc<Shared>, sock: TcpStream, peer: SocketAddr) -> io::Result<()> {
    tcp_opt::apply_connection_options(&sock, shared.ctx.config.nodelay)?;
    let conn = Arc::new(Connection::new(Role::Server, sock.try_clone()?, peer));
    let ticket = shared.next_accept.fetch_add(1, Ordering::Relaxed);
    shared.handshaking.insert(ticket, Arc::clone(&conn));

    let spawned = {
        let shared = Arc::clone(shared);
        let conn = Arc::clone(&conn);
        thread::Builder::new()
            .name(format!("ws-recv-{peer}"))
            .spawn(move || serve_peer(&shared, ticket, conn, sock))
    };
    match spawned {
        Ok(handle) => {
            conn.attach_thread(handle);
            Ok(())
        }
        Err(e) => {
            shared.handshaking.remove(&ticket);
            conn.dispose();
            Err(e)
        }
    }
}

/// Runs on the peer's own thread: upgrade, register, then receive.
fn serve_peer(shared: &Arc<Shared>, ticket: u64, conn: Arc<Connection>, sock: TcpStream) {
    let stream = match upgrade(shared, sock) {
        Ok(stream) => stream,
        Err(e) => {
            if !conn.is_disposed() {
                warn!("handshake with {} failed: {}", conn.peer_addr(), e);
            }
            shared.handshaking.remove(&ticket);
            conn.dispose();
            return;
        }
    };

    let id = shared.next_id.fetch_add(1, Ordering::AcqRel);
    conn.set_id(id);
    shared.connections.insert(id, Arc::clone(&conn));
    shared.handshaking.remove(&ticket);
    let _ = shared.ctx.tx.send(Message::new(id, Event::Connected));
    debug!("connection {} established with {}", id, conn.peer_addr());

    // Registered after `Connected` is queued; if the connection was disposed
    // in the meantime the hook runs right here, so `Disconnected` still
    // follows `Connected` exactly once.
    let weak: Weak<Shared> = Arc::downgrade(shared);
    conn.set_dispose_hook(Box::new(move |id| {
        if let Some(shared) = weak.upgrade() {
            shared.connections.remove(&id);
            let _ = shared.ctx.tx.send(Message::new(id, Event::Disconnected));
        }
    }));

    if !shared.running.load(Ordering::SeqCst) || conn.is_disposed() {
        conn.dispose();
        return;
    }

    let (reader, writer) = match stream.split() {
        Ok(halves) => halves,
        Err(e) => {
            let _ = shared.ctx.tx.send(Message::new(id, Event::Error(e.into())));
            conn.dispose();
            return;
        }
    };

    let sender = {
        let conn = Arc::clone(&conn);
        let ctx = shared.ctx.clone();
        thread::Builder::new()
            .name(format!("ws-send-{id}"))
            .spawn(move || pipeline::run_send(&conn, writer, &ctx))
    };
    match sender {
        Ok(handle) => conn.attach_thread(handle),
        Err(e) => {
            let _ = shared.ctx.tx.send(Message::new(id, Event::Error(e.into())));
            conn.dispose();
            return;
        }
    }

    pipeline::run_receive(&conn, reader, &shared.ctx);
}

/// TLS, then the WebSocket upgrade. Failures are only logged: no id has
/// been assigned yet, so the application never hears about the peer.
fn upgrade(shared: &Shared, sock: TcpStream) -> Result<WsStream, Error> {
    let mut stream = match &shared.tls {
        Some(tls) => WsStream::Tls(Box::new(TlsStream::accept(Arc::clone(tls), sock)?)),
        None => WsStream::Plain(sock),
    };
    handshake::accept(&mut stream, &shared.ctx.pool, shared.ctx.config.max_header_size)?;
    Ok(stream)
}
