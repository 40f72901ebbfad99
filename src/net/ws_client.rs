//! Client endpoint: one outgoing WebSocket connection driven by the same
//! receive and send loops the server uses, with masking on.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use log::{debug, info};
use rustls::ClientConfig;

use crate::auth::accept_key::KeyGenerator;
use crate::config::Config;
use crate::core::message::{self, ConnectionId, Event, Handler, Message, MessageReceiver};
use crate::core::pool::SharedBuf;
use crate::error::Error;
use crate::net::connection::{Connection, Role};
use crate::net::handshake;
use crate::net::pipeline::{self, PipelineContext};
use crate::net::stream::{ReadHalf, WriteHalf, WsStream};
use crate::net::tcp_opt;
use crate::net::tls::TlsStream;

/// The client's single connection always carries this id.
pub const CLIENT_CONNECTION_ID: ConnectionId = 0;

#[derive(Clone, Default)]
pub struct ClientOptions {
    pub config: Config,
    /// Wraps the socket in TLS when set; `host` doubles as the server name.
    pub tls: Option<Arc<ClientConfig>>,
}

pub struct Client {
    conn: Arc<Connection>,
    ctx: PipelineContext,
    rx: MessageReceiver,
}

impl Client {
    /// Connects, upgrades and starts both pipeline threads. The first
    /// message on the queue is `Connected`.
    pub fn connect(addr: SocketAddr, host: &str, path: &str, options: ClientOptions) -> Result<Self, Error> {
        let ClientOptions { config, tls } = options;
        config.validate()?;
        let pool = Arc::new(config.build_pool()?);

        let sock = tcp_opt::connect(addr, config.nodelay)?;
        let handle = sock.try_clone()?;
        let mut stream = match tls {
            Some(tls) => WsStream::Tls(Box::new(TlsStream::connect(tls, host, sock)?)),
            None => WsStream::Plain(sock),
        };
        handshake::connect(
            &mut stream,
            &pool,
            &KeyGenerator::new(),
            host,
            path,
            config.max_header_size,
        )?;
        info!("connected to {} ({}{})", addr, host, path);

        let (tx, rx) = message::channel();
        let ctx = PipelineContext {
            pool,
            config: Arc::new(config),
            tx,
        };
        let conn = Arc::new(Connection::new(Role::Client, handle, addr));
        conn.set_id(CLIENT_CONNECTION_ID);
        let events = ctx.tx.clone();
        conn.set_dispose_hook(Box::new(move |id| {
            let _ = events.send(Message::new(id, Event::Disconnected));
        }));
        let _ = ctx.tx.send(Message::new(CLIENT_CONNECTION_ID, Event::Connected));

        let (reader, writer) = match stream.split() {
            Ok(halves) => halves,
            Err(e) => {
                conn.dispose();
                return Err(e.into());
            }
        };
        if let Err(e) = spawn_pipelines(&conn, &ctx, reader, writer) {
            conn.dispose();
            conn.join_threads();
            return Err(e.into());
        }

        Ok(Self { conn, ctx, rx })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn is_connected(&self) -> bool {
        !self.conn.is_disposed()
    }

    /// Queues `bytes` as one masked binary message. Returns false once the
    /// connection is gone.
    pub fn send(&self, bytes: &[u8]) -> Result<bool, Error> {
        let buf = self.ctx.pool.copy_from(bytes)?.share();
        Ok(self.send_shared(buf))
    }

    pub fn send_shared(&self, buf: SharedBuf) -> bool {
        self.conn.enqueue(buf)
    }

    /// Disconnects at once, dropping anything still queued.
    pub fn close(&self) {
        self.conn.dispose();
    }

    pub fn drain_messages<H: Handler + ?Sized>(&self, max: usize, handler: &mut H) -> usize {
        message::drain_messages(&self.rx, max, handler)
    }

    pub fn messages(&self) -> &MessageReceiver {
        &self.rx
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.conn.dispose();
        self.conn.join_threads();
        debug!("client for {} dropped", self.conn.peer_addr());
    }
}

fn spawn_pipelines(
    conn: &Arc<Connection>,
    ctx: &PipelineContext,
    reader: ReadHalf,
    writer: WriteHalf,
) -> io::Result<()> {
    let receiver = {
        let conn = Arc::clone(conn);
        let ctx = ctx.clone();
        thread::Builder::new()
            .name("ws-client-recv".into())
            .spawn(move || pipeline::run_receive(&conn, reader, &ctx))?
    };
    conn.attach_thread(receiver);

    let sender = {
        let conn = Arc::clone(conn);
        let ctx = ctx.clone();
        thread::Builder::new()
            .name("ws-client-send".into())
            .spawn(move || pipeline::run_send(&conn, writer, &ctx))?
    };
    conn.attach_thread(sender);
    Ok(())
}
