use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

const LISTEN_BACKLOG: i32 = 1024;

/// Applies per-connection flags to an accepted or connected stream.
///
/// # Options
/// * `TCP_NODELAY` (optional): small frames go out immediately instead of
///   waiting for Nagle coalescing. The send pipeline already batches.
/// * `SO_KEEPALIVE`: dead peers eventually fail the blocking read.
/// * Blocking mode: both pipelines park inside read/write calls.
pub fn apply_connection_options(stream: &TcpStream, nodelay: bool) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(nodelay)?;
    SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

/// Creates a listening socket with `SO_REUSEADDR` so restarts don't trip
/// over sockets lingering in `TIME_WAIT`.
pub fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Opens a blocking outbound connection.
pub fn connect(addr: SocketAddr, nodelay: bool) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.connect(&addr.into())?;
    let stream: TcpStream = socket.into();
    apply_connection_options(&stream, nodelay)?;
    Ok(stream)
}
