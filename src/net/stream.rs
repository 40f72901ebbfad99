use std::io::{self, Read, Write};
use std::net::TcpStream;

use crate::net::tls::TlsStream;

pub type ReadHalf = Box<dyn Read + Send>;
pub type WriteHalf = Box<dyn Write + Send>;

/// Byte stream carrying a WebSocket session, optionally TLS-wrapped.
pub enum WsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl WsStream {
    pub fn split(self) -> io::Result<(ReadHalf, WriteHalf)> {
        match self {
            WsStream::Plain(sock) => {
                let reader = sock.try_clone()?;
                Ok((Box::new(reader), Box::new(sock)))
            }
            WsStream::Tls(tls) => {
                let (reader, writer) = tls.split()?;
                Ok((Box::new(reader), Box::new(writer)))
            }
        }
    }
}

impl Read for WsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            WsStream::Plain(sock) => sock.read(buf),
            WsStream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for WsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WsStream::Plain(sock) => sock.write(buf),
            WsStream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WsStream::Plain(sock) => sock.flush(),
            WsStream::Tls(tls) => tls.flush(),
        }
    }
}
