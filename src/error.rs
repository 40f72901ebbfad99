use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::pool::PoolError;
use crate::net::framing::ProtocolError;
use crate::net::handshake::HandshakeError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport: {0}")]
    Io(#[from] io::Error),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("buffer pool: {0}")]
    Pool(#[from] PoolError),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("certificate: {0}")]
    Certificate(String),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    /// The connection was torn down while a pipeline was still running.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Errors the application hears about. Cancellation is silent.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, Error::Cancelled)
    }
}
