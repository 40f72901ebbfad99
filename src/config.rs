//! Transport configuration.
//!
//! Defaults, overridden by an optional JSON file, overridden by `WS_*`
//! environment variables. The binary loads a `.env` file first so local
//! overrides land in the environment before [`Config::apply_env`] runs.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rustls::ServerConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::core::pool::{BufferPool, PoolError};
use crate::error::Error;
use crate::net::tls;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] simd_json::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("tls_cert_path and tls_key_path must be set together")]
    IncompleteTls,
    #[error("pool: {0}")]
    Pool(#[from] PoolError),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Upper bound on a single message, across all of its fragments.
    pub max_message_size: usize,
    /// Upper bound on the HTTP upgrade header block.
    pub max_header_size: usize,
    /// Coalesce queued messages into one write per wake-up.
    pub batch_send: bool,
    pub send_buffer_size: usize,
    pub read_buffer_size: usize,
    pub pool_buckets: usize,
    pub pool_smallest: usize,
    pub nodelay: bool,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            max_message_size: 16 * 1024 * 1024,
            max_header_size: 8 * 1024,
            batch_send: true,
            send_buffer_size: 64 * 1024,
            read_buffer_size: 16 * 1024,
            pool_buckets: 20,
            pool_smallest: 64,
            nodelay: true,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Config {
    pub fn from_json(bytes: &mut [u8]) -> Result<Self, ConfigError> {
        Ok(simd_json::serde::from_slice(bytes)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&mut bytes)
    }

    /// Applies `WS_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).map(|value| (key, value));

        if let Some(v) = get("WS_BIND_ADDRESS") {
            self.bind_address = parse(v)?;
        }
        if let Some(v) = get("WS_PORT") {
            self.port = parse(v)?;
        }
        if let Some(v) = get("WS_MAX_MESSAGE_SIZE") {
            self.max_message_size = parse(v)?;
        }
        if let Some(v) = get("WS_MAX_HEADER_SIZE") {
            self.max_header_size = parse(v)?;
        }
        if let Some(v) = get("WS_BATCH_SEND") {
            self.batch_send = parse(v)?;
        }
        if let Some(v) = get("WS_SEND_BUFFER_SIZE") {
            self.send_buffer_size = parse(v)?;
        }
        if let Some(v) = get("WS_READ_BUFFER_SIZE") {
            self.read_buffer_size = parse(v)?;
        }
        if let Some(v) = get("WS_POOL_BUCKETS") {
            self.pool_buckets = parse(v)?;
        }
        if let Some(v) = get("WS_POOL_SMALLEST") {
            self.pool_smallest = parse(v)?;
        }
        if let Some(v) = get("WS_NODELAY") {
            self.nodelay = parse(v)?;
        }
        if let Some((_, v)) = get("WS_TLS_CERT") {
            self.tls_cert_path = Some(PathBuf::from(v));
        }
        if let Some((_, v)) = get("WS_TLS_KEY") {
            self.tls_key_path = Some(PathBuf::from(v));
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("max_message_size", self.max_message_size),
            ("max_header_size", self.max_header_size),
            ("send_buffer_size", self.send_buffer_size),
            ("read_buffer_size", self.read_buffer_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(ConfigError::IncompleteTls);
        }
        BufferPool::new(self.pool_buckets, self.pool_smallest, self.pool_largest())?;
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// The largest buffer any pipeline will ask the pool for.
    pub fn pool_largest(&self) -> usize {
        self.max_message_size
            .max(self.max_header_size)
            .max(self.send_buffer_size)
            .max(self.pool_smallest)
    }

    pub fn build_pool(&self) -> Result<BufferPool, ConfigError> {
        Ok(BufferPool::new(self.pool_buckets, self.pool_smallest, self.pool_largest())?)
    }

    /// Server TLS config, when both certificate and key paths are set.
    pub fn server_tls(&self) -> Result<Option<Arc<ServerConfig>>, Error> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Ok(Some(tls::server_config(cert, key)?)),
            (None, None) => Ok(None),
            _ => Err(ConfigError::IncompleteTls.into()),
        }
    }
}

fn parse<T: FromStr>((key, value): (&'static str, String)) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}
