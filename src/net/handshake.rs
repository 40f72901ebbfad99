//! HTTP/1.1 upgrade exchange, server and client side.
//!
//! Both sides read the peer's header block one byte at a time into a pooled
//! buffer until `CRLFCRLF`, so no frame bytes that follow the block are
//! consumed before the pipelines take over the stream.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::auth::accept_key::{accept_key, KeyGenerator};
use crate::core::pool::{BufferPool, PoolError, PooledBuf};

const TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("request does not start with GET")]
    NotGet,
    #[error("header block exceeds {0} bytes")]
    HeaderTooLarge(usize),
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("unexpected status line {0:?}")]
    BadStatus(String),
    #[error("missing Sec-WebSocket-Accept header")]
    MissingAccept,
    #[error("Sec-WebSocket-Accept does not match the key sent")]
    AcceptMismatch,
    #[error("system random source unavailable")]
    Rng,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Server side: validates the upgrade request and answers `101`.
///
/// Nothing is written unless the request is acceptable; on failure the
/// caller just drops the connection.
pub fn accept<S: Read + Write>(
    stream: &mut S,
    pool: &BufferPool,
    max_header_size: usize,
) -> Result<(), HandshakeError> {
    let mut method = [0u8; 3];
    stream.read_exact(&mut method)?;
    if &method != b"GET" {
        return Err(HandshakeError::NotGet);
    }

    let block = read_header_block(stream, pool, max_header_size)?;
    let key = header_value(&block, "Sec-WebSocket-Key")
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(key)
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Client side: sends the upgrade request and checks the server's answer.
pub fn connect<S: Read + Write>(
    stream: &mut S,
    pool: &BufferPool,
    keys: &KeyGenerator,
    host: &str,
    path: &str,
    max_header_size: usize,
) -> Result<(), HandshakeError> {
    let key = keys.generate().ok_or(HandshakeError::Rng)?;
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        path, host, key
    );
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let block = read_header_block(stream, pool, max_header_size)?;
    if !block.starts_with(b"HTTP/1.1 101") {
        let status = block.split(|&b| b == b'\r').next().unwrap_or_default();
        return Err(HandshakeError::BadStatus(
            String::from_utf8_lossy(status).into_owned(),
        ));
    }

    let accept = header_value(&block, "Sec-WebSocket-Accept").ok_or(HandshakeError::MissingAccept)?;
    if accept != accept_key(key.as_bytes()).as_bytes() {
        return Err(HandshakeError::AcceptMismatch);
    }
    Ok(())
}

/// Reads up to and including `CRLFCRLF`, failing once `max` bytes were read
/// without seeing it.
///
/// One `read` per byte: on a plain socket that is one syscall per header
/// byte, bounded by `max`. Reading ahead would pull frame bytes into a buffer
/// the receive loop never sees.
fn read_header_block<R: Read>(
    stream: &mut R,
    pool: &BufferPool,
    max: usize,
) -> Result<PooledBuf, HandshakeError> {
    let mut block = pool.take(max)?;
    let mut byte = [0u8; 1];
    while !block.ends_with(TERMINATOR) {
        if block.len() == max {
            return Err(HandshakeError::HeaderTooLarge(max));
        }
        stream.read_exact(&mut byte)?;
        block.extend_from_slice(&byte)?;
    }
    Ok(block)
}

/// Case-insensitive lookup of a header's trimmed value.
fn header_value<'a>(block: &'a [u8], name: &str) -> Option<&'a [u8]> {
    block.split(|&b| b == b'\n').find_map(|line| {
        let colon = line.iter().position(|&b| b == b':')?;
        let (field, rest) = line.split_at(colon);
        field
            .trim_ascii()
            .eq_ignore_ascii_case(name.as_bytes())
            .then(|| rest[1..].trim_ascii())
    })
}
