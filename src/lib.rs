//! Blocking, thread-per-connection WebSocket transport for binary messages.
//!
//! A [`Server`] accepts peers and a [`Client`] dials one. Both run a receive
//! thread and a send thread per connection, move payloads through a shared
//! [`BufferPool`], and report everything that happens as [`Message`]s on a
//! queue the application drains at its own pace.

pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod net;

pub use crate::config::{Config, ConfigError};
pub use crate::core::message::{drain_messages, ConnectionId, Event, Handler, Message, MessageReceiver, UNSET_ID};
pub use crate::core::pool::{BufferPool, PoolError, PooledBuf, SharedBuf};
pub use crate::error::Error;
pub use crate::net::server::Server;
pub use crate::net::ws_client::{Client, ClientOptions, CLIENT_CONNECTION_ID};
