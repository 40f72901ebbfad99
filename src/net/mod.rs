pub mod connection;
pub mod framing;
pub mod handshake;
pub(crate) mod pipeline;
pub mod server;
pub mod stream;
pub mod tcp_opt;
pub mod tls;
pub mod ws_client;
