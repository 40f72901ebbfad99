use std::env;
use std::path::Path;
use std::process;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;

use wsbridge::{Config, ConnectionId, Error, Handler, Server};

const DRAIN_BATCH: usize = 256;

/// Sends every message straight back to the connection it came from.
struct Echo<'a> {
    server: &'a Server,
    echoed: u64,
}

impl Handler for Echo<'_> {
    fn on_connect(&mut self, id: ConnectionId) {
        info!("connection {} from {:?}", id, self.server.client_address(id));
    }

    fn on_data(&mut self, id: ConnectionId, data: &[u8]) {
        match self.server.send(id, data) {
            Ok(true) => self.echoed += 1,
            Ok(false) => {}
            Err(e) => warn!("echo to {} failed: {}", id, e),
        }
    }

    fn on_disconnect(&mut self, id: ConnectionId) {
        info!("connection {} closed", id);
    }

    fn on_error(&mut self, id: ConnectionId, cause: &Error) {
        warn!("connection {}: {}", id, cause);
    }
}

fn load_config() -> Result<Config, Error> {
    let config = match env::args().nth(1) {
        Some(path) => Config::from_file(Path::new(&path))?,
        None => Config::default(),
    };
    Ok(config.apply_env()?)
}

fn main() {
    tracing_subscriber::fmt().with_max_level(LevelFilter::INFO).init();
    let _ = dotenv::dotenv();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };

    let server = match Server::start(config) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {}", e);
            process::exit(1);
        }
    };
    info!("echo server ready on {}", server.local_addr());

    let mut echo = Echo {
        server: &server,
        echoed: 0,
    };
    let mut reported = 0;
    loop {
        if server.drain_messages(DRAIN_BATCH, &mut echo) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        if echo.echoed >= reported + 10_000 {
            reported = echo.echoed;
            info!("{} messages echoed, {} connections", reported, server.connection_count());
        }
    }
}
