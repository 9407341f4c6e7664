//! Line echo server.
//!
//! ```text
//! cargo run --example echo_server -- 127.0.0.1:8080
//! nc 127.0.0.1 8080
//! ```

use std::sync::Arc;

use anyhow::Context;
use millstream::{prelude::*, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Echoes every CRLF or LF terminated line back to the sender.
struct LineEcho;

impl Handler for LineEcho {
    fn on_connect(&self, conn: &NonBlockingConnection) -> millstream::Result<bool> {
        info!(id = %conn.id(), peer = %conn.peer_addr(), "client connected");
        conn.write(b"welcome\r\n")?;
        Ok(true)
    }

    fn on_data(&self, conn: &NonBlockingConnection) -> millstream::Result<bool> {
        let line = conn.read_by_delimiter(b"\n")?;
        conn.write(&line)?;
        conn.write(b"\n")?;
        Ok(true)
    }

    fn on_disconnect(&self, conn: &NonBlockingConnection, cause: &DisconnectCause) {
        info!(id = %conn.id(), %cause, "client disconnected");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
        .parse()
        .context("invalid listen address")?;

    let event_loop = EventLoop::default();
    let server = event_loop.listen(
        ServerConfig::builder().address(address).build(),
        Arc::new(LineEcho),
    )?;
    info!(addr = %server.local_addr(), "echo server listening");

    // blocks until the loop is stopped
    event_loop.run()?;
    Ok(())
}
