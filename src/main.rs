//! flutgrid: a shared pixel canvas server
//!
//! Clients draw on shared canvases over TCP using the pixelflut text
//! protocol or its compact binary variant:
//! - Text: `SIZE`, `PX x y [rrggbb[aa]]`, `ISIZE`, `IPX ...`, `HELP`
//! - Binary: fixed-length frames keyed by an opcode nibble
//!
//! Features:
//! - Lock-free pixel storage with atomic alpha blending
//! - Live canvas snapshots streamed to HTTP viewers
//! - Idle backoff when nobody is drawing
//! - Configuration via CLI arguments or TOML file

mod broadcast;
mod canvas;
mod color;
mod config;
mod dispatch;
mod protocol;
mod render;
mod server;
mod stats;
mod viewer;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        viewer_listen = %config.viewer_listen,
        width = config.width,
        height = config.height,
        icon_width = config.icon_width,
        icon_height = config.icon_height,
        fill = %config.fill,
        max_connections = config.max_connections,
        "Starting flutgrid server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    let server = Server::new(config)?;
    runtime.block_on(server.run())
}
