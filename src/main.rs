//! append-echo: a shared packet log over TCP
//!
//! Clients send newline-terminated packets. Every complete packet is
//! appended to a single log file shared by all connections, and the whole
//! log is then sent back to the client that sent it.
//!
//! Features:
//! - One task per connection, supervised and drained on shutdown
//! - Graceful shutdown on SIGINT/SIGTERM, removing the log file
//! - Optional daemon mode (`-d`)
//! - Configuration via CLI arguments or TOML file
//! - Logging to syslog or stderr

mod config;
mod daemon;
mod logging;
mod runtime;
mod server;
mod signals;
mod storage;

use config::Config;
use server::Server;
use signals::Shutdown;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    logging::init(&config);

    info!(
        port = config.port,
        backlog = config.backlog,
        data_file = %config.data_file.display(),
        daemon = config.daemon,
        "Starting append-echo server"
    );

    // Bind before detaching so failures still reach the terminal
    let listener = server::create_listener(&config).map_err(|e| {
        error!(port = config.port, error = %e, "Failed to create server socket");
        e
    })?;

    if config.daemon {
        daemon::daemonize().map_err(|e| {
            error!(error = %e, "Failed to daemonize");
            e
        })?;
        info!("Running as daemon");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config, listener))?;
    Ok(())
}

/// Install signal handling and serve until shutdown.
async fn run(config: Config, listener: std::net::TcpListener) -> std::io::Result<()> {
    let shutdown = Shutdown::new();
    signals::install(shutdown.clone())?;

    let server = Server::new(&config, shutdown).await.map_err(|e| {
        error!(path = %config.data_file.display(), error = %e, "Failed to open packet log");
        e
    })?;

    server.run(listener).await
}
