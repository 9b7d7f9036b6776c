//! TCP server for the append-echo protocol.
//!
//! Accepts connections and runs each one in its own task. Finished tasks
//! are collected from a `JoinSet` while accepting continues; on shutdown the
//! listener is dropped, the remaining tasks are awaited and the packet log
//! is deleted.

use crate::config::Config;
use crate::runtime::{Connection, ConnectionError};
use crate::signals::Shutdown;
use crate::storage::{PersistentStore, SharedStore};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Pause before accepting again after running out of descriptors or memory
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Create the listening socket: IPv4, all interfaces, SO_REUSEADDR.
///
/// Bound synchronously in non-blocking mode so it can be set up before the
/// process detaches and before the runtime exists.
pub fn create_listener(config: &Config) -> io::Result<std::net::TcpListener> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;

    Ok(socket.into())
}

/// Server instance
pub struct Server {
    store: SharedStore,
    shutdown: Shutdown,
}

impl Server {
    /// Create a new server instance, opening the packet log.
    pub async fn new(config: &Config, shutdown: Shutdown) -> io::Result<Self> {
        let store = PersistentStore::open_shared(&config.data_file).await?;

        let existing = store.lock().await.len().await?;
        if existing > 0 {
            warn!(bytes = existing, "Packet log already has contents, appending");
        }

        Ok(Server { store, shutdown })
    }

    /// Accept connections until shutdown is requested, then drain and clean up.
    pub async fn run(self, listener: std::net::TcpListener) -> io::Result<()> {
        let listener = TcpListener::from_std(listener)?;
        info!(address = %listener.local_addr()?, "Server listening");

        let mut workers = JoinSet::new();

        loop {
            if self.shutdown.is_requested() {
                break;
            }

            tokio::select! {
                _ = self.shutdown.requested() => break,

                Some(done) = workers.join_next(), if !workers.is_empty() => {
                    reap(done);
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!(peer = %addr.ip(), "Accepted connection");
                        let store = Arc::clone(&self.store);
                        workers.spawn(handle_client(stream, addr, store));
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        trace!("Accept interrupted, retrying");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        if let Some(delay) = accept_backoff(&e) {
                            tokio::time::sleep(delay).await;
                        }
                    }
                },
            }
        }

        drop(listener);
        info!(in_flight = workers.len(), "Stopped accepting, waiting for connections to finish");

        while let Some(done) = workers.join_next().await {
            reap(done);
        }

        let store = self.store.lock().await;
        if let Err(e) = store.remove().await {
            error!(path = %store.path().display(), error = %e, "Failed to delete packet log");
        }

        info!("Server shut down");
        Ok(())
    }

    /// Get a reference to the store for testing
    #[cfg(test)]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }
}

/// Serve one accepted client to completion.
async fn handle_client(stream: TcpStream, addr: SocketAddr, store: SharedStore) {
    let mut conn = Connection::new(stream);

    match conn.serve(&store).await {
        Ok(packets) => {
            info!(peer = %addr.ip(), packets, "Closed connection");
        }
        Err(ConnectionError::Socket(e)) => {
            warn!(peer = %addr.ip(), packets = conn.packets(), error = %e, "Connection aborted");
        }
        Err(e) => {
            error!(peer = %addr.ip(), packets = conn.packets(), error = %e, "Connection aborted");
        }
    }
}

/// Pause after accept errors caused by resource exhaustion, which would
/// otherwise repeat on every iteration until a descriptor is freed.
fn accept_backoff(err: &io::Error) -> Option<Duration> {
    match err.raw_os_error() {
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
            Some(ACCEPT_BACKOFF)
        }
        _ => None,
    }
}

/// Log the outcome of a finished connection task.
fn reap(done: Result<(), JoinError>) {
    match done {
        Ok(()) => debug!("Connection task finished"),
        Err(e) => error!(error = %e, "Connection task failed"),
    }
}
