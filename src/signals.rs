//! Shutdown signalling.
//!
//! SIGINT and SIGTERM are received by a dedicated task whose only job is to
//! raise the shutdown flag. The accept loop polls the flag between
//! iterations and also waits on it, so a signal interrupts a blocked accept.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

/// Shared, lock-free shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    /// Create a flag with no shutdown requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Check whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is requested.
    ///
    /// Returns immediately if it already was.
    pub async fn requested(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a trigger in between is not lost.
            notified.as_mut().enable();

            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Install SIGINT/SIGTERM listeners that trigger `shutdown`.
///
/// Must be called from within the tokio runtime.
pub fn install(shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        info!(signal = name, "Caught signal, exiting");
        shutdown.trigger();
    }))
}
