//! Persistent packet log.
//!
//! A single append-only file shared by every connection for the lifetime of
//! the server. Each completed packet is appended, then the file is read back
//! from the start up to the length it had right after that append.
//!
//! The store is shared as `SharedStore`. A connection holds the lock only to
//! append and take the resulting length, so packets from concurrent
//! connections never interleave. The read-back then goes through the
//! connection's own `LogReader`, bounded to that length, with the lock
//! released: a client that stops reading stalls only its own connection.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

/// Store handle shared between connection tasks.
pub type SharedStore = Arc<Mutex<PersistentStore>>;

/// The shared append-only log file.
#[derive(Debug)]
pub struct PersistentStore {
    path: PathBuf,
    file: File,
}

impl PersistentStore {
    /// Open (or create) the log at `path` for appending and reading.
    ///
    /// Existing contents are kept.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), "Opened packet log");
        Ok(Self { path, file })
    }

    /// Open the log and wrap it for sharing between connections.
    pub async fn open_shared(path: impl AsRef<Path>) -> io::Result<SharedStore> {
        Ok(Arc::new(Mutex::new(Self::open(path).await?)))
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a complete packet to the end of the log.
    ///
    /// Partial writes are retried until every byte is written.
    pub async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            match self.file.write(&data[written..]).await {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.file.flush().await?;
        trace!(bytes = data.len(), "Appended packet");
        Ok(())
    }

    /// Restore the position to the end of the log.
    ///
    /// Returns the log length, which after an append covers every packet
    /// written so far.
    pub async fn seek_end(&mut self) -> io::Result<u64> {
        self.file.seek(SeekFrom::End(0)).await
    }

    /// Open a read-only handle on the log for one connection.
    pub async fn reader(&self) -> io::Result<LogReader> {
        LogReader::open(&self.path).await
    }

    /// Current size of the log in bytes.
    pub async fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata().await?.len())
    }

    /// Delete the log file from disk.
    pub async fn remove(&self) -> io::Result<()> {
        tokio::fs::remove_file(&self.path).await?;
        debug!(path = %self.path.display(), "Removed packet log");
        Ok(())
    }
}

/// Per-connection read-only view of the log.
///
/// Reads are bounded to a prefix whose length was taken under the store
/// lock. The log is append-only, so that prefix never changes and can be
/// streamed without holding the lock.
#[derive(Debug)]
pub struct LogReader {
    file: File,
    remaining: u64,
}

impl LogReader {
    /// Open the log at `path` for reading.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self { file, remaining: 0 })
    }

    /// Move to the start of the log and limit reads to its first `len` bytes.
    pub async fn rewind(&mut self, len: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0)).await?;
        self.remaining = len;
        Ok(())
    }

    /// Read the next piece of the prefix into `buf`.
    ///
    /// Returns 0 once the prefix is exhausted or the file ends early.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(0);
        }
        loop {
            match self.file.read(&mut buf[..want]).await {
                Ok(n) => {
                    self.remaining -= n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
