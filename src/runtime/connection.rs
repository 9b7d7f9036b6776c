//! Connection state machine for a single client.
//!
//! A connection cycles through `Reading` -> `Persisting` -> `Echoing` ->
//! `Reading` once per complete packet and ends in `Closed` when the peer
//! closes its side or an I/O error occurs.

use crate::runtime::buffer::{PacketAccumulator, CHUNK_SIZE};
use crate::storage::{LogReader, SharedStore};
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accumulating bytes of the next packet.
    Reading,
    /// Appending a complete packet to the log.
    Persisting,
    /// Sending the whole log back to the client.
    Echoing,
    /// Peer closed the stream or an I/O error ended the connection.
    Closed,
}

/// Errors that end a connection.
#[derive(Debug)]
pub enum ConnectionError {
    /// Reading from or writing to the client socket failed.
    Socket(io::Error),
    /// Accessing the packet log failed.
    Store(io::Error),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Socket(e) => write!(f, "socket I/O failed: {}", e),
            ConnectionError::Store(e) => write!(f, "packet log I/O failed: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Socket(e) | ConnectionError::Store(e) => Some(e),
        }
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    state: ConnState,
    accumulator: PacketAccumulator,
    /// Read-only handle on the log, opened with the first packet.
    reader: Option<LogReader>,
    /// Complete packets handled so far.
    packets: u64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an accepted stream in initial reading state.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ConnState::Reading,
            accumulator: PacketAccumulator::new(),
            reader: None,
            packets: 0,
        }
    }

    /// Current connection state.
    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Number of complete packets handled.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Serve the connection until the peer closes it.
    ///
    /// Returns the number of packets handled. On error the connection is
    /// left in `Closed` state and the caller drops it.
    pub async fn serve(&mut self, store: &SharedStore) -> Result<u64, ConnectionError> {
        let result = self.serve_inner(store).await;
        self.state = ConnState::Closed;
        result.map(|()| self.packets)
    }

    async fn serve_inner(&mut self, store: &SharedStore) -> Result<(), ConnectionError> {
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            let n = self.read_chunk(&mut chunk).await?;
            if n == 0 {
                if !self.accumulator.is_empty() {
                    debug!(
                        bytes = self.accumulator.pending(),
                        "Dropping unterminated packet"
                    );
                }
                trace!("Connection closed by client");
                return Ok(());
            }

            self.accumulator.extend(&chunk[..n]);
            while let Some(packet) = self.accumulator.next_packet() {
                self.process_packet(packet, store).await?;
            }
        }
    }

    /// Read one chunk from the client, retrying interrupted reads.
    async fn read_chunk(&mut self, chunk: &mut [u8]) -> Result<usize, ConnectionError> {
        loop {
            match self.stream.read(chunk).await {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Socket(e)),
            }
        }
    }

    /// Append one packet and echo the log back.
    ///
    /// The store lock covers only the append and the length snapshot. The
    /// echo streams that prefix through this connection's own reader, so a
    /// client that stops reading never holds up other connections.
    async fn process_packet(
        &mut self,
        packet: Bytes,
        store: &SharedStore,
    ) -> Result<(), ConnectionError> {
        self.state = ConnState::Persisting;
        let snapshot = {
            let mut store = store.lock().await;
            store
                .append(&packet)
                .await
                .map_err(ConnectionError::Store)?;
            let len = store.seek_end().await.map_err(ConnectionError::Store)?;
            if self.reader.is_none() {
                self.reader = Some(store.reader().await.map_err(ConnectionError::Store)?);
            }
            len
        };

        self.state = ConnState::Echoing;
        let sent = self.echo_log(snapshot).await?;

        self.packets += 1;
        self.state = ConnState::Reading;
        trace!(packet_len = packet.len(), echoed = sent, "Processed packet");
        Ok(())
    }

    /// Stream the first `len` bytes of the log to the client.
    async fn echo_log(&mut self, len: u64) -> Result<u64, ConnectionError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };
        reader.rewind(len).await.map_err(ConnectionError::Store)?;

        let mut chunk = [0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = reader
                .read_chunk(&mut chunk)
                .await
                .map_err(ConnectionError::Store)?;
            if n == 0 {
                break;
            }
            self.stream
                .write_all(&chunk[..n])
                .await
                .map_err(ConnectionError::Socket)?;
            sent += n as u64;
        }
        self.stream.flush().await.map_err(ConnectionError::Socket)?;

        if sent < len {
            return Err(ConnectionError::Store(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "packet log shorter than its recorded length",
            )));
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::DELIMITER;
    use crate::storage::PersistentStore;
    use tokio_test::io::Builder;

    async fn temp_store() -> (tempfile::TempDir, SharedStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open_shared(dir.path().join("log"))
            .await
            .unwrap();
        (dir, store)
    }

    async fn log_contents(store: &SharedStore) -> Vec<u8> {
        let path = store.lock().await.path().to_path_buf();
        std::fs::read(path).unwrap()
    }

    #[tokio::test]
    async fn test_echo_accumulates_per_packet() {
        let (_dir, store) = temp_store().await;
        let mock = Builder::new()
            .read(b"hello\n")
            .write(b"hello\n")
            .read(b"world\n")
            .write(b"hello\nworld\n")
            .build();

        let mut conn = Connection::new(mock);
        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.serve(&store).await.unwrap(), 2);
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(log_contents(&store).await, b"hello\nworld\n");
    }

    #[tokio::test]
    async fn test_slow_client_split_reads() {
        let (_dir, store) = temp_store().await;
        let mock = Builder::new()
            .read(b"he")
            .read(b"l")
            .read(b"lo")
            .read(b"\n")
            .write(b"hello\n")
            .build();

        let mut conn = Connection::new(mock);
        assert_eq!(conn.serve(&store).await.unwrap(), 1);
        assert_eq!(log_contents(&store).await, b"hello\n");
    }

    #[tokio::test]
    async fn test_two_packets_in_one_read() {
        let (_dir, store) = temp_store().await;
        let mock = Builder::new()
            .read(b"one\ntwo\nthr")
            .write(b"one\n")
            .write(b"one\ntwo\n")
            .read(b"ee\n")
            .write(b"one\ntwo\nthree\n")
            .build();

        let mut conn = Connection::new(mock);
        assert_eq!(conn.serve(&store).await.unwrap(), 3);
        assert_eq!(log_contents(&store).await, b"one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn test_chunk_sized_packet() {
        let (_dir, store) = temp_store().await;
        let mut payload = vec![b'a'; CHUNK_SIZE - 1];
        payload.push(DELIMITER);

        let mock = Builder::new().read(&payload).write(&payload).build();

        let mut conn = Connection::new(mock);
        assert_eq!(conn.serve(&store).await.unwrap(), 1);
        assert_eq!(log_contents(&store).await, payload);
    }

    #[tokio::test]
    async fn test_packet_larger_than_chunk() {
        let (_dir, store) = temp_store().await;
        let mut payload = vec![b'b'; 2 * CHUNK_SIZE + 100];
        payload.push(DELIMITER);

        let mock = Builder::new().read(&payload).write(&payload).build();

        let mut conn = Connection::new(mock);
        assert_eq!(conn.serve(&store).await.unwrap(), 1);
        assert_eq!(log_contents(&store).await, payload);
    }

    #[tokio::test]
    async fn test_unterminated_tail_not_persisted() {
        let (_dir, store) = temp_store().await;
        let mock = Builder::new()
            .read(b"done\n")
            .write(b"done\n")
            .read(b"partial without newline")
            .build();

        let mut conn = Connection::new(mock);
        assert_eq!(conn.serve(&store).await.unwrap(), 1);
        assert_eq!(log_contents(&store).await, b"done\n");
    }

    #[tokio::test]
    async fn test_interrupted_read_is_retried() {
        let (_dir, store) = temp_store().await;
        let mock = Builder::new()
            .read(b"hel")
            .read_error(io::Error::new(io::ErrorKind::Interrupted, "eintr"))
            .read(b"lo\n")
            .write(b"hello\n")
            .build();

        let mut conn = Connection::new(mock);
        assert_eq!(conn.serve(&store).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_error_closes_connection() {
        let (_dir, store) = temp_store().await;
        let mock = Builder::new()
            .read(b"ok\n")
            .write(b"ok\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let mut conn = Connection::new(mock);
        let err = conn.serve(&store).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Socket(_)));
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(conn.packets(), 1);
    }

    #[tokio::test]
    async fn test_write_error_closes_connection() {
        let (_dir, store) = temp_store().await;
        let mock = Builder::new()
            .read(b"ping\n")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();

        let mut conn = Connection::new(mock);
        let err = conn.serve(&store).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Socket(_)));
        // The packet was persisted before the echo failed.
        assert_eq!(log_contents(&store).await, b"ping\n");
    }

    #[tokio::test]
    async fn test_connections_share_the_log() {
        let (_dir, store) = temp_store().await;

        let first = Builder::new().read(b"hello\n").write(b"hello\n").build();
        Connection::new(first).serve(&store).await.unwrap();

        let second = Builder::new()
            .read(b"world\n")
            .write(b"hello\nworld\n")
            .build();
        Connection::new(second).serve(&store).await.unwrap();

        assert_eq!(log_contents(&store).await, b"hello\nworld\n");
    }

    #[test]
    fn test_error_display() {
        let err = ConnectionError::Store(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert_eq!(err.to_string(), "packet log I/O failed: disk full");
    }
}
