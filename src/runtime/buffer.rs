//! Per-connection packet accumulation.
//!
//! Socket reads arrive in chunks of at most `CHUNK_SIZE` bytes and packet
//! boundaries do not line up with them. `PacketAccumulator` collects chunks
//! into a growable buffer and splits off one complete packet each time a
//! delimiter is seen.
//!
//! Bytes that follow a delimiter in the same chunk stay in the buffer as the
//! start of the next packet, so a chunk carrying several packets yields them
//! one after another.

use bytes::{Bytes, BytesMut};

/// Maximum bytes requested per socket or file read.
pub const CHUNK_SIZE: usize = 4096;

/// Byte that terminates a packet.
pub const DELIMITER: u8 = b'\n';

/// Growable buffer that assembles packets from chunked reads.
#[derive(Debug)]
pub struct PacketAccumulator {
    /// Bytes received but not yet handed out as a packet.
    buf: BytesMut,
    /// Prefix of `buf` already known to contain no delimiter.
    scanned: usize,
}

impl PacketAccumulator {
    /// Create an empty accumulator with room for one chunk.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(CHUNK_SIZE),
            scanned: 0,
        }
    }

    /// Append a freshly read chunk.
    ///
    /// Grows the buffer by at least `CHUNK_SIZE` whenever the chunk does not
    /// fit into the spare capacity.
    pub fn extend(&mut self, chunk: &[u8]) {
        if self.buf.capacity() - self.buf.len() < chunk.len() {
            self.buf.reserve(chunk.len() + CHUNK_SIZE);
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Split off the next complete packet, delimiter included.
    ///
    /// Only bytes appended since the last call are scanned. Returns `None`
    /// once the remaining bytes hold no delimiter.
    pub fn next_packet(&mut self) -> Option<Bytes> {
        match find_delimiter(&self.buf[self.scanned..]) {
            Some(pos) => {
                let end = self.scanned + pos + 1;
                self.scanned = 0;
                Some(self.buf.split_to(end).freeze())
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }

    /// Bytes of the packet currently being assembled.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Check if no partial packet is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current buffer capacity in bytes.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == DELIMITER)
}
