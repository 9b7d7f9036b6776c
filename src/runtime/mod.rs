//! Per-connection runtime.
//!
//! Shared abstractions used by every connection task:
//! - `PacketAccumulator`: assembles delimiter-terminated packets from chunked reads
//! - `Connection`: connection state machine driving read, persist and echo

mod buffer;
mod connection;

pub(crate) use connection::{Connection, ConnectionError};

#[cfg(test)]
pub(crate) use buffer::CHUNK_SIZE;
