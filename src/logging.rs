//! Logging setup.
//!
//! Events are formatted by `tracing_subscriber::fmt` and written either to
//! standard error or to the system log. The syslog writer buffers one
//! formatted event and hands it to `syslog(3)` when dropped, at a priority
//! derived from the event level.

use crate::config::{Config, LogTarget};
use std::ffi::CString;
use std::io;
use std::os::raw::c_int;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Identity attached to every syslog record.
const SYSLOG_IDENT: &[u8] = b"append-echo\0";

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level.
pub fn init(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_target {
        LogTarget::Stderr => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(io::stderr)
            .init(),
        LogTarget::Syslog => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .with_level(false)
            .with_writer(Syslog::open())
            .init(),
    }
}

/// `MakeWriter` that routes events to the system log.
#[derive(Debug)]
pub struct Syslog {
    _private: (),
}

impl Syslog {
    /// Open the system log with facility LOG_USER.
    pub fn open() -> Self {
        // SAFETY: SYSLOG_IDENT is NUL-terminated and 'static, as openlog
        // keeps the pointer.
        unsafe {
            libc::openlog(SYSLOG_IDENT.as_ptr().cast(), libc::LOG_PID, libc::LOG_USER);
        }
        Syslog { _private: () }
    }
}

impl<'a> MakeWriter<'a> for Syslog {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter::new(libc::LOG_INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter::new(priority_for(meta.level()))
    }
}

/// Map a tracing level to a syslog priority.
fn priority_for(level: &Level) -> c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
    }
}

/// Buffers one formatted event and submits it on drop.
#[derive(Debug)]
pub struct SyslogWriter {
    priority: c_int,
    buf: Vec<u8>,
}

impl SyslogWriter {
    fn new(priority: c_int) -> Self {
        Self {
            priority,
            buf: Vec::with_capacity(256),
        }
    }

    /// The record as passed to syslog: no trailing newline, no interior NULs.
    fn message(&self) -> Option<CString> {
        let mut line = self.buf.as_slice();
        while let Some((&b'\n', rest)) = line.split_last() {
            line = rest;
        }
        if line.is_empty() {
            return None;
        }
        let cleaned: Vec<u8> = line.iter().map(|&b| if b == 0 { b' ' } else { b }).collect();
        CString::new(cleaned).ok()
    }
}

impl io::Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        if let Some(msg) = self.message() {
            // SAFETY: both format and message are valid NUL-terminated strings.
            unsafe {
                libc::syslog(self.priority, b"%s\0".as_ptr().cast(), msg.as_ptr());
            }
        }
    }
}
