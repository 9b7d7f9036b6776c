//! Background mode.
//!
//! Detaches the process from its controlling terminal. Must run after the
//! listening socket is bound, so bind errors still reach the terminal, and
//! before the tokio runtime starts, since forking a multi-threaded process
//! only carries the calling thread into the child.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use tracing::debug;

/// Fork into the background and detach from the terminal.
///
/// The parent exits with status 0. In the child this starts a new session,
/// changes to `/` and points stdin, stdout and stderr at `/dev/null`.
pub fn daemonize() -> io::Result<()> {
    // SAFETY: called before any other thread is started.
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }

    // SAFETY: plain syscall without pointer arguments.
    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error());
    }

    std::env::set_current_dir("/")?;

    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call.
        if unsafe { libc::dup2(devnull.as_raw_fd(), fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    debug!(pid = std::process::id(), "Detached from terminal");
    Ok(())
}
