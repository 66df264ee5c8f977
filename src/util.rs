//! Internal utilities around raw pipe descriptors.

use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::time::Duration;

/// Creates an anonymous pipe, returning `(read_end, write_end)`.
///
/// Both ends are marked close-on-exec so they do not leak into children
/// spawned by the embedding application.
///
/// # Errors
///
/// Returns the OS error if the pipe cannot be created.
pub fn pipe() -> io::Result<(File, File)> {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    // SAFETY: `fds` is a valid two-element array for `pipe` to fill.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `pipe` succeeded, so both descriptors are open and owned by us.
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    set_cloexec(fds[0])?;
    set_cloexec(fds[1])?;
    Ok((read, write))
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is an open descriptor; F_GETFD/F_SETFD only touch its flags.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Waits up to `timeout` for `fd` to become readable (data or end-of-stream).
///
/// `None` blocks indefinitely. Interrupted waits report "not readable".
#[must_use]
pub fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.map_or(-1, |t| {
        libc::c_int::try_from(t.as_millis()).unwrap_or(libc::c_int::MAX)
    });
    // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
    let ready = unsafe { libc::poll(&raw mut pfd, 1, millis) };
    ready > 0 && pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0
}
