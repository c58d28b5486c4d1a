//! The pipe the driver writes a byte to whenever a debug event is pending.

use crate::DebugError;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

pub(crate) struct EventPipe {
    read: OwnedFd,
    write: OwnedFd,
}

fn pipe_err(op: &'static str) -> DebugError {
    DebugError::Pipe {
        op,
        source: io::Error::last_os_error(),
    }
}

impl EventPipe {
    pub(crate) fn new() -> Result<Self, DebugError> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for both ends.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            return Err(pipe_err("create"));
        }
        // SAFETY: both fds were just returned by pipe2 and are owned by nobody else.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { read, write })
    }

    /// The end handed to the driver.
    pub(crate) fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Waits for the read end to become readable, retrying on `EINTR`.
    pub(crate) fn poll(&self, timeout: Option<Duration>) -> Result<bool, DebugError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let millis = match deadline {
                None => -1,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    // Round up so a short timeout still sleeps.
                    left.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int
                }
            };
            let mut pfd = libc::pollfd {
                fd: self.read.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: one valid pollfd.
            let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
            if rc < 0 {
                if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(pipe_err("poll"));
            }
            return Ok(rc > 0 && pfd.revents & libc::POLLIN != 0);
        }
    }

    /// Reads exactly the bytes the kernel reports as pending and returns how many there were.
    pub(crate) fn drain(&self) -> Result<usize, DebugError> {
        let mut pending: libc::c_int = 0;
        // SAFETY: FIONREAD writes one int.
        if unsafe { libc::ioctl(self.read.as_raw_fd(), libc::FIONREAD, &mut pending) } != 0 {
            return Err(pipe_err("size"));
        }
        let pending = pending.max(0) as usize;
        let mut buf = vec![0u8; pending];
        let mut done = 0;
        while done < pending {
            // SAFETY: `buf[done..]` is writable.
            let rc = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf[done..].as_mut_ptr().cast(),
                    pending - done,
                )
            };
            if rc < 0 {
                if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(pipe_err("drain"));
            }
            if rc == 0 {
                break;
            }
            done += rc as usize;
        }
        Ok(done)
    }

    /// Number of unread bytes, for tests.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        let mut pending: libc::c_int = 0;
        // SAFETY: FIONREAD writes one int.
        unsafe { libc::ioctl(self.read.as_raw_fd(), libc::FIONREAD, &mut pending) };
        pending.max(0) as usize
    }
}
