//! POSIX shared-memory objects and their mappings.

use crate::IpcError;
use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

/// An owned shared view, unmapped on drop.
pub(crate) struct Mapping {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) len: usize,
}

// SAFETY: the mapping is plain memory owned by this value; users synchronize through atomics.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub(crate) fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.address() && addr < self.address() + self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `ptr..ptr+len` was mapped by `map` and nothing else unmaps it.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if rc != 0 {
            tracing::warn!(
                len = self.len,
                error = %io::Error::last_os_error(),
                "munmap of shared memory failed"
            );
        }
    }
}

fn os(op: &'static str) -> IpcError {
    IpcError::Os {
        op,
        source: io::Error::last_os_error(),
    }
}

fn map(fd: &OwnedFd, len: usize) -> Result<Mapping, IpcError> {
    // SAFETY: fresh shared mapping of an fd we own, no address hint.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(os("map"));
    }
    let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(IpcError::Os {
        op: "map",
        source: io::Error::from(io::ErrorKind::OutOfMemory),
    })?;
    Ok(Mapping { ptr, len })
}

/// Creates the named object with `len` zero bytes and maps it.
///
/// Fails with an `AlreadyExists` source if the name is taken.
pub(crate) fn create(name: &CStr, len: usize) -> Result<Mapping, IpcError> {
    // SAFETY: `name` is NUL-terminated.
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
            0o600 as libc::mode_t,
        )
    };
    if fd < 0 {
        return Err(os("create"));
    }
    // SAFETY: `fd` was just returned by shm_open and is owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: plain syscall on an fd we own.
    let sized = unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } == 0;
    let mapping = if sized { map(&fd, len) } else { Err(os("size")) };
    if mapping.is_err() {
        let _ = unlink(name);
    }
    mapping
}

/// Maps the whole named object, which must be `expected_len` bytes.
pub(crate) fn open(name: &CStr, expected_len: u64) -> Result<Mapping, IpcError> {
    // SAFETY: `name` is NUL-terminated.
    let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC, 0) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return Err(match err.kind() {
            io::ErrorKind::NotFound => IpcError::Gone,
            _ => IpcError::Os {
                op: "open",
                source: err,
            },
        });
    }
    // SAFETY: `fd` was just returned by shm_open and is owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: `stat` is plain data; fstat fills it on success.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: valid fd and out-pointer.
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
        return Err(os("inspect"));
    }
    let actual = stat.st_size as u64;
    if actual != expected_len {
        return Err(IpcError::SizeMismatch {
            expected: expected_len,
            actual,
        });
    }
    map(&fd, actual as usize)
}

pub(crate) fn unlink(name: &CStr) -> Result<(), IpcError> {
    // SAFETY: `name` is NUL-terminated.
    if unsafe { libc::shm_unlink(name.as_ptr()) } != 0 {
        return Err(os("unlink"));
    }
    Ok(())
}
