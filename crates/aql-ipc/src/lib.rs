//! Sharing memory and signals between processes.
//!
//! An exporter allocates blocks from a [`SharedMemoryPool`] and turns any page-aligned range of a
//! block into an [`IpcHandle`]. The handle is 32 bytes of plain data that can cross a process
//! boundary by any means; an importer's pool attaches it to a mapping of its own. [`IpcSignal`]
//! builds a signal on top of one shared block.

pub mod handle;
pub mod pool;
mod shm;
pub mod signal;

pub use handle::{IpcHandle, ShareToken, FRAGMENT_FLAG, HANDLE_MAGIC, MAX_FRAGMENT_PAGES};
pub use pool::{CallbackId, DeallocationCallback, PoolStats, SharedMemoryPool};
pub use signal::IpcSignal;

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("not an IPC handle (magic {0:#010x})")]
    InvalidHandle(u32),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("address {0:#x} is not inside a shareable allocation")]
    UnknownAddress(u64),
    #[error("address {0:#x} is not an attachment")]
    NotAttached(u64),
    #[error("{len} bytes at offset {offset} exceed the {block} byte block")]
    OutOfRange { offset: u64, len: u64, block: u64 },
    #[error("fragment offset of {0} pages does not fit in a handle")]
    FragmentTooFar(u64),
    #[error("shared block is {actual} bytes, handle says {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("shared block is gone")]
    Gone,
    #[error("shared block does not hold a signal")]
    NotASignal,
    #[error("failed to {op} shared memory")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}
