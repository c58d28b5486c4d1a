//! Shareable allocations, their exports and imports.

use crate::handle::{IpcHandle, ShareToken};
use crate::shm::{self, Mapping};
use crate::IpcError;
use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Runs with the block's address just before the block is freed.
pub type DeallocationCallback = Box<dyn FnOnce(u64) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub blocks: usize,
    pub block_bytes: u64,
    pub attachments: usize,
}

// Serials are process-wide so two pools never race for one object name.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);
const CREATE_ATTEMPTS: usize = 8;

struct Block {
    token: ShareToken,
    name: CString,
    mapping: Mapping,
    callbacks: Vec<(CallbackId, DeallocationCallback)>,
}

struct Attachment {
    token: ShareToken,
    _mapping: Mapping,
}

#[derive(Default)]
struct State {
    // Keyed by base address.
    blocks: BTreeMap<usize, Block>,
    // Keyed by the address handed out, which includes the fragment offset.
    attachments: HashMap<usize, Attachment>,
    next_callback: u64,
}

impl State {
    fn block_containing(&mut self, addr: usize) -> Option<&mut Block> {
        self.blocks
            .range_mut(..=addr)
            .next_back()
            .map(|(_, block)| block)
            .filter(|block| block.mapping.contains(addr))
    }
}

pub struct SharedMemoryPool {
    pid: u32,
    page: usize,
    state: Mutex<State>,
}

impl SharedMemoryPool {
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            page: aql_ring::page_size(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn page_size(&self) -> usize {
        self.page
    }

    /// Allocates at least `len` zeroed bytes that can later be exported. The block is rounded up
    /// to whole pages.
    pub fn allocate(&self, len: usize) -> Result<NonNull<u8>, IpcError> {
        if len == 0 {
            return Err(IpcError::InvalidArgument("zero-length allocation"));
        }
        let len = len
            .checked_next_multiple_of(self.page)
            .ok_or(IpcError::InvalidArgument("allocation too large"))?;

        let mut last = None;
        for _ in 0..CREATE_ATTEMPTS {
            let token = ShareToken {
                pid: self.pid,
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                len: len as u64,
            };
            let name = token.object_name();
            match shm::create(&name, len) {
                Ok(mapping) => {
                    let ptr = mapping.ptr;
                    tracing::debug!(
                        serial = token.serial,
                        len,
                        base = ptr.as_ptr() as u64,
                        "allocated shareable block"
                    );
                    self.state().blocks.insert(
                        mapping.address(),
                        Block {
                            token,
                            name,
                            mapping,
                            callbacks: Vec::new(),
                        },
                    );
                    return Ok(ptr);
                }
                // A stale object from an earlier process with our pid.
                Err(IpcError::Os { source, .. })
                    if source.kind() == io::ErrorKind::AlreadyExists =>
                {
                    tracing::trace!(serial = token.serial, "shared object name taken");
                    last = Some(source);
                }
                Err(err) => return Err(err),
            }
        }
        Err(IpcError::Os {
            op: "create",
            source: last.unwrap_or_else(|| io::Error::from(io::ErrorKind::AlreadyExists)),
        })
    }

    /// Makes `len` bytes at `ptr` importable by other processes.
    ///
    /// The range must lie inside one block and start on a page boundary. Ranges that do not
    /// start at the block base become fragment handles.
    pub fn export(&self, ptr: *const u8, len: usize) -> Result<IpcHandle, IpcError> {
        if len == 0 {
            return Err(IpcError::InvalidArgument("zero-length export"));
        }
        let addr = ptr as usize;
        let mut state = self.state();
        let block = state
            .block_containing(addr)
            .ok_or(IpcError::UnknownAddress(addr as u64))?;

        let offset = addr - block.mapping.address();
        if offset + len > block.mapping.len {
            return Err(IpcError::OutOfRange {
                offset: offset as u64,
                len: len as u64,
                block: block.mapping.len as u64,
            });
        }
        if offset % self.page != 0 {
            return Err(IpcError::InvalidArgument(
                "exported range must start on a page boundary",
            ));
        }

        let handle = IpcHandle::new(block.token);
        let handle = if offset == 0 {
            handle
        } else {
            handle.with_fragment((offset / self.page) as u64)?
        };
        tracing::debug!(
            serial = block.token.serial,
            offset,
            len,
            "exported shared range"
        );
        Ok(handle)
    }

    /// Maps the range a handle names into this process. `len` bytes past the fragment offset
    /// must fit in the block.
    pub fn attach(&self, handle: &IpcHandle, len: usize) -> Result<NonNull<u8>, IpcError> {
        let token = handle.token()?;
        if len == 0 {
            return Err(IpcError::InvalidArgument("zero-length attach"));
        }
        let offset = handle.fragment_pages().unwrap_or(0) as u64 * self.page as u64;
        if offset + len as u64 > token.len {
            return Err(IpcError::OutOfRange {
                offset,
                len: len as u64,
                block: token.len,
            });
        }

        let mapping = shm::open(&token.object_name(), token.len)?;
        // SAFETY: `offset < token.len`, the length of the mapping, so the result is in bounds and
        // non-null.
        let ptr = unsafe { NonNull::new_unchecked(mapping.ptr.as_ptr().add(offset as usize)) };
        tracing::debug!(
            pid = token.pid,
            serial = token.serial,
            offset,
            "attached shared range"
        );
        self.state().attachments.insert(
            ptr.as_ptr() as usize,
            Attachment {
                token,
                _mapping: mapping,
            },
        );
        Ok(ptr)
    }

    /// Unmaps a pointer returned by [`attach`](Self::attach).
    pub fn detach(&self, ptr: *const u8) -> Result<(), IpcError> {
        let attachment = self
            .state()
            .attachments
            .remove(&(ptr as usize))
            .ok_or(IpcError::NotAttached(ptr as u64))?;
        tracing::debug!(serial = attachment.token.serial, "detached shared range");
        Ok(())
    }

    /// Arranges for `callback` to run when the block containing `ptr` is freed.
    pub fn register_deallocation_callback(
        &self,
        ptr: *const u8,
        callback: impl FnOnce(u64) + Send + 'static,
    ) -> Result<CallbackId, IpcError> {
        let mut state = self.state();
        let id = CallbackId(state.next_callback);
        let block = state
            .block_containing(ptr as usize)
            .ok_or(IpcError::UnknownAddress(ptr as u64))?;
        block.callbacks.push((id, Box::new(callback)));
        state.next_callback += 1;
        Ok(id)
    }

    pub fn deregister_deallocation_callback(
        &self,
        ptr: *const u8,
        id: CallbackId,
    ) -> Result<(), IpcError> {
        let mut state = self.state();
        let block = state
            .block_containing(ptr as usize)
            .ok_or(IpcError::UnknownAddress(ptr as u64))?;
        let before = block.callbacks.len();
        block.callbacks.retain(|(cb, _)| *cb != id);
        if block.callbacks.len() == before {
            return Err(IpcError::InvalidArgument("no such deallocation callback"));
        }
        Ok(())
    }

    /// Frees a block returned by [`allocate`](Self::allocate).
    ///
    /// Deallocation callbacks run first, in registration order, while the memory is still
    /// mapped. Importers keep their mappings; new attaches fail.
    pub fn free(&self, ptr: *const u8) -> Result<(), IpcError> {
        let block = self
            .state()
            .blocks
            .remove(&(ptr as usize))
            .ok_or(IpcError::UnknownAddress(ptr as u64))?;
        release(block);
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            blocks: state.blocks.len(),
            block_bytes: state.blocks.values().map(|b| b.token.len).sum(),
            attachments: state.attachments.len(),
        }
    }
}

impl Default for SharedMemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

fn release(block: Block) {
    let base = block.mapping.address() as u64;
    // Outside the pool lock: callbacks may call back into the pool.
    for (_, callback) in block.callbacks {
        callback(base);
    }
    if let Err(err) = shm::unlink(&block.name) {
        tracing::warn!(serial = block.token.serial, error = %err, "failed to unlink shared block");
    }
    tracing::debug!(serial = block.token.serial, "freed shareable block");
}

impl Drop for SharedMemoryPool {
    fn drop(&mut self) {
        let state = std::mem::take(&mut *self.state());
        for block in state.blocks.into_values() {
            release(block);
        }
    }
}

impl core::fmt::Debug for SharedMemoryPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedMemoryPool")
            .field("pid", &self.pid)
            .field("stats", &self.stats())
            .finish()
    }
}
