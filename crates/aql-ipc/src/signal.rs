//! Signals that live in shared memory.

use crate::handle::IpcHandle;
use crate::pool::SharedMemoryPool;
use crate::IpcError;
use aql_runtime::{Condition, Signal};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// `b"AQLSIGNL"` as a little-endian `u64`.
const SIGNAL_MAGIC: u64 = 0x4C4E_4749_534C_5141;

#[repr(C)]
struct SignalBlock {
    value: AtomicI64,
    magic: AtomicU64,
}

const SIGNAL_BYTES: usize = std::mem::size_of::<SignalBlock>();

const SPINS: u32 = 64;
const MAX_BACKOFF: Duration = Duration::from_millis(1);

/// A signal whose value is visible to every process that attached its handle.
///
/// Waiting polls: there is no cross-process bell.
pub struct IpcSignal {
    pool: Arc<SharedMemoryPool>,
    block: NonNull<SignalBlock>,
    handle: IpcHandle,
    owner: bool,
}

// SAFETY: the block is only touched through atomics and stays mapped for the signal's lifetime.
unsafe impl Send for IpcSignal {}
unsafe impl Sync for IpcSignal {}

impl IpcSignal {
    pub fn create(pool: &Arc<SharedMemoryPool>, initial: i64) -> Result<Self, IpcError> {
        let ptr = pool.allocate(SIGNAL_BYTES)?;
        let block = ptr.cast::<SignalBlock>();
        // SAFETY: fresh page-aligned mapping of at least SIGNAL_BYTES, nobody else has it yet.
        unsafe {
            block.as_ptr().write(SignalBlock {
                value: AtomicI64::new(initial),
                magic: AtomicU64::new(SIGNAL_MAGIC),
            })
        };
        let handle = match pool.export(ptr.as_ptr(), SIGNAL_BYTES) {
            Ok(handle) => handle,
            Err(err) => {
                let _ = pool.free(ptr.as_ptr());
                return Err(err);
            }
        };
        Ok(Self {
            pool: pool.clone(),
            block,
            handle,
            owner: true,
        })
    }

    pub fn attach(pool: &Arc<SharedMemoryPool>, handle: &IpcHandle) -> Result<Self, IpcError> {
        let ptr = pool.attach(handle, SIGNAL_BYTES)?;
        let signal = Self {
            pool: pool.clone(),
            block: ptr.cast(),
            handle: *handle,
            owner: false,
        };
        if signal.block().magic.load(Ordering::Acquire) != SIGNAL_MAGIC {
            // Dropping detaches.
            return Err(IpcError::NotASignal);
        }
        tracing::debug!(serial = handle.token()?.serial, "attached IPC signal");
        Ok(signal)
    }

    fn block(&self) -> &SignalBlock {
        // SAFETY: mapped and initialized for as long as `self` lives.
        unsafe { self.block.as_ref() }
    }

    pub fn handle(&self) -> IpcHandle {
        self.handle
    }

    /// Whether this process created the signal.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn add(&self, v: i64, order: Ordering) -> i64 {
        self.block().value.fetch_add(v, order)
    }

    pub fn sub(&self, v: i64, order: Ordering) -> i64 {
        self.block().value.fetch_sub(v, order)
    }

    pub fn exchange(&self, v: i64, order: Ordering) -> i64 {
        self.block().value.swap(v, order)
    }

    /// Returns the value observed; the swap happened iff it equals `expected`.
    pub fn compare_exchange(&self, expected: i64, v: i64, order: Ordering) -> i64 {
        match self
            .block()
            .value
            .compare_exchange(expected, v, order, Ordering::Acquire)
        {
            Ok(prev) | Err(prev) => prev,
        }
    }

    /// Polls until `condition` holds against `compare` or `timeout` elapses; returns the last
    /// value observed.
    pub fn wait(&self, condition: Condition, compare: i64, timeout: Option<Duration>) -> i64 {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut spins = 0;
        let mut backoff = Duration::from_micros(10);
        loop {
            let value = self.load(Ordering::Acquire);
            if condition.holds(value, compare) {
                return value;
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return value;
            }
            if spins < SPINS {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }
            let nap = deadline.map_or(backoff, |d| backoff.min(d - now));
            thread::sleep(nap);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

impl Signal for IpcSignal {
    fn load(&self, order: Ordering) -> i64 {
        self.block().value.load(order)
    }

    fn store(&self, value: i64, order: Ordering) {
        self.block().value.store(value, order);
    }
}

impl Drop for IpcSignal {
    fn drop(&mut self) {
        let ptr = self.block.as_ptr().cast::<u8>();
        let result = if self.owner {
            self.pool.free(ptr)
        } else {
            self.pool.detach(ptr)
        };
        if let Err(err) = result {
            tracing::warn!(owner = self.owner, error = %err, "failed to release IPC signal");
        }
    }
}

impl core::fmt::Debug for IpcSignal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IpcSignal")
            .field("owner", &self.owner)
            .field("value", &self.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wait_times_out_with_last_value() {
        let pool = Arc::new(SharedMemoryPool::new());
        let signal = IpcSignal::create(&pool, 5).unwrap();
        let started = Instant::now();
        assert_eq!(
            signal.wait(Condition::Eq, 0, Some(Duration::from_millis(20))),
            5
        );
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn atomics_return_previous_values() {
        let pool = Arc::new(SharedMemoryPool::new());
        let signal = IpcSignal::create(&pool, 1).unwrap();
        assert_eq!(signal.add(2, Ordering::AcqRel), 1);
        assert_eq!(signal.sub(1, Ordering::AcqRel), 3);
        assert_eq!(signal.exchange(9, Ordering::AcqRel), 2);
        assert_eq!(signal.compare_exchange(0, 1, Ordering::AcqRel), 9);
        assert_eq!(signal.compare_exchange(9, 1, Ordering::AcqRel), 9);
        assert_eq!(signal.load(Ordering::Acquire), 1);
    }

    #[test]
    fn plain_memory_is_not_a_signal() {
        let pool = Arc::new(SharedMemoryPool::new());
        let ptr = pool.allocate(64).unwrap();
        let handle = pool.export(ptr.as_ptr(), 64).unwrap();
        assert!(matches!(
            IpcSignal::attach(&pool, &handle),
            Err(IpcError::NotASignal)
        ));
        // The failed attach did not leak its mapping.
        assert_eq!(pool.stats().attachments, 0);
    }

    #[test]
    fn dropping_the_owner_frees_the_block() {
        let pool = Arc::new(SharedMemoryPool::new());
        let signal = IpcSignal::create(&pool, 0).unwrap();
        assert!(signal.is_owner());
        assert_eq!(pool.stats().blocks, 1);
        drop(signal);
        assert_eq!(pool.stats().blocks, 0);
    }
}
