//! User-mode queues.
//!
//! [`AqlQueue`] owns a hardware queue. [`InterceptQueue`] puts a proxy ring in front of one so
//! packets can be rewritten before hardware sees them. Producers use either through [`Queue`].

mod aql;
pub mod cu_mask;
pub mod faults;
mod intercept;
pub mod pm4;

pub use aql::{AqlQueue, ErrorCallback, QueueOptions, QueueState};
pub(crate) use aql::AqlCore;
pub use cu_mask::CuMaskOutcome;
pub use intercept::{InterceptQueue, Interceptor, MarkerCallback, PacketWriter};

use crate::error::RuntimeError;
use aql_ring::{AqlPacket, RingBuffer};
use std::sync::atomic::Ordering;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueuePriority {
    Low,
    #[default]
    Normal,
    High,
}

impl QueuePriority {
    /// Driver priority, 0 (lowest) through 15.
    pub fn to_kfd(self) -> u32 {
        match self {
            Self::Low => 3,
            Self::Normal => 7,
            Self::High => 11,
        }
    }
}

pub trait Queue: Send + Sync {
    fn id(&self) -> u64;

    /// Slots in the producer-visible ring.
    fn size(&self) -> u32;

    fn ring(&self) -> &RingBuffer;

    fn load_read_index(&self, order: Ordering) -> u64;

    fn load_write_index(&self, order: Ordering) -> u64;

    fn store_write_index(&self, value: u64, order: Ordering);

    /// Returns the value observed; the store happened iff it equals `expected`.
    fn cas_write_index(&self, expected: u64, value: u64, order: Ordering) -> u64;

    fn add_write_index(&self, delta: u64, order: Ordering) -> u64;

    /// Tells the consumer that packets up to and including `index` are ready.
    fn ring_doorbell(&self, index: u64);

    fn set_cu_masking(&self, mask: &[u32]) -> Result<CuMaskOutcome, RuntimeError>;

    fn cu_masking(&self) -> Vec<u32>;

    /// Runs raw PM4 commands on the queue and waits for them to finish.
    fn execute_pm4(&self, commands: &[u32]) -> Result<(), RuntimeError>;

    fn set_priority(&self, priority: QueuePriority) -> Result<(), RuntimeError>;

    /// Stops the queue for good. Repeated calls succeed.
    fn inactivate(&self) -> Result<(), RuntimeError>;
}

/// Reserves `count` consecutive slots and returns the first index.
///
/// Spins (yielding) while the ring is too full, so a stalled consumer stalls the caller.
pub fn reserve_slots(queue: &dyn Queue, count: u64) -> Result<u64, RuntimeError> {
    let size = queue.size() as u64;
    if count == 0 || count > size {
        return Err(RuntimeError::InvalidArgument("slot count exceeds queue size"));
    }
    let mut write = queue.load_write_index(Ordering::Relaxed);
    loop {
        let read = queue.load_read_index(Ordering::Acquire);
        if write + count - read > size {
            std::thread::yield_now();
            write = queue.load_write_index(Ordering::Relaxed);
            continue;
        }
        let observed = queue.cas_write_index(write, write + count, Ordering::AcqRel);
        if observed == write {
            return Ok(write);
        }
        write = observed;
    }
}

/// Copies `packets` into the ring, header last, and rings the doorbell once.
pub fn submit_packets(queue: &dyn Queue, packets: &[AqlPacket]) -> Result<u64, RuntimeError> {
    let first = reserve_slots(queue, packets.len() as u64)?;
    let ring = queue.ring();
    for (i, packet) in packets.iter().enumerate() {
        ring.publish(first + i as u64, packet);
    }
    queue.ring_doorbell(first + packets.len() as u64 - 1);
    Ok(first)
}
