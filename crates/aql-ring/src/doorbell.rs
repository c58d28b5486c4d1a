//! Doorbell delivery.
//!
//! AQL-native hardware takes the 64-bit packet index as-is. Legacy hardware takes a 32-bit value
//! derived from it under a queue-local spinlock, and must never see a value that is not strictly
//! greater than the last one it was given.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::{AtomicU32, AtomicU64};
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::packet::PACKET_SIZE;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

/// The register a doorbell value ends up in.
///
/// Implementations must make every store performed by the caller before the write visible to the
/// consumer before the consumer can observe the write (release semantics).
pub trait DoorbellSink: Send + Sync {
    fn write_u64(&self, value: u64);
    fn write_u32(&self, value: u32);
}

/// A doorbell register mapped from the device.
pub struct MmioDoorbell {
    ptr: NonNull<u64>,
}

// SAFETY: the register is write-only device memory; writes are single volatile stores.
unsafe impl Send for MmioDoorbell {}
unsafe impl Sync for MmioDoorbell {}

impl MmioDoorbell {
    /// # Safety
    ///
    /// `ptr` must point at a mapped, 8-byte aligned doorbell register that outlives the value.
    pub unsafe fn from_raw(ptr: *mut u64) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr })
    }
}

impl DoorbellSink for MmioDoorbell {
    fn write_u64(&self, value: u64) {
        std::sync::atomic::fence(Ordering::Release);
        // SAFETY: see `from_raw`.
        unsafe { core::ptr::write_volatile(self.ptr.as_ptr(), value) };
    }

    fn write_u32(&self, value: u32) {
        std::sync::atomic::fence(Ordering::Release);
        // SAFETY: see `from_raw`; the low dword of the register is the legacy doorbell.
        unsafe { core::ptr::write_volatile(self.ptr.as_ptr().cast::<u32>(), value) };
    }
}

/// In-memory register that keeps every value written to it.
#[derive(Default)]
pub struct RecordingDoorbell {
    history: Mutex<Vec<u64>>,
}

impl RecordingDoorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<u64> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<u64> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .copied()
    }

    fn push(&self, value: u64) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(value);
    }
}

impl DoorbellSink for RecordingDoorbell {
    fn write_u64(&self, value: u64) {
        self.push(value);
    }

    fn write_u32(&self, value: u32) {
        self.push(value as u64);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoorbellKind {
    /// 64-bit AQL write index, stored directly.
    Aql64,
    /// Oldest parts: packet index wrapped into the ring, in dwords.
    LegacyDwordOffset,
    /// Raw 32-bit packet index.
    LegacyIndex,
}

impl DoorbellKind {
    pub fn is_legacy(self) -> bool {
        !matches!(self, Self::Aql64)
    }
}

/// Address model of the process: whether a 64-bit write index can be trusted as-is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexModel {
    Large,
    Small,
}

impl IndexModel {
    /// The model of the current process.
    pub const fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::Large
        } else {
            Self::Small
        }
    }
}

pub struct Doorbell {
    kind: DoorbellKind,
    model: IndexModel,
    ring_size: u32,
    queue_full_workaround: bool,
    lock: AtomicU32,
    max_dispatch_id_plus_1: AtomicU64,
    sink: Arc<dyn DoorbellSink>,
}

impl Doorbell {
    pub fn new(
        kind: DoorbellKind,
        model: IndexModel,
        ring_size: u32,
        queue_full_workaround: bool,
        sink: Arc<dyn DoorbellSink>,
    ) -> Self {
        Self {
            kind,
            model,
            ring_size,
            queue_full_workaround,
            lock: AtomicU32::new(0),
            max_dispatch_id_plus_1: AtomicU64::new(0),
            sink,
        }
    }

    pub fn kind(&self) -> DoorbellKind {
        self.kind
    }

    /// Highest id handed to legacy hardware so far; it doubles as the hardware write index when
    /// the queue is reconnected.
    pub fn max_dispatch_id_plus_1(&self) -> u64 {
        self.max_dispatch_id_plus_1.load(Ordering::Acquire)
    }

    /// Rings the doorbell for the packet at `value`.
    ///
    /// `indices` yields the queue's current `(write, read)` indices and is consulted only by the
    /// small index model.
    pub fn ring(&self, value: u64, indices: impl FnOnce() -> (u64, u64)) {
        if self.kind == DoorbellKind::Aql64 {
            self.sink.write_u64(value);
            return;
        }

        while self
            .lock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_yield();
        }

        let dispatch_id = match self.model {
            // Hardware expects the index one past the last packet to process.
            IndexModel::Large => value + 1,
            // A backwards doorbell is indistinguishable from 2^32 wrap here, so submit the write
            // index instead, clamped to one ring ahead of the read index. The remaining packets
            // get a later doorbell.
            IndexModel::Small => {
                let (write, read) = indices();
                write.min(read + self.ring_size as u64)
            }
        };

        if dispatch_id > self.max_dispatch_id_plus_1.load(Ordering::Relaxed) {
            self.max_dispatch_id_plus_1
                .store(dispatch_id, Ordering::Relaxed);
            match self.kind {
                DoorbellKind::LegacyDwordOffset => {
                    let span = (1 + self.queue_full_workaround as u64) * self.ring_size as u64;
                    let dwords = (dispatch_id & (span - 1)) * (PACKET_SIZE / 4) as u64;
                    self.sink.write_u32(dwords as u32);
                }
                DoorbellKind::LegacyIndex => self.sink.write_u32(dispatch_id as u32),
                DoorbellKind::Aql64 => unreachable!("handled above"),
            }
        } else {
            tracing::trace!(dispatch_id, "discarded stale doorbell");
        }

        self.lock.store(0, Ordering::Release);
    }
}

#[cfg(all(feature = "loom", test))]
#[inline]
fn spin_yield() {
    loom::thread::yield_now();
}

#[cfg(not(all(feature = "loom", test)))]
#[inline]
fn spin_yield() {
    std::thread::yield_now();
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::sync::atomic::AtomicU64 as LoomU64;

    struct LoomSink {
        value: LoomU64,
        writes: LoomU64,
    }

    impl DoorbellSink for LoomSink {
        fn write_u64(&self, value: u64) {
            self.value.store(value, Ordering::Release);
            self.writes.fetch_add(1, Ordering::Relaxed);
        }

        fn write_u32(&self, value: u32) {
            // Hardware would fault on a regression; make the model fail instead.
            let prev = self.value.swap(value as u64, Ordering::AcqRel);
            assert!(value as u64 > prev, "doorbell regressed from {prev} to {value}");
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn concurrent_legacy_rings_never_regress() {
        loom::model(|| {
            let sink = Arc::new(LoomSink {
                value: LoomU64::new(0),
                writes: LoomU64::new(0),
            });
            let db = Arc::new(Doorbell::new(
                DoorbellKind::LegacyIndex,
                IndexModel::Large,
                16,
                false,
                sink.clone(),
            ));

            let handles: Vec<_> = [2u64, 5]
                .into_iter()
                .map(|value| {
                    let db = db.clone();
                    loom::thread::spawn(move || db.ring(value, || (0, 0)))
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(sink.value.load(Ordering::Acquire), 6);
            let writes = sink.writes.load(Ordering::Relaxed);
            assert!(writes == 1 || writes == 2);
            assert_eq!(db.max_dispatch_id_plus_1(), 6);
        });
    }
}
