//! Per-agent scratch (private segment) backing memory.
//!
//! Queues start without scratch and acquire it the first time a dispatch reports that it needs
//! more than the queue holds. The pool is a first-fit free list over the agent's scratch
//! aperture.

use crate::signal::HostSignal;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// ORed into a queue's inactive signal when a large allocation elsewhere is released.
pub const SCRATCH_RETRY_BIT: i64 = i64::MIN;

const POOL_ALIGNMENT: u64 = 4096;

/// What a dispatch needs, derived from its packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScratchRequest {
    pub size_per_thread: u64,
    pub lanes_per_wave: u32,
    /// Enough for every scratch slot on the device.
    pub size: u64,
    /// Enough for the waves this dispatch can actually have in flight.
    pub dispatch_size: u64,
    pub wanted_slots: u64,
    pub waves_per_group: u64,
}

impl ScratchRequest {
    /// Sizing for a dispatch. `None` if a workgroup dimension is zero.
    pub fn for_dispatch(
        private_segment_size: u32,
        workgroup_size: [u16; 3],
        grid_size: [u32; 3],
        lanes_per_wave: u32,
        max_slots: u64,
    ) -> Option<Self> {
        if workgroup_size.contains(&0) {
            return None;
        }
        let lanes = lanes_per_wave as u64;
        let size_per_thread = align_up(private_segment_size as u64, 1024 / lanes);

        let [wx, wy, wz] = workgroup_size.map(u64::from);
        let waves_per_group = (wx * wy * wz).div_ceil(lanes);
        let groups = grid_size
            .iter()
            .zip([wx, wy, wz])
            .map(|(&g, w)| (g as u64).max(1).div_ceil(w))
            .product::<u64>();
        let wanted_slots = groups.saturating_mul(waves_per_group).min(max_slots);

        Some(Self {
            size_per_thread,
            lanes_per_wave,
            size: size_per_thread * max_slots * lanes,
            dispatch_size: size_per_thread * wanted_slots * lanes,
            wanted_slots,
            waves_per_group,
        })
    }

    /// Sizing when only the per-thread requirement is known, e.g. at queue creation.
    pub fn whole_device(private_segment_size: u32, lanes_per_wave: u32, max_slots: u64) -> Self {
        let lanes = lanes_per_wave as u64;
        let size_per_thread = align_up(private_segment_size as u64, 1024 / lanes);
        let size = size_per_thread * max_slots * lanes;
        Self {
            size_per_thread,
            lanes_per_wave,
            size,
            dispatch_size: size,
            wanted_slots: max_slots,
            waves_per_group: 1,
        }
    }
}

/// Scratch a queue holds, or is asking for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScratchInfo {
    pub base: Option<u64>,
    pub size: u64,
    pub size_per_thread: u64,
    pub lanes_per_wave: u32,
    pub wanted_slots: u64,
    pub dispatch_size: u64,
    /// Above the single-allocation limit; released as soon as the dispatch finishes if reclaim
    /// is enabled.
    pub large: bool,
    /// The last acquire failed but may succeed once outstanding large allocations are released.
    pub retry: bool,
}

impl ScratchInfo {
    pub fn is_allocated(&self) -> bool {
        self.base.is_some()
    }

    /// Held scratch is already enough for `req`.
    pub fn covers(&self, req: &ScratchRequest) -> bool {
        self.is_allocated()
            && self.lanes_per_wave == req.lanes_per_wave
            && self.size_per_thread >= req.size_per_thread
            && self.size >= req.dispatch_size
    }

    pub fn request(&mut self, req: &ScratchRequest) {
        self.size_per_thread = req.size_per_thread;
        self.lanes_per_wave = req.lanes_per_wave;
        self.size = req.size;
        self.dispatch_size = req.dispatch_size;
        self.wanted_slots = req.wanted_slots;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScratchStats {
    pub acquires: u64,
    pub releases: u64,
    pub failures: u64,
    pub bytes_in_use: u64,
    pub large_in_use: u32,
}

struct Pool {
    /// Free ranges keyed by start address.
    free: BTreeMap<u64, u64>,
    notifiers: Vec<Weak<HostSignal>>,
    stats: ScratchStats,
}

pub struct ScratchAllocator {
    single_limit: u64,
    async_reclaim: bool,
    pool: Mutex<Pool>,
}

impl ScratchAllocator {
    pub fn new(base: u64, bytes: u64, single_limit: u64, async_reclaim: bool) -> Self {
        let mut free = BTreeMap::new();
        if bytes > 0 {
            free.insert(base, bytes);
        }
        Self {
            single_limit,
            async_reclaim,
            pool: Mutex::new(Pool {
                free,
                notifiers: Vec::new(),
                stats: ScratchStats::default(),
            }),
        }
    }

    fn pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn async_reclaim(&self) -> bool {
        self.async_reclaim
    }

    pub fn single_limit(&self) -> u64 {
        self.single_limit
    }

    /// Backs `info.size` bytes, falling back to `info.dispatch_size`.
    ///
    /// On failure `info.base` stays `None`. `info.retry` is set when large allocations are
    /// outstanding, in which case `notify` receives [`SCRATCH_RETRY_BIT`] once one is released.
    pub fn acquire(&self, info: &mut ScratchInfo, notify: &Arc<HostSignal>) {
        debug_assert!(!info.is_allocated());
        let mut pool = self.pool();
        info.retry = false;
        info.large = false;

        let mut size = info.size;
        let mut base = carve(&mut pool.free, size);
        if base.is_none() && info.dispatch_size != 0 && info.dispatch_size < size {
            size = info.dispatch_size;
            base = carve(&mut pool.free, size);
        }

        match base {
            Some(base) => {
                info.base = Some(base);
                info.size = size;
                info.large = size > self.single_limit;
                pool.stats.acquires += 1;
                pool.stats.bytes_in_use += size;
                if info.large {
                    pool.stats.large_in_use += 1;
                }
                tracing::debug!(base, size, large = info.large, "scratch acquired");
            }
            None => {
                pool.stats.failures += 1;
                if pool.stats.large_in_use > 0 {
                    info.retry = true;
                    let already = pool
                        .notifiers
                        .iter()
                        .any(|w| w.as_ptr() == Arc::as_ptr(notify));
                    if !already {
                        pool.notifiers.push(Arc::downgrade(notify));
                    }
                }
                tracing::debug!(size, retry = info.retry, "scratch acquire failed");
            }
        }
    }

    pub fn release(&self, info: &mut ScratchInfo) {
        let Some(base) = info.base.take() else {
            return;
        };
        let notify = {
            let mut pool = self.pool();
            give_back(&mut pool.free, base, info.size);
            pool.stats.releases += 1;
            pool.stats.bytes_in_use -= info.size;
            if info.large {
                pool.stats.large_in_use -= 1;
                std::mem::take(&mut pool.notifiers)
            } else {
                Vec::new()
            }
        };
        tracing::debug!(base, size = info.size, large = info.large, "scratch released");
        info.large = false;

        for signal in notify.iter().filter_map(Weak::upgrade) {
            signal.or(SCRATCH_RETRY_BIT, Ordering::Release);
        }
    }

    /// Drops a queue's pending retry notification.
    pub fn forget(&self, notify: &Arc<HostSignal>) {
        self.pool()
            .notifiers
            .retain(|w| w.strong_count() > 0 && w.as_ptr() != Arc::as_ptr(notify));
    }

    pub fn stats(&self) -> ScratchStats {
        self.pool().stats
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

fn carve(free: &mut BTreeMap<u64, u64>, bytes: u64) -> Option<u64> {
    if bytes == 0 {
        return None;
    }
    let (start, len, at) = free.iter().find_map(|(&start, &len)| {
        let at = align_up(start, POOL_ALIGNMENT);
        (at + bytes <= start + len).then_some((start, len, at))
    })?;

    free.remove(&start);
    if at > start {
        free.insert(start, at - start);
    }
    let end = start + len;
    if at + bytes < end {
        free.insert(at + bytes, end - (at + bytes));
    }
    Some(at)
}

fn give_back(free: &mut BTreeMap<u64, u64>, mut base: u64, mut bytes: u64) {
    if let Some((&prev, &prev_len)) = free.range(..base).next_back() {
        if prev + prev_len == base {
            free.remove(&prev);
            base = prev;
            bytes += prev_len;
        }
    }
    if let Some(&next_len) = free.get(&(base + bytes)) {
        free.remove(&(base + bytes));
        bytes += next_len;
    }
    free.insert(base, bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Signal, SignalRuntime};
    use pretty_assertions::assert_eq;

    fn info(size: u64, dispatch_size: u64) -> ScratchInfo {
        ScratchInfo {
            size,
            dispatch_size,
            size_per_thread: 16,
            lanes_per_wave: 64,
            ..Default::default()
        }
    }

    #[test]
    fn sizing_for_wave64_and_wave32() {
        let r = ScratchRequest::for_dispatch(2048, [64, 1, 1], [256, 1, 1], 64, 1920).unwrap();
        assert_eq!(r.size_per_thread, 2048);
        assert_eq!(r.waves_per_group, 1);
        assert_eq!(r.wanted_slots, 4);
        assert_eq!(r.dispatch_size, 2048 * 4 * 64);
        assert_eq!(r.size, 2048 * 1920 * 64);

        let r = ScratchRequest::for_dispatch(100, [64, 1, 1], [64, 1, 1], 32, 1920).unwrap();
        assert_eq!(r.size_per_thread, 128);
        assert_eq!(r.waves_per_group, 2);
        assert_eq!(r.wanted_slots, 2);
    }

    #[test]
    fn sizing_rejects_empty_workgroups() {
        assert_eq!(
            ScratchRequest::for_dispatch(16, [0, 1, 1], [1, 1, 1], 64, 8),
            None
        );
    }

    #[test]
    fn wanted_slots_clamp_to_device() {
        let r = ScratchRequest::for_dispatch(16, [256, 1, 1], [1 << 20, 1, 1], 64, 100).unwrap();
        assert_eq!(r.wanted_slots, 100);
        assert_eq!(r.dispatch_size, r.size);
    }

    #[test]
    fn first_fit_with_coalescing() {
        let rt = SignalRuntime::new().unwrap();
        let sig = rt.create_signal(0);
        let alloc = ScratchAllocator::new(0x10_0000, 3 * 4096, u64::MAX, true);

        let mut a = info(4096, 4096);
        let mut b = info(4096, 4096);
        let mut c = info(4096, 4096);
        alloc.acquire(&mut a, &sig);
        alloc.acquire(&mut b, &sig);
        alloc.acquire(&mut c, &sig);
        assert_eq!(a.base, Some(0x10_0000));
        assert_eq!(b.base, Some(0x10_1000));
        assert_eq!(c.base, Some(0x10_2000));

        alloc.release(&mut a);
        alloc.release(&mut c);
        alloc.release(&mut b);

        let mut whole = info(3 * 4096, 3 * 4096);
        alloc.acquire(&mut whole, &sig);
        assert_eq!(whole.base, Some(0x10_0000));
        assert_eq!(alloc.stats().bytes_in_use, 3 * 4096);
    }

    #[test]
    fn falls_back_to_dispatch_size() {
        let rt = SignalRuntime::new().unwrap();
        let sig = rt.create_signal(0);
        let alloc = ScratchAllocator::new(0, 8192, u64::MAX, true);
        let mut i = info(1 << 20, 8192);
        alloc.acquire(&mut i, &sig);
        assert_eq!(i.base, Some(0));
        assert_eq!(i.size, 8192);
        assert!(!i.retry);
    }

    #[test]
    fn retry_is_signalled_when_large_memory_returns() {
        let rt = SignalRuntime::new().unwrap();
        let waiter = rt.create_signal(0);
        let alloc = ScratchAllocator::new(0, 64 * 1024, 16 * 1024, true);

        let mut big = info(64 * 1024, 64 * 1024);
        alloc.acquire(&mut big, &waiter);
        assert!(big.large);

        let mut small = info(8192, 8192);
        alloc.acquire(&mut small, &waiter);
        assert!(small.base.is_none());
        assert!(small.retry);
        assert_eq!(waiter.load(Ordering::Acquire), 0);

        alloc.release(&mut big);
        assert_eq!(waiter.load(Ordering::Acquire), SCRATCH_RETRY_BIT);
        assert_eq!(alloc.stats().large_in_use, 0);
    }

    #[test]
    fn no_retry_without_large_allocations() {
        let rt = SignalRuntime::new().unwrap();
        let sig = rt.create_signal(0);
        let alloc = ScratchAllocator::new(0, 4096, u64::MAX, true);
        let mut i = info(8192, 8192);
        alloc.acquire(&mut i, &sig);
        assert!(!i.retry);
        assert_eq!(alloc.stats().failures, 1);
    }
}
