//! Packet-rewriting proxy in front of a hardware queue.
//!
//! Producers write into a software ring and ring its doorbell exactly as they would a hardware
//! queue. Each doorbell drains the proxy ring through the registered interceptors, newest
//! first, and whatever reaches the end of the chain is copied onto the hardware ring. When the
//! hardware ring is full the remainder waits in an overflow buffer and a barrier packet is
//! placed whose completion wakes the proxy up again. A hardware ring with no room even for
//! the barrier leaves the handler polling it with a growing backoff until a slot frees.

use super::cu_mask::CuMaskOutcome;
use super::{AqlQueue, Queue, QueuePriority};
use crate::error::RuntimeError;
use crate::signal::{Condition, HostSignal, Signal, SignalRuntime};
use aql_ring::{AqlPacket, BarrierAndPacket, InterceptMarker, RingBuffer, RingLimits};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

const PROXY_LIMITS: RingLimits = RingLimits::new(1, 1 << 24);

/// Stored into the async doorbell to retire its handler.
const QUIT_SENTINEL: i64 = i64::MAX;

const TEARDOWN_POLL: Duration = Duration::from_micros(100);

const STALL_BACKOFF_MIN: Duration = Duration::from_micros(10);
const STALL_BACKOFF_MAX: Duration = Duration::from_millis(1);

/// A stage of the rewrite chain.
///
/// `packets` come from the proxy ring (or an outer stage) in submission order; `packet_index`
/// is the proxy index of the first. Whatever should continue towards hardware goes through
/// `writer`, any number of times, in any number of packets.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, packets: &[AqlPacket], packet_index: u64, writer: &mut PacketWriter<'_>);
}

impl<F> Interceptor for F
where
    F: Fn(&[AqlPacket], u64, &mut PacketWriter<'_>) + Send + Sync,
{
    fn intercept(&self, packets: &[AqlPacket], packet_index: u64, writer: &mut PacketWriter<'_>) {
        self(packets, packet_index, writer)
    }
}

/// Invoked when an intercept marker reaches its position in the hardware stream.
pub type MarkerCallback = Arc<dyn Fn(&InterceptMarker) + Send + Sync>;

/// Hands packets to the next stage inward; the innermost stage is the hardware ring.
pub struct PacketWriter<'a> {
    core: &'a InterceptCore,
    state: &'a mut ProxyState,
    stages: &'a [Arc<dyn Interceptor>],
    packet_index: u64,
}

impl PacketWriter<'_> {
    pub fn write(&mut self, packets: &[AqlPacket]) {
        if packets.is_empty() {
            return;
        }
        match self.stages.split_last() {
            Some((stage, inner)) => {
                let mut writer = PacketWriter {
                    core: self.core,
                    state: &mut *self.state,
                    stages: inner,
                    packet_index: self.packet_index,
                };
                stage.intercept(packets, self.packet_index, &mut writer);
            }
            None => self.core.submit(self.state, packets),
        }
    }
}

struct ProxyState {
    /// Next proxy index to take from the ring.
    next_packet: u64,
    /// Packets past the chain that the hardware ring had no room for, in order.
    overflow: Vec<AqlPacket>,
    /// Hardware index of the outstanding retry barrier.
    retry_index: Option<u64>,
    /// The hardware ring was full with no retry barrier on it, so nothing will wake the proxy.
    stalled: bool,
    stall_backoff: Duration,
}

pub(crate) struct InterceptCore {
    id: u64,
    wrapped: AqlQueue,
    ring: RingBuffer,
    write_index: AtomicU64,
    read_index: AtomicU64,
    proxy: Mutex<ProxyState>,
    /// Thread currently draining, so its own doorbells are deferred instead of re-entering.
    draining: Mutex<Option<ThreadId>>,
    interceptors: Mutex<Vec<Arc<dyn Interceptor>>>,
    markers: Mutex<HashMap<u32, MarkerCallback>>,
    next_marker: AtomicU32,
    async_doorbell: Arc<HostSignal>,
    signals: Arc<SignalRuntime>,
    active: AtomicBool,
    last_doorbell: AtomicI64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct DrainGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> DrainGuard<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>) -> Self {
        *lock(slot) = Some(thread::current().id());
        Self(slot)
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

pub struct InterceptQueue {
    core: Arc<InterceptCore>,
    quit_ack: Arc<AtomicBool>,
}

impl InterceptQueue {
    /// Wraps `wrapped` behind a proxy ring of `size` packets.
    pub fn create(wrapped: AqlQueue, size: u32) -> Result<Self, RuntimeError> {
        let ring = RingBuffer::allocate(size, PROXY_LIMITS, false)?;
        let signals = wrapped.agent().signals().clone();
        let async_doorbell = signals.create_signal(0);
        let id = wrapped.agent().next_queue_id();

        let core = Arc::new(InterceptCore {
            id,
            wrapped,
            ring,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            proxy: Mutex::new(ProxyState {
                next_packet: 0,
                overflow: Vec::new(),
                retry_index: None,
                stalled: false,
                stall_backoff: STALL_BACKOFF_MIN,
            }),
            draining: Mutex::new(None),
            interceptors: Mutex::new(Vec::new()),
            markers: Mutex::new(HashMap::new()),
            next_marker: AtomicU32::new(1),
            async_doorbell: async_doorbell.clone(),
            signals: signals.clone(),
            active: AtomicBool::new(true),
            last_doorbell: AtomicI64::new(-1),
        });

        let quit_ack = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(&core);
        let ack = quit_ack.clone();
        let doorbell = async_doorbell.clone();
        signals.set_async_handler(&async_doorbell, Condition::Ne, 0, move |_| {
            let value = doorbell.exchange(0, Ordering::AcqRel);
            let keep = value != QUIT_SENTINEL
                && match weak.upgrade() {
                    Some(core) if core.active.load(Ordering::Acquire) => {
                        if let Some(backoff) = core.drain() {
                            thread::sleep(backoff);
                            core.kick();
                        }
                        true
                    }
                    _ => false,
                };
            if !keep {
                ack.store(true, Ordering::Release);
            }
            keep
        })?;

        tracing::debug!(id, size = core.ring.size(), wrapped = core.wrapped.id(), "intercept queue created");
        Ok(Self { core, quit_ack })
    }

    /// Adds a stage. Later stages see packets first.
    pub fn add_interceptor(&self, interceptor: impl Interceptor + 'static) {
        lock(&self.core.interceptors).push(Arc::new(interceptor));
    }

    /// Registers a marker callback and returns the id markers refer to it by.
    pub fn register_marker_callback(&self, callback: impl Fn(&InterceptMarker) + Send + Sync + 'static) -> u32 {
        let id = self.core.next_marker.fetch_add(1, Ordering::Relaxed);
        lock(&self.core.markers).insert(id, Arc::new(callback));
        id
    }

    pub fn wrapped(&self) -> &AqlQueue {
        &self.core.wrapped
    }

    /// Packets waiting for room on the hardware ring.
    pub fn overflow_len(&self) -> usize {
        lock(&self.core.proxy).overflow.len()
    }
}

impl InterceptCore {
    fn doorbell(&self, value: i64) {
        self.last_doorbell.store(value, Ordering::Relaxed);
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        if *lock(&self.draining) == Some(thread::current().id()) {
            // Submitted from inside the chain; drain once the current pass is over.
            self.kick();
            return;
        }
        if self.drain().is_some() {
            self.kick();
        }
    }

    /// Wakes the async handler unless teardown already parked the sentinel there.
    fn kick(&self) {
        self.async_doorbell.compare_exchange(0, 1, Ordering::AcqRel);
    }

    /// Forwards what it can. Returns how long to back off before polling the hardware ring
    /// again when it is stalled full.
    fn drain(&self) -> Option<Duration> {
        if !self.active.load(Ordering::Acquire) {
            return None;
        }
        let mut state = lock(&self.proxy);
        let _draining = DrainGuard::enter(&self.draining);
        let stages: Vec<Arc<dyn Interceptor>> = lock(&self.interceptors).clone();
        state.stalled = false;

        if !state.overflow.is_empty() {
            let pending = std::mem::take(&mut state.overflow);
            self.submit(&mut *state, &pending);
            if !state.overflow.is_empty() {
                return Self::stall(&mut state);
            }
        }

        let size = self.ring.size() as u64;
        let end = self
            .write_index
            .load(Ordering::Acquire)
            .min(state.next_packet + size);
        while state.next_packet < end {
            let index = state.next_packet;
            if !self.ring.load_header(index, Ordering::Acquire).is_valid() {
                // Reserved but not yet published.
                break;
            }
            let packet = self.ring.read_packet(index);

            PacketWriter {
                core: self,
                state: &mut *state,
                stages: &stages,
                packet_index: index,
            }
            .write(&[packet]);

            self.ring.invalidate(index);
            state.next_packet = index + 1;
            self.read_index.store(index + 1, Ordering::Release);

            if !state.overflow.is_empty() {
                break;
            }
        }
        Self::stall(&mut state)
    }

    fn stall(state: &mut ProxyState) -> Option<Duration> {
        if !state.stalled {
            state.stall_backoff = STALL_BACKOFF_MIN;
            return None;
        }
        let backoff = state.stall_backoff;
        state.stall_backoff = (backoff * 2).min(STALL_BACKOFF_MAX);
        Some(backoff)
    }

    /// Innermost stage: places packets on the hardware ring, firing markers in between.
    fn submit(&self, state: &mut ProxyState, packets: &[AqlPacket]) {
        if !state.overflow.is_empty() {
            state.overflow.extend_from_slice(packets);
            return;
        }
        let mut rest = packets;
        while let Some((first, tail)) = rest.split_first() {
            if first.is_intercept_marker() {
                self.fire_marker(first);
                rest = tail;
                continue;
            }
            let run = rest
                .iter()
                .position(AqlPacket::is_intercept_marker)
                .unwrap_or(rest.len());
            let placed = self.place(state, &rest[..run]);
            if placed < run {
                state.overflow.extend_from_slice(&rest[placed..]);
                return;
            }
            rest = &rest[run..];
        }
    }

    /// Copies as much of `batch` as fits onto the hardware ring; returns how many.
    ///
    /// One slot is always left for a retry barrier. When the batch does not fit and no barrier
    /// is outstanding, only the barrier is placed; with a barrier outstanding every free slot
    /// is used.
    fn place(&self, state: &mut ProxyState, batch: &[AqlPacket]) -> usize {
        let hw = &self.wrapped;
        let size = hw.size() as u64;
        let n = batch.len() as u64;
        loop {
            let write = hw.load_write_index(Ordering::Acquire);
            let read = hw.load_read_index(Ordering::Acquire);
            let free = size - (write - read).min(size);
            let retry_pending = state.retry_index.is_some_and(|r| read <= r);

            let (count, barrier) = if n < free {
                (n, false)
            } else if retry_pending {
                (n.min(free), false)
            } else {
                (0, free > 0)
            };
            let total = count + barrier as u64;
            if total == 0 {
                if free == 0 && !retry_pending {
                    tracing::trace!(id = self.id, write, "hardware ring full with no retry barrier");
                    state.stalled = true;
                }
                return 0;
            }
            if hw.cas_write_index(write, write + total, Ordering::AcqRel) != write {
                continue;
            }

            let ring = hw.ring();
            for (i, packet) in batch[..count as usize].iter().enumerate() {
                ring.publish(write + i as u64, packet);
            }
            if barrier {
                let retry = BarrierAndPacket {
                    barrier: true,
                    completion_signal: self.async_doorbell.handle(),
                    ..Default::default()
                };
                let at = write + count;
                ring.publish(at, &retry.to_packet());
                state.retry_index = Some(at);
                tracing::trace!(id = self.id, at, "retry barrier placed");
            }
            hw.ring_doorbell(write + total - 1);
            return count as usize;
        }
    }

    fn fire_marker(&self, packet: &AqlPacket) {
        let Some(marker) = InterceptMarker::from_packet(packet) else {
            return;
        };
        let callback = lock(&self.markers).get(&marker.callback).cloned();
        match callback {
            Some(callback) => callback(&marker),
            None => tracing::warn!(id = self.id, callback = marker.callback, "unknown intercept marker"),
        }
    }
}

impl Drop for InterceptQueue {
    fn drop(&mut self) {
        self.core.active.store(false, Ordering::Release);
        self.core
            .async_doorbell
            .store(QUIT_SENTINEL, Ordering::Release);
        if !self.core.signals.is_handler_thread() {
            while !self.quit_ack.load(Ordering::Acquire) {
                thread::sleep(TEARDOWN_POLL);
            }
        }
        tracing::debug!(id = self.core.id, "intercept queue destroyed");
    }
}

impl Queue for InterceptQueue {
    fn id(&self) -> u64 {
        self.core.id
    }

    fn size(&self) -> u32 {
        self.core.ring.size()
    }

    fn ring(&self) -> &RingBuffer {
        &self.core.ring
    }

    fn load_read_index(&self, order: Ordering) -> u64 {
        self.core.read_index.load(order)
    }

    fn load_write_index(&self, order: Ordering) -> u64 {
        self.core.write_index.load(order)
    }

    fn store_write_index(&self, value: u64, order: Ordering) {
        self.core.write_index.store(value, order);
    }

    fn cas_write_index(&self, expected: u64, value: u64, order: Ordering) -> u64 {
        match self
            .core
            .write_index
            .compare_exchange(expected, value, order, Ordering::Relaxed)
        {
            Ok(prev) | Err(prev) => prev,
        }
    }

    fn add_write_index(&self, delta: u64, order: Ordering) -> u64 {
        self.core.write_index.fetch_add(delta, order)
    }

    fn ring_doorbell(&self, index: u64) {
        self.core.doorbell(index as i64);
    }

    fn set_cu_masking(&self, mask: &[u32]) -> Result<CuMaskOutcome, RuntimeError> {
        self.core.wrapped.set_cu_masking(mask)
    }

    fn cu_masking(&self) -> Vec<u32> {
        self.core.wrapped.cu_masking()
    }

    /// Goes straight to the hardware queue, bypassing the interceptors.
    fn execute_pm4(&self, commands: &[u32]) -> Result<(), RuntimeError> {
        self.core.wrapped.execute_pm4(commands)
    }

    fn set_priority(&self, priority: QueuePriority) -> Result<(), RuntimeError> {
        self.core.wrapped.set_priority(priority)
    }

    fn inactivate(&self) -> Result<(), RuntimeError> {
        self.core.active.store(false, Ordering::Release);
        self.core.wrapped.inactivate()
    }
}

/// The proxy doorbell, seen as a signal.
impl Signal for InterceptQueue {
    fn load(&self, order: Ordering) -> i64 {
        self.core.last_doorbell.load(order)
    }

    fn store(&self, value: i64, _order: Ordering) {
        self.core.doorbell(value);
    }
}

impl core::fmt::Debug for InterceptQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InterceptQueue")
            .field("id", &self.core.id)
            .field("size", &self.core.ring.size())
            .field("wrapped", &self.core.wrapped)
            .finish()
    }
}
