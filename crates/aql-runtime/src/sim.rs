//! A software packet processor for running queues without a GPU.
//!
//! It consumes a hardware queue's ring the way the command processor would, as far as the
//! runtime can observe: it honours the inactive signal, reports insufficient scratch against
//! the descriptor the runtime programmed, asks for single-use scratch back, waits on barrier
//! dependencies and retires packets in order.

use crate::descriptor::QueueProperties;
use crate::queue::faults::{ERROR_INSUFFICIENT_SCRATCH, ERROR_LARGE_SCRATCH_RECLAIM, ERROR_WAVE32};
use crate::queue::{AqlCore, AqlQueue};
use crate::signal::Signal;
use aql_ring::{AqlPacket, BarrierAndPacket, KernelDispatchPacket, PacketType};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const IDLE_POLL: Duration = Duration::from_micros(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Nothing published past the read index.
    Idle,
    /// Waiting on the runtime or on a barrier dependency.
    Stalled,
    Completed(PacketType),
    /// Stopped the queue with this code in the inactive signal.
    Stopped(u64),
}

pub struct PacketProcessor {
    queue: Weak<AqlCore>,
    wave32: bool,
    reclaim_pending: bool,
    completed: u64,
}

impl PacketProcessor {
    pub fn new(queue: &AqlQueue) -> Self {
        Self {
            queue: queue.downgrade(),
            wave32: false,
            reclaim_pending: false,
            completed: 0,
        }
    }

    /// Runs every dispatch in wave32 mode.
    pub fn wave32(mut self, enabled: bool) -> Self {
        self.wave32 = enabled;
        self
    }

    /// Packets retired so far.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn step(&mut self) -> Step {
        let Some(core) = self.queue.upgrade() else {
            return Step::Idle;
        };
        if !core.is_active() || core.is_suspended() {
            return Step::Idle;
        }
        let inactive = core.inactive_signal();
        if inactive.load(Ordering::Acquire) != 0 {
            return Step::Stalled;
        }

        if self.reclaim_pending {
            self.reclaim_pending = false;
            inactive.store(ERROR_LARGE_SCRATCH_RECLAIM as i64, Ordering::Release);
            return Step::Stopped(ERROR_LARGE_SCRATCH_RECLAIM);
        }

        let desc = core.descriptor();
        let ring = core.ring();
        let read = desc.read_dispatch_id.load(Ordering::Acquire);
        if read >= desc.write_dispatch_id.load(Ordering::Acquire) {
            return Step::Idle;
        }
        if !ring.load_header(read, Ordering::Acquire).is_valid() {
            return Step::Idle;
        }
        let packet = ring.read_packet(read);
        let Some(ty) = packet.packet_type() else {
            return Step::Idle;
        };

        match ty {
            PacketType::KernelDispatch => {
                if let Some(code) = self.check_scratch(&core, &packet) {
                    inactive.store(code as i64, Ordering::Release);
                    return Step::Stopped(code);
                }
            }
            PacketType::BarrierAnd | PacketType::BarrierOr => {
                if !self.dependencies_met(&core, ty, &packet) {
                    return Step::Stalled;
                }
            }
            _ => {}
        }

        // Retire before signalling so waiters see the advanced read index.
        ring.invalidate(read);
        desc.read_dispatch_id.store(read + 1, Ordering::Release);
        let handle = packet.completion_signal();
        if let Some(signal) = core.agent().signals().lookup(handle) {
            signal.sub(1, Ordering::Release);
        }
        self.completed += 1;
        Step::Completed(ty)
    }

    fn check_scratch(&mut self, core: &AqlCore, packet: &AqlPacket) -> Option<u64> {
        let dispatch = KernelDispatchPacket::from_packet(packet)?;
        if dispatch.private_segment_size == 0 {
            return None;
        }
        let desc = core.descriptor();
        let lanes: u64 = if self.wave32 { 32 } else { 64 };
        let granule = 1024 / lanes;
        let needed = (dispatch.private_segment_size as u64).div_ceil(granule) * granule;
        let held = desc.scratch_wave64_lane_byte_size.load(Ordering::Acquire) as u64 * 64 / lanes;
        let backed = desc.scratch_backing_memory_byte_size.load(Ordering::Acquire) != 0;

        if !backed || held < needed {
            let wave32 = if self.wave32 { ERROR_WAVE32 } else { 0 };
            return Some(ERROR_INSUFFICIENT_SCRATCH | wave32);
        }
        if desc.properties().contains(QueueProperties::USE_SCRATCH_ONCE) {
            self.reclaim_pending = true;
        }
        None
    }

    fn dependencies_met(&self, core: &AqlCore, ty: PacketType, packet: &AqlPacket) -> bool {
        let Some(barrier) = BarrierAndPacket::from_packet(&as_barrier_and(packet)) else {
            return true;
        };
        let signals = core.agent().signals();
        let mut deps = barrier
            .dep_signals
            .iter()
            .filter_map(|&handle| signals.lookup(handle))
            .map(|signal| signal.load(Ordering::Acquire) == 0)
            .peekable();
        if deps.peek().is_none() {
            return true;
        }
        match ty {
            PacketType::BarrierOr => deps.any(|done| done),
            _ => deps.all(|done| done),
        }
    }

    /// Retires packets until the queue is idle or stalled; returns how many.
    pub fn run_until_idle(&mut self) -> u64 {
        let start = self.completed;
        while let Step::Completed(_) = self.step() {}
        self.completed - start
    }

    /// Keeps stepping on a background thread until the handle is dropped.
    pub fn spawn(mut self) -> ProcessorHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::spawn({
            let stop = stop.clone();
            move || {
                while !stop.load(Ordering::Acquire) {
                    match self.step() {
                        Step::Completed(_) | Step::Stopped(_) => {}
                        Step::Idle | Step::Stalled => thread::sleep(IDLE_POLL),
                    }
                }
            }
        });
        ProcessorHandle {
            stop,
            thread: Some(thread),
        }
    }
}

/// BARRIER_OR shares the BARRIER_AND layout.
fn as_barrier_and(packet: &AqlPacket) -> AqlPacket {
    let mut p = *packet;
    let mut header = p.header();
    header.0 = (header.0 & !aql_ring::packet::header_bits::TYPE_MASK) | PacketType::BarrierAnd as u16;
    p.set_header(header);
    p
}

pub struct ProcessorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for ProcessorHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
