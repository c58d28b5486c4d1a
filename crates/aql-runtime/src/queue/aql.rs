//! Hardware AQL queue.
//!
//! The command processor stops the queue and stores an error code in the inactive signal when
//! a dispatch cannot run. Most of this module is the handler that answers those codes: grow the
//! scratch and resume, wait for scratch to be returned elsewhere, or give up and report a fault.
//!
//! Handlers run on the signal runtime's thread and reach the queue through a `Weak`, so the
//! queue can be torn down without their cooperation; the TERMINATE/DONE handshake only orders
//! the teardown after any handler already in flight.

use super::cu_mask::{self, CuMaskOutcome};
use super::faults::{self, InactiveCode};
use super::{pm4, reserve_slots, Queue, QueuePriority};
use crate::agent::{Agent, QueueEventRef};
use crate::descriptor::{AmdQueueDescriptor, QueueProperties};
use crate::error::{QueueFault, RuntimeError};
use crate::regs;
use crate::scratch::{ScratchInfo, ScratchRequest, SCRATCH_RETRY_BIT};
use crate::signal::{Condition, HostSignal, Signal};
use aql_kfd::ioctl::{
    CreateQueueArgs, UpdateQueueArgs, KFD_IOC_QUEUE_TYPE_COMPUTE_AQL, KFD_MAX_QUEUE_PERCENTAGE,
};
use aql_kfd::KfdDriver;
use aql_ring::{
    AqlPacket, Doorbell, FenceScope, KernelDispatchPacket, PacketHeader, PacketType,
    Pm4IbPacket, RingBuffer,
};
use bitflags::bitflags;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct HandlerState: u32 {
        /// Waiting for another queue to return large scratch.
        const SCRATCH_RETRY = 1 << 0;
        const TERMINATE = 1 << 1;
        const DONE = 1 << 2;
    }
}

#[derive(Default)]
struct AtomicHandlerState(AtomicU32);

impl AtomicHandlerState {
    fn insert(&self, flags: HandlerState) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn remove(&self, flags: HandlerState) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    fn contains(&self, flags: HandlerState) -> bool {
        HandlerState::from_bits_retain(self.0.load(Ordering::Acquire)).contains(flags)
    }
}

/// Stored into a handler's signal to make it observe TERMINATE.
const TERMINATION_SENTINEL: i64 = i64::MIN;

/// Firmware before this version does not flush scratch writes ahead of a reclaim on gfx8.
const GFX8_RECLAIM_FENCE_MICROCODE: u32 = 729;

const TEARDOWN_POLL: Duration = Duration::from_micros(100);

/// Called once with the first fault the queue hits, after the queue has been suspended.
pub type ErrorCallback = Arc<dyn Fn(QueueFault, u64) + Send + Sync>;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Constructing = 0,
    Active = 1,
    /// Stopped by the runtime, either waiting for scratch or after a fault.
    Suspended = 2,
    Inactive = 3,
}

impl QueueState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Constructing,
            1 => Self::Active,
            2 => Self::Suspended,
            _ => Self::Inactive,
        }
    }
}

pub struct QueueOptions {
    /// Packets; clamped into the agent's limits.
    pub size: u32,
    pub priority: QueuePriority,
    /// Per-thread scratch to allocate up front. Zero defers scratch to the first dispatch that
    /// needs it.
    pub private_segment_size: u32,
    pub error_callback: Option<ErrorCallback>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            size: 1024,
            priority: QueuePriority::Normal,
            private_segment_size: 0,
            error_callback: None,
        }
    }
}

/// Result of one handler invocation, applied after the handler let go of the queue.
enum Next {
    /// Stay armed on the same condition.
    Rearm,
    /// The handler re-armed itself on a different condition.
    Rearmed,
    Done,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Destroys a freshly created driver queue unless construction completes.
struct DriverQueueGuard<'a> {
    driver: &'a dyn KfdDriver,
    queue_id: Option<u32>,
}

impl DriverQueueGuard<'_> {
    fn disarm(mut self) {
        self.queue_id = None;
    }
}

impl Drop for DriverQueueGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.queue_id {
            if let Err(err) = self.driver.destroy_queue(id) {
                tracing::warn!(%err, id, "failed to unwind driver queue");
            }
        }
    }
}

pub(crate) struct AqlCore {
    id: u64,
    agent: Arc<Agent>,
    ring: RingBuffer,
    desc: Box<AmdQueueDescriptor>,
    doorbell: Doorbell,
    driver_queue_id: u32,
    priority: AtomicU32,
    state: AtomicU8,
    active: AtomicBool,
    suspended: AtomicBool,
    last_doorbell: AtomicI64,
    inactive_signal: Arc<HostSignal>,
    scratch_state: Arc<AtomicHandlerState>,
    exception_signal: Option<Arc<HostSignal>>,
    exception_state: Arc<AtomicHandlerState>,
    scratch: Mutex<ScratchInfo>,
    cu_mask: Mutex<Vec<u32>>,
    pm4_ib: Mutex<Box<[u32]>>,
    pm4_signal: Arc<HostSignal>,
    error_callback: Option<ErrorCallback>,
    fault_reported: AtomicBool,
    _queue_event: QueueEventRef,
}

/// Owning handle to a hardware queue. Dropping it destroys the queue.
pub struct AqlQueue {
    core: Arc<AqlCore>,
}

impl AqlQueue {
    pub fn create(agent: &Arc<Agent>, options: QueueOptions) -> Result<Self, RuntimeError> {
        let props = agent.properties();
        let driver = agent.driver().clone();
        let signals = agent.signals().clone();

        let limits = props.ring_limits(aql_ring::page_size());
        let ring = RingBuffer::allocate(options.size, limits, props.queue_full_workaround)?;
        let size = ring.size();
        let id = agent.next_queue_id();

        let queue_event = agent.acquire_queue_event()?;
        let inactive_signal = signals.create_signal(0);
        let exception_signal = driver
            .version()
            .supports_exception_debugging()
            .then(|| signals.create_signal(0));
        let pm4_signal = signals.create_signal(0);

        let mut desc = Box::new(AmdQueueDescriptor::new(
            id,
            ring.base_address(),
            size,
            inactive_signal.handle(),
        ));
        desc.max_cu_id = props.max_cu_id();
        desc.max_wave_id = props.max_wave_id();

        let priority = options.priority.to_kfd();
        let mut args = CreateQueueArgs {
            ring_base_address: ring.base_address(),
            write_pointer_address: desc.write_pointer_address(),
            read_pointer_address: desc.read_pointer_address(),
            ring_size: ring.mapped_bytes() as u32,
            gpu_id: props.gpu_id,
            queue_type: KFD_IOC_QUEUE_TYPE_COMPUTE_AQL,
            queue_percentage: KFD_MAX_QUEUE_PERCENTAGE,
            queue_priority: priority,
            ..Default::default()
        };
        driver.create_queue(&mut args)?;
        let guard = DriverQueueGuard {
            driver: driver.as_ref(),
            queue_id: Some(args.queue_id),
        };

        let sink = driver.map_doorbell(props.gpu_id, args.doorbell_offset)?;
        let doorbell = Doorbell::new(
            props.doorbell_kind,
            props.index_model,
            size,
            props.queue_full_workaround,
            sink,
        );

        let core = Arc::new(AqlCore {
            id,
            agent: agent.clone(),
            ring,
            desc,
            doorbell,
            driver_queue_id: args.queue_id,
            priority: AtomicU32::new(priority),
            state: AtomicU8::new(QueueState::Constructing as u8),
            active: AtomicBool::new(true),
            suspended: AtomicBool::new(false),
            last_doorbell: AtomicI64::new(-1),
            inactive_signal,
            scratch_state: Arc::default(),
            exception_signal,
            exception_state: Arc::default(),
            scratch: Mutex::new(ScratchInfo::default()),
            cu_mask: Mutex::new(props.full_cu_mask()),
            pm4_ib: Mutex::new(vec![0; pm4::IB_CAPACITY_DWORDS].into_boxed_slice()),
            pm4_signal,
            error_callback: options.error_callback,
            fault_reported: AtomicBool::new(false),
            _queue_event: queue_event,
        });
        // From here on dropping `core` destroys the driver queue.
        guard.disarm();

        if options.private_segment_size > 0 {
            core.allocate_initial_scratch(options.private_segment_size)?;
        } else {
            core.program_scratch(&ScratchInfo::default());
        }

        if agent.global_cu_mask().is_some() {
            core.set_cu_masking(&props.full_cu_mask())?;
        }

        core.arm_handlers()?;
        core.set_state(QueueState::Active);

        tracing::debug!(
            id,
            queue_id = args.queue_id,
            size,
            doorbell = ?props.doorbell_kind,
            "queue created"
        );
        Ok(Self { core })
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Id the driver knows the queue by.
    pub fn driver_queue_id(&self) -> u32 {
        self.core.driver_queue_id
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.core.state.load(Ordering::Acquire))
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.core.agent
    }

    pub fn descriptor(&self) -> &AmdQueueDescriptor {
        &self.core.desc
    }

    pub fn inactive_signal(&self) -> &Arc<HostSignal> {
        &self.core.inactive_signal
    }

    /// Only present on drivers that report per-queue exceptions.
    pub fn exception_signal(&self) -> Option<&Arc<HostSignal>> {
        self.core.exception_signal.as_ref()
    }

    pub fn scratch(&self) -> ScratchInfo {
        lock(&self.core.scratch).clone()
    }

    /// Stops the queue without destroying it.
    pub fn suspend(&self) -> Result<(), RuntimeError> {
        self.core.suspend()
    }

    pub(crate) fn downgrade(&self) -> Weak<AqlCore> {
        Arc::downgrade(&self.core)
    }
}

impl AqlCore {
    pub(crate) fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub(crate) fn descriptor(&self) -> &AmdQueueDescriptor {
        &self.desc
    }

    pub(crate) fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub(crate) fn inactive_signal(&self) -> &Arc<HostSignal> {
        &self.inactive_signal
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    fn set_state(&self, state: QueueState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn allocate_initial_scratch(&self, private_segment_size: u32) -> Result<(), RuntimeError> {
        let props = self.agent.properties();
        let req = ScratchRequest::whole_device(
            private_segment_size,
            props.default_wave_lanes(),
            props.max_scratch_slots(),
        );
        let mut scratch = lock(&self.scratch);
        scratch.request(&req);
        self.agent.scratch().acquire(&mut scratch, &self.inactive_signal);
        if !scratch.is_allocated() {
            self.agent.scratch().forget(&self.inactive_signal);
            return Err(RuntimeError::OutOfResources("initial scratch"));
        }
        self.program_scratch(&scratch);
        Ok(())
    }

    /// Points the descriptor at `scratch`.
    fn program_scratch(&self, scratch: &ScratchInfo) {
        let props = self.agent.properties();
        let generation = props.gfx.isa_generation();
        let srd = regs::scratch_srd(generation, !props.is_dgpu, scratch);
        for (reg, word) in self.desc.scratch_resource_descriptor.iter().zip(srd) {
            reg.store(word, Ordering::Relaxed);
        }
        self.desc
            .scratch_backing_memory_location
            .store(scratch.base.unwrap_or(0), Ordering::Relaxed);
        self.desc
            .scratch_backing_memory_byte_size
            .store(if scratch.is_allocated() { scratch.size } else { 0 }, Ordering::Relaxed);
        let lane_bytes = scratch.size_per_thread * scratch.lanes_per_wave as u64 / 64;
        self.desc
            .scratch_wave64_lane_byte_size
            .store(if scratch.is_allocated() { lane_bytes as u32 } else { 0 }, Ordering::Relaxed);
        self.desc.compute_tmpring_size.store(
            regs::tmpring_size(generation, scratch, props.max_scratch_slots()),
            Ordering::Release,
        );
    }

    /// Arms both handlers; if the second cannot be armed the first is retired again.
    fn arm_handlers(self: &Arc<Self>) -> Result<(), RuntimeError> {
        self.arm_inactive_handler(Condition::Ne, 0)?;
        match self.arm_exception_handler() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.terminate_handler(&self.scratch_state, &self.inactive_signal);
                Err(err)
            }
        }
    }

    fn arm_inactive_handler(self: &Arc<Self>, condition: Condition, compare: i64) -> Result<(), RuntimeError> {
        let weak = Arc::downgrade(self);
        let state = self.scratch_state.clone();
        self.agent.signals().set_async_handler(
            &self.inactive_signal,
            condition,
            compare,
            move |value| {
                let next = match weak.upgrade() {
                    Some(core) => core.on_inactive(value),
                    None => Next::Done,
                };
                finish(&state, next)
            },
        )
    }

    fn arm_exception_handler(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let Some(signal) = &self.exception_signal else {
            return Ok(());
        };
        let weak = Arc::downgrade(self);
        let state = self.exception_state.clone();
        self.agent
            .signals()
            .set_async_handler(signal, Condition::Ne, 0, move |value| {
                let next = match weak.upgrade() {
                    Some(core) => core.on_exception(value),
                    None => Next::Done,
                };
                finish(&state, next)
            })
    }

    fn on_inactive(self: &Arc<Self>, value: i64) -> Next {
        if self.scratch_state.contains(HandlerState::TERMINATE) {
            return Next::Done;
        }
        let retried = self.scratch_state.contains(HandlerState::SCRATCH_RETRY);
        if retried {
            self.scratch_state.remove(HandlerState::SCRATCH_RETRY);
        }
        let mut value = value;
        if value & SCRATCH_RETRY_BIT != 0 {
            // Consume the release notification before acquiring, so a later release sets it again.
            let clean = value & !SCRATCH_RETRY_BIT;
            if self.inactive_signal.compare_exchange(value, clean, Ordering::AcqRel) != value {
                return self.rearm_any(retried, clean as u64);
            }
            value = clean;
        }
        let code = value as u64;
        self.set_state(QueueState::Suspended);

        match self.handle_inactive(value, code) {
            Next::Rearm => self.rearm_any(retried, code),
            next => next,
        }
    }

    /// Stays armed for any nonzero code, replacing a retry arm if there is one.
    fn rearm_any(self: &Arc<Self>, retried: bool, code: u64) -> Next {
        if !retried {
            return Next::Rearm;
        }
        match self.arm_inactive_handler(Condition::Ne, 0) {
            Ok(()) => Next::Rearmed,
            Err(_) => {
                self.fail(QueueFault::OutOfResources, code);
                Next::Done
            }
        }
    }

    fn handle_inactive(self: &Arc<Self>, value: i64, code: u64) -> Next {
        match faults::classify_error_code(code) {
            InactiveCode::InsufficientScratch { wave32 } => self.grow_scratch(value, code, wave32),
            InactiveCode::ReclaimScratch => {
                let mut scratch = lock(&self.scratch);
                self.agent.scratch().release(&mut scratch);
                *scratch = ScratchInfo::default();
                self.program_scratch(&scratch);
                self.desc.remove_properties(QueueProperties::USE_SCRATCH_ONCE);
                drop(scratch);
                tracing::trace!(id = self.id, "single-use scratch reclaimed");
                self.resume_after(value);
                Next::Rearm
            }
            InactiveCode::Fatal(fault) => {
                self.fail(fault, code);
                Next::Done
            }
        }
    }

    fn grow_scratch(self: &Arc<Self>, observed: i64, code: u64, wave32: bool) -> Next {
        let props = self.agent.properties();
        let read = self.desc.read_dispatch_id.load(Ordering::Acquire);
        let packet = self.ring.read_packet(read);
        let Some(dispatch) = KernelDispatchPacket::from_packet(&packet) else {
            self.fail(QueueFault::InvalidPacketFormat, code);
            return Next::Done;
        };

        let lanes = if wave32 { 32 } else { 64 };
        let Some(req) = ScratchRequest::for_dispatch(
            dispatch.private_segment_size,
            dispatch.workgroup_size,
            dispatch.grid_size,
            lanes,
            props.max_scratch_slots(),
        ) else {
            self.fail(QueueFault::IncompatibleArguments, code);
            return Next::Done;
        };

        let allocator = self.agent.scratch();
        let mut scratch = lock(&self.scratch);
        if scratch.covers(&req) {
            // Already big enough, e.g. grown for a larger dispatch earlier.
            self.program_scratch(&scratch);
            drop(scratch);
            self.resume_after(observed);
            return Next::Rearm;
        }

        allocator.release(&mut scratch);
        scratch.request(&req);
        allocator.acquire(&mut scratch, &self.inactive_signal);

        if !scratch.is_allocated() {
            let retry = scratch.retry;
            *scratch = ScratchInfo::default();
            self.program_scratch(&scratch);
            drop(scratch);
            if retry {
                // Wake up once the allocator ORs the retry bit in, or on teardown.
                self.scratch_state.insert(HandlerState::SCRATCH_RETRY);
                tracing::debug!(id = self.id, "scratch exhausted; waiting for a release");
                return match self.arm_inactive_handler(Condition::Ne, observed) {
                    Ok(()) => Next::Rearmed,
                    Err(_) => {
                        self.fail(QueueFault::OutOfResources, code);
                        Next::Done
                    }
                };
            }
            self.fail(QueueFault::OutOfResources, code);
            return Next::Done;
        }

        if scratch.large && allocator.async_reclaim() {
            self.desc.insert_properties(QueueProperties::USE_SCRATCH_ONCE);
            if props.gfx.major == 8 && props.microcode_version < GFX8_RECLAIM_FENCE_MICROCODE {
                let header = packet.header().with_release_scope(FenceScope::System);
                self.ring
                    .header_word(read)
                    .store(header.0 as u32 | (packet.setup() as u32) << 16, Ordering::Release);
            }
        }
        self.program_scratch(&scratch);
        tracing::debug!(
            id = self.id,
            size = scratch.size,
            per_thread = scratch.size_per_thread,
            large = scratch.large,
            "scratch grown"
        );
        drop(scratch);
        self.resume_after(observed);
        Next::Rearm
    }

    /// Lets the packet processor continue, unless teardown already replaced `observed`.
    fn resume_after(&self, observed: i64) {
        self.set_state(QueueState::Active);
        self.inactive_signal
            .compare_exchange(observed, 0, Ordering::AcqRel);
    }

    fn on_exception(&self, value: i64) -> Next {
        if self.exception_state.contains(HandlerState::TERMINATE) {
            return Next::Done;
        }
        match faults::classify_exception_mask(value as u64) {
            None => Next::Rearm,
            Some(fault) => {
                self.fail(fault, value as u64);
                Next::Done
            }
        }
    }

    fn fail(&self, fault: QueueFault, code: u64) {
        self.set_state(QueueState::Suspended);
        if let Err(err) = self.suspend() {
            tracing::warn!(%err, id = self.id, "failed to suspend faulted queue");
        }
        if self.agent.config().queue_fault_messages {
            tracing::error!(id = self.id, code = format_args!("{code:#x}"), %fault, "queue fault");
        } else {
            tracing::debug!(id = self.id, code = format_args!("{code:#x}"), %fault, "queue fault");
        }
        if !self.fault_reported.swap(true, Ordering::AcqRel) {
            if let Some(callback) = &self.error_callback {
                callback(fault, self.id);
            }
        }
    }

    fn update(&self, percentage: u32) -> Result<(), RuntimeError> {
        let args = UpdateQueueArgs {
            ring_base_address: self.ring.base_address(),
            queue_id: self.driver_queue_id,
            ring_size: self.ring.mapped_bytes() as u32,
            queue_percentage: percentage,
            queue_priority: self.priority.load(Ordering::Acquire),
        };
        self.agent.driver().update_queue(&args)?;
        Ok(())
    }

    fn suspend(&self) -> Result<(), RuntimeError> {
        if !self.is_active() {
            return Ok(());
        }
        self.update(0)?;
        self.suspended.store(true, Ordering::Release);
        Ok(())
    }

    fn inactivate(&self) -> Result<(), RuntimeError> {
        if self.active.swap(false, Ordering::AcqRel) {
            self.set_state(QueueState::Inactive);
            self.agent.driver().destroy_queue(self.driver_queue_id)?;
            tracing::debug!(id = self.id, "queue inactivated");
        }
        Ok(())
    }

    fn ring_doorbell(&self, index: u64) {
        self.last_doorbell.store(index as i64, Ordering::Relaxed);
        self.doorbell.ring(index, || {
            (
                self.desc.write_dispatch_id.load(Ordering::Relaxed),
                self.desc.read_dispatch_id.load(Ordering::Relaxed),
            )
        });
        if self.doorbell.kind().is_legacy() {
            self.desc
                .max_legacy_doorbell_dispatch_id_plus_1
                .store(self.doorbell.max_dispatch_id_plus_1(), Ordering::Release);
        }
    }

    fn set_cu_masking(&self, requested: &[u32]) -> Result<CuMaskOutcome, RuntimeError> {
        let (mask, outcome) = cu_mask::effective_mask(
            self.agent.properties(),
            requested,
            self.agent.global_cu_mask(),
        )?;
        let mut current = lock(&self.cu_mask);
        self.agent
            .driver()
            .set_cu_mask(self.driver_queue_id, &mask)?;
        *current = mask;
        if outcome == CuMaskOutcome::Reduced {
            tracing::debug!(id = self.id, "CU mask reduced by the global mask");
        }
        Ok(outcome)
    }

    fn execute_pm4(&self, queue: &dyn Queue, commands: &[u32]) -> Result<(), RuntimeError> {
        if commands.is_empty() || commands.len() > pm4::IB_CAPACITY_DWORDS {
            return Err(RuntimeError::InvalidArgument("PM4 stream length"));
        }
        if !self.is_active() {
            return Err(RuntimeError::QueueInactive(self.id));
        }

        // One indirect buffer per queue.
        let mut ib = lock(&self.pm4_ib);
        ib[..commands.len()].copy_from_slice(commands);
        let ib_address = ib.as_ptr() as u64;
        let dwords = commands.len() as u32;

        let slot = reserve_slots(queue, 1)?;
        if self.agent.properties().gfx.major <= 8 {
            let packet = AqlPacket {
                dwords: pm4::legacy_slot(ib_address, dwords),
            };
            self.ring.publish(slot, &packet);
            self.ring_doorbell(slot);
            while self.desc.read_dispatch_id.load(Ordering::Acquire) <= slot {
                if !self.is_active() {
                    return Err(RuntimeError::QueueInactive(self.id));
                }
                std::thread::yield_now();
            }
        } else {
            self.pm4_signal.store(1, Ordering::Relaxed);
            let packet = Pm4IbPacket {
                header: PacketHeader::new(
                    PacketType::VendorSpecific,
                    true,
                    FenceScope::System,
                    FenceScope::System,
                ),
                ib_jump_cmd: pm4::indirect_buffer(ib_address, dwords),
                dw_cnt_remain: Pm4IbPacket::DW_CNT_REMAIN,
                completion_signal: self.pm4_signal.handle(),
            };
            self.ring.publish(slot, &packet.to_packet());
            self.ring_doorbell(slot);
            self.pm4_signal.wait(Condition::Eq, 0, None);
        }
        Ok(())
    }

    /// Orders teardown after every handler already in flight.
    fn terminate_handlers(&self) {
        self.terminate_handler(&self.scratch_state, &self.inactive_signal);
        if let Some(signal) = &self.exception_signal {
            self.terminate_handler(&self.exception_state, signal);
        }
    }

    fn terminate_handler(&self, state: &AtomicHandlerState, signal: &HostSignal) {
        state.insert(HandlerState::TERMINATE);
        signal.store(TERMINATION_SENTINEL, Ordering::Release);
        if self.agent.signals().is_handler_thread() {
            return;
        }
        while !state.contains(HandlerState::DONE) {
            std::thread::sleep(TEARDOWN_POLL);
        }
    }
}

fn finish(state: &AtomicHandlerState, next: Next) -> bool {
    match next {
        Next::Rearm => true,
        Next::Rearmed => false,
        Next::Done => {
            state.insert(HandlerState::DONE);
            false
        }
    }
}

impl Drop for AqlCore {
    fn drop(&mut self) {
        if let Err(err) = self.inactivate() {
            tracing::warn!(%err, id = self.id, "failed to destroy queue");
        }
        let allocator = self.agent.scratch();
        allocator.release(&mut lock(&self.scratch));
        allocator.forget(&self.inactive_signal);
    }
}

impl Drop for AqlQueue {
    fn drop(&mut self) {
        self.core.terminate_handlers();
        tracing::debug!(id = self.core.id, "queue destroyed");
    }
}

impl Queue for AqlQueue {
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
        self.core.desc.read_dispatch_id.load(order)
    }

    fn load_write_index(&self, order: Ordering) -> u64 {
        self.core.desc.write_dispatch_id.load(order)
    }

    fn store_write_index(&self, value: u64, order: Ordering) {
        self.core.desc.write_dispatch_id.store(value, order);
    }

    fn cas_write_index(&self, expected: u64, value: u64, order: Ordering) -> u64 {
        match self.core.desc.write_dispatch_id.compare_exchange(
            expected,
            value,
            order,
            Ordering::Relaxed,
        ) {
            Ok(prev) | Err(prev) => prev,
        }
    }

    fn add_write_index(&self, delta: u64, order: Ordering) -> u64 {
        self.core.desc.write_dispatch_id.fetch_add(delta, order)
    }

    fn ring_doorbell(&self, index: u64) {
        self.core.ring_doorbell(index);
    }

    fn set_cu_masking(&self, mask: &[u32]) -> Result<CuMaskOutcome, RuntimeError> {
        self.core.set_cu_masking(mask)
    }

    fn cu_masking(&self) -> Vec<u32> {
        lock(&self.core.cu_mask).clone()
    }

    fn execute_pm4(&self, commands: &[u32]) -> Result<(), RuntimeError> {
        self.core.execute_pm4(self, commands)
    }

    fn set_priority(&self, priority: QueuePriority) -> Result<(), RuntimeError> {
        if !self.core.is_active() {
            return Err(RuntimeError::QueueInactive(self.core.id));
        }
        let previous = self.core.priority.swap(priority.to_kfd(), Ordering::AcqRel);
        let percentage = if self.core.is_suspended() {
            0
        } else {
            KFD_MAX_QUEUE_PERCENTAGE
        };
        self.core.update(percentage).inspect_err(|_| {
            self.core.priority.store(previous, Ordering::Release);
        })
    }

    fn inactivate(&self) -> Result<(), RuntimeError> {
        self.core.inactivate()
    }
}

/// The queue's doorbell, seen as a signal.
impl Signal for AqlQueue {
    fn load(&self, order: Ordering) -> i64 {
        self.core.last_doorbell.load(order)
    }

    fn store(&self, value: i64, _order: Ordering) {
        self.core.ring_doorbell(value as u64);
    }
}

impl core::fmt::Debug for AqlQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AqlQueue")
            .field("id", &self.core.id)
            .field("driver_queue_id", &self.core.driver_queue_id)
            .field("size", &self.core.ring.size())
            .field("state", &self.state())
            .finish()
    }
}
