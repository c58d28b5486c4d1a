//! In-process stand-in for amdkfd.
//!
//! Records every queue, CU mask, event and debug-trap request so tests can assert on the
//! runtime's side of the ABI without a GPU. Pointers embedded in argument structs are read and
//! written the way the kernel would; callers must pass live buffers.

use crate::driver::{KfdDriver, KfdError, KfdVersion};
use crate::ioctl::{
    CreateEventArgs, CreateQueueArgs, DbgDeviceInfoEntry, DbgTrapArgs, DbgTrapOp,
    QueueSnapshotEntry, RuntimeInfo, UpdateQueueArgs, KFD_DBG_QUEUE_ERROR_MASK,
    KFD_DBG_QUEUE_INVALID_MASK,
};
use aql_ring::{DoorbellSink, RecordingDoorbell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Operations whose next call can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimOp {
    CreateQueue,
    UpdateQueue,
    SetCuMask,
    MapDoorbell,
    CreateEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimQueue {
    pub queue_id: u32,
    pub gpu_id: u32,
    pub queue_type: u32,
    pub ring_base_address: u64,
    pub ring_size: u32,
    pub write_pointer_address: u64,
    pub read_pointer_address: u64,
    pub percentage: u32,
    pub priority: u32,
    pub cu_mask: Option<Vec<u32>>,
    pub debug_suspended: bool,
    pub exception_status: u64,
    pub doorbell_offset: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimWatch {
    pub address: u64,
    pub mode: u32,
    pub mask: u32,
    pub gpu_id: u32,
}

#[derive(Default)]
struct SimDebug {
    dbg_fd: i32,
    exception_mask: u64,
    flags: u32,
    launch_override: (u32, u32),
    launch_mode: u32,
    watches: BTreeMap<u32, SimWatch>,
    runtime_events: Vec<(u64, u32, u32)>,
}

#[derive(Default)]
struct SimState {
    next_queue_id: u32,
    queues: BTreeMap<u32, SimQueue>,
    doorbells: HashMap<u64, Arc<RecordingDoorbell>>,
    next_event_id: u32,
    events: BTreeMap<u32, u32>,
    failures: HashSet<SimOp>,
    debug: Option<SimDebug>,
    devices: Vec<DbgDeviceInfoEntry>,
}

pub struct SimulatedKfd {
    version: KfdVersion,
    state: Mutex<SimState>,
}

/// Watch points the simulated hardware provides per device.
pub const SIM_WATCH_POINTS: u32 = 4;
/// Wave-launch override bits the simulated hardware supports.
pub const SIM_WAVE_LAUNCH_SUPPORT: u32 = 0x3F;

const DOORBELL_BASE: u64 = 0x1_0000_0000;

impl SimulatedKfd {
    pub fn new(version: KfdVersion) -> Self {
        Self {
            version,
            state: Mutex::new(SimState {
                next_queue_id: 1,
                next_event_id: 1,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_device(&self, device: DbgDeviceInfoEntry) {
        self.state().devices.push(device);
    }

    /// Makes the next call of `op` fail with `ENOMEM`.
    pub fn fail_next(&self, op: SimOp) {
        self.state().failures.insert(op);
    }

    fn take_failure(state: &mut SimState, op: SimOp, request: &'static str) -> Result<(), KfdError> {
        if state.failures.remove(&op) {
            return Err(KfdError::ioctl(request, libc::ENOMEM));
        }
        Ok(())
    }

    pub fn queue(&self, queue_id: u32) -> Option<SimQueue> {
        self.state().queues.get(&queue_id).cloned()
    }

    pub fn queue_ids(&self) -> Vec<u32> {
        self.state().queues.keys().copied().collect()
    }

    pub fn doorbell(&self, queue_id: u32) -> Option<Arc<RecordingDoorbell>> {
        let state = self.state();
        let offset = state.queues.get(&queue_id)?.doorbell_offset;
        state.doorbells.get(&offset).cloned()
    }

    pub fn live_events(&self) -> usize {
        self.state().events.len()
    }

    pub fn debug_enabled(&self) -> bool {
        self.state().debug.is_some()
    }

    pub fn debug_flags(&self) -> Option<u32> {
        self.state().debug.as_ref().map(|d| d.flags)
    }

    pub fn watch(&self, id: u32) -> Option<SimWatch> {
        self.state()
            .debug
            .as_ref()
            .and_then(|d| d.watches.get(&id).copied())
    }

    pub fn runtime_events(&self) -> Vec<(u64, u32, u32)> {
        self.state()
            .debug
            .as_ref()
            .map(|d| d.runtime_events.clone())
            .unwrap_or_default()
    }

    /// Latches exception bits on a queue and, if a debugger asked for them, wakes it through the
    /// event pipe.
    pub fn raise_queue_exception(&self, queue_id: u32, mask: u64) -> Result<(), KfdError> {
        let mut state = self.state();
        let queue = state
            .queues
            .get_mut(&queue_id)
            .ok_or(KfdError::NoSuchQueue(queue_id))?;
        queue.exception_status |= mask;
        if let Some(debug) = &state.debug {
            if debug.exception_mask & mask != 0 {
                let byte = b'.';
                // SAFETY: one byte from a live local; the fd belongs to the debugger session.
                let rc = unsafe { libc::write(debug.dbg_fd, (&byte as *const u8).cast(), 1) };
                if rc != 1 {
                    tracing::warn!(queue_id, "failed to post debug event");
                }
            }
        }
        Ok(())
    }

    fn dbg_trap_locked(state: &mut SimState, args: &mut DbgTrapArgs) -> Result<u32, KfdError> {
        let op = args
            .op()
            .ok_or(KfdError::InvalidArgument("unknown debug trap operation"))?;

        if op == DbgTrapOp::Enable {
            if state.debug.is_some() {
                return Err(KfdError::ioctl("dbg_trap", libc::EBUSY));
            }
            // SAFETY: `op` selects the union member.
            let enable = unsafe { args.data.enable };
            if enable.rinfo_ptr != 0 && enable.rinfo_size as usize >= core::mem::size_of::<RuntimeInfo>() {
                let info = RuntimeInfo {
                    r_debug: 0,
                    runtime_state: 1,
                    ttmp_setup: 1,
                };
                // SAFETY: the caller passed a buffer of at least `rinfo_size` bytes.
                unsafe { core::ptr::write_unaligned(enable.rinfo_ptr as *mut RuntimeInfo, info) };
            }
            state.debug = Some(SimDebug {
                dbg_fd: enable.dbg_fd as i32,
                exception_mask: enable.exception_mask,
                ..Default::default()
            });
            return Ok(0);
        }

        let Some(debug) = state.debug.as_mut() else {
            return Err(KfdError::ioctl("dbg_trap", libc::EINVAL));
        };

        match op {
            DbgTrapOp::Enable => unreachable!("handled above"),
            DbgTrapOp::Disable => {
                state.debug = None;
                for queue in state.queues.values_mut() {
                    queue.debug_suspended = false;
                }
                Ok(0)
            }
            DbgTrapOp::SendRuntimeEvent => {
                // SAFETY: `op` selects the union member.
                let ev = unsafe { args.data.send_runtime_event };
                debug
                    .runtime_events
                    .push((ev.exception_mask, ev.gpu_id, ev.queue_id));
                Ok(0)
            }
            DbgTrapOp::SetExceptionsEnabled => {
                // SAFETY: `op` selects the union member.
                debug.exception_mask = unsafe { args.data.set_exceptions_enabled.exception_mask };
                Ok(0)
            }
            DbgTrapOp::SetWaveLaunchOverride => {
                // SAFETY: `op` selects the union member.
                let ov = unsafe { &mut args.data.launch_override };
                if ov.enable_mask & !SIM_WAVE_LAUNCH_SUPPORT != 0 {
                    return Err(KfdError::ioctl("dbg_trap", libc::EACCES));
                }
                let previous = debug.launch_override.1;
                debug.launch_override = (ov.override_mode, ov.enable_mask);
                ov.enable_mask = previous;
                ov.support_request_mask = SIM_WAVE_LAUNCH_SUPPORT;
                Ok(0)
            }
            DbgTrapOp::SetWaveLaunchMode => {
                // SAFETY: `op` selects the union member.
                debug.launch_mode = unsafe { args.data.launch_mode.launch_mode };
                Ok(0)
            }
            DbgTrapOp::SuspendQueues | DbgTrapOp::ResumeQueues => {
                let suspend = op == DbgTrapOp::SuspendQueues;
                // SAFETY: `op` selects the union member.
                let (ptr, count) = unsafe {
                    if suspend {
                        let a = args.data.suspend_queues;
                        (a.queue_array_ptr, a.num_queues)
                    } else {
                        let a = args.data.resume_queues;
                        (a.queue_array_ptr, a.num_queues)
                    }
                };
                // SAFETY: the caller passed `count` queue ids at `ptr`.
                let ids = unsafe { core::slice::from_raw_parts_mut(ptr as *mut u32, count as usize) };
                let mut changed = 0;
                for id in ids.iter_mut() {
                    match state.queues.get_mut(id) {
                        None => *id |= KFD_DBG_QUEUE_INVALID_MASK,
                        Some(q) if q.debug_suspended == suspend => *id |= KFD_DBG_QUEUE_ERROR_MASK,
                        Some(q) => {
                            q.debug_suspended = suspend;
                            changed += 1;
                        }
                    }
                }
                Ok(changed)
            }
            DbgTrapOp::SetNodeAddressWatch => {
                // SAFETY: `op` selects the union member.
                let w = unsafe { &mut args.data.set_node_address_watch };
                let id = (0..SIM_WATCH_POINTS)
                    .find(|id| !debug.watches.contains_key(id))
                    .ok_or(KfdError::ioctl("dbg_trap", libc::ENOMEM))?;
                debug.watches.insert(
                    id,
                    SimWatch {
                        address: w.address,
                        mode: w.mode,
                        mask: w.mask,
                        gpu_id: w.gpu_id,
                    },
                );
                w.id = id;
                Ok(0)
            }
            DbgTrapOp::ClearNodeAddressWatch => {
                // SAFETY: `op` selects the union member.
                let id = unsafe { args.data.clear_node_address_watch.id };
                debug
                    .watches
                    .remove(&id)
                    .map(|_| 0)
                    .ok_or(KfdError::ioctl("dbg_trap", libc::EINVAL))
            }
            DbgTrapOp::SetFlags => {
                // SAFETY: `op` selects the union member.
                let f = unsafe { &mut args.data.set_flags };
                let previous = debug.flags;
                debug.flags = f.flags;
                f.flags = previous;
                Ok(0)
            }
            DbgTrapOp::QueryDebugEvent => {
                // SAFETY: `op` selects the union member.
                let q = unsafe { &mut args.data.query_debug_event };
                let wanted = q.exception_mask;
                let hit = state
                    .queues
                    .values_mut()
                    .find(|queue| queue.exception_status & wanted != 0);
                match hit {
                    Some(queue) => {
                        q.exception_mask = queue.exception_status & wanted;
                        q.gpu_id = queue.gpu_id;
                        q.queue_id = queue.queue_id;
                        queue.exception_status &= !wanted;
                        Ok(0)
                    }
                    None => Err(KfdError::ioctl("dbg_trap", libc::EAGAIN)),
                }
            }
            DbgTrapOp::QueryExceptionInfo => Err(KfdError::ioctl("dbg_trap", libc::EINVAL)),
            DbgTrapOp::GetQueueSnapshot => {
                // SAFETY: `op` selects the union member.
                let s = unsafe { &mut args.data.queue_snapshot };
                let entry_size = (s.entry_size as usize).min(core::mem::size_of::<QueueSnapshotEntry>());
                let total = state.queues.len() as u32;
                for (i, queue) in state.queues.values_mut().take(s.num_queues as usize).enumerate() {
                    let entry = QueueSnapshotEntry {
                        exception_status: queue.exception_status,
                        ring_base_address: queue.ring_base_address,
                        write_pointer_address: queue.write_pointer_address,
                        read_pointer_address: queue.read_pointer_address,
                        queue_id: queue.queue_id,
                        gpu_id: queue.gpu_id,
                        ring_size: queue.ring_size,
                        queue_type: queue.queue_type,
                        ..Default::default()
                    };
                    queue.exception_status &= !s.exception_mask;
                    // SAFETY: the caller passed `num_queues` entries of `entry_size` bytes.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            (&entry as *const QueueSnapshotEntry).cast::<u8>(),
                            (s.snapshot_buf_ptr as *mut u8).add(i * s.entry_size as usize),
                            entry_size,
                        )
                    };
                }
                s.num_queues = total;
                Ok(0)
            }
            DbgTrapOp::GetDeviceSnapshot => {
                // SAFETY: `op` selects the union member.
                let s = unsafe { &mut args.data.device_snapshot };
                let entry_size = (s.entry_size as usize).min(core::mem::size_of::<DbgDeviceInfoEntry>());
                for (i, device) in state.devices.iter().take(s.num_devices as usize).enumerate() {
                    // SAFETY: the caller passed `num_devices` entries of `entry_size` bytes.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            (device as *const DbgDeviceInfoEntry).cast::<u8>(),
                            (s.snapshot_buf_ptr as *mut u8).add(i * s.entry_size as usize),
                            entry_size,
                        )
                    };
                }
                s.num_devices = state.devices.len() as u32;
                Ok(0)
            }
        }
    }
}

impl KfdDriver for SimulatedKfd {
    fn version(&self) -> KfdVersion {
        self.version
    }

    fn create_queue(&self, args: &mut CreateQueueArgs) -> Result<(), KfdError> {
        let mut state = self.state();
        Self::take_failure(&mut state, SimOp::CreateQueue, "create_queue")?;
        if args.ring_base_address == 0 || args.ring_size == 0 {
            return Err(KfdError::InvalidArgument("empty ring"));
        }

        let queue_id = state.next_queue_id;
        state.next_queue_id += 1;
        let doorbell_offset = DOORBELL_BASE + queue_id as u64 * 8;
        args.queue_id = queue_id;
        args.doorbell_offset = doorbell_offset;

        state
            .doorbells
            .insert(doorbell_offset, Arc::new(RecordingDoorbell::new()));
        state.queues.insert(
            queue_id,
            SimQueue {
                queue_id,
                gpu_id: args.gpu_id,
                queue_type: args.queue_type,
                ring_base_address: args.ring_base_address,
                ring_size: args.ring_size,
                write_pointer_address: args.write_pointer_address,
                read_pointer_address: args.read_pointer_address,
                percentage: args.queue_percentage,
                priority: args.queue_priority,
                cu_mask: None,
                debug_suspended: false,
                exception_status: 0,
                doorbell_offset,
            },
        );
        Ok(())
    }

    fn destroy_queue(&self, queue_id: u32) -> Result<(), KfdError> {
        let mut state = self.state();
        let queue = state
            .queues
            .remove(&queue_id)
            .ok_or(KfdError::NoSuchQueue(queue_id))?;
        state.doorbells.remove(&queue.doorbell_offset);
        Ok(())
    }

    fn update_queue(&self, args: &UpdateQueueArgs) -> Result<(), KfdError> {
        let mut state = self.state();
        Self::take_failure(&mut state, SimOp::UpdateQueue, "update_queue")?;
        let queue = state
            .queues
            .get_mut(&args.queue_id)
            .ok_or(KfdError::NoSuchQueue(args.queue_id))?;
        queue.ring_base_address = args.ring_base_address;
        queue.ring_size = args.ring_size;
        queue.percentage = args.queue_percentage;
        queue.priority = args.queue_priority;
        Ok(())
    }

    fn set_cu_mask(&self, queue_id: u32, mask: &[u32]) -> Result<(), KfdError> {
        let mut state = self.state();
        Self::take_failure(&mut state, SimOp::SetCuMask, "set_cu_mask")?;
        let queue = state
            .queues
            .get_mut(&queue_id)
            .ok_or(KfdError::NoSuchQueue(queue_id))?;
        queue.cu_mask = Some(mask.to_vec());
        Ok(())
    }

    fn map_doorbell(
        &self,
        _gpu_id: u32,
        doorbell_offset: u64,
    ) -> Result<Arc<dyn DoorbellSink>, KfdError> {
        let mut state = self.state();
        Self::take_failure(&mut state, SimOp::MapDoorbell, "map_doorbell")?;
        let doorbell = state
            .doorbells
            .get(&doorbell_offset)
            .cloned()
            .ok_or(KfdError::InvalidArgument("unknown doorbell offset"))?;
        Ok(doorbell)
    }

    fn create_event(&self, args: &mut CreateEventArgs) -> Result<(), KfdError> {
        let mut state = self.state();
        Self::take_failure(&mut state, SimOp::CreateEvent, "create_event")?;
        let id = state.next_event_id;
        state.next_event_id += 1;
        state.events.insert(id, args.event_type);
        args.event_id = id;
        args.event_slot_index = id;
        Ok(())
    }

    fn destroy_event(&self, event_id: u32) -> Result<(), KfdError> {
        self.state()
            .events
            .remove(&event_id)
            .map(drop)
            .ok_or(KfdError::NoSuchEvent(event_id))
    }

    fn dbg_trap(&self, args: &mut DbgTrapArgs) -> Result<u32, KfdError> {
        let mut state = self.state();
        Self::dbg_trap_locked(&mut state, args)
    }
}
