//! amdkfd ioctl argument layouts and request codes.
//!
//! Every struct here is shared with the kernel byte for byte; the tests at the bottom pin sizes
//! and offsets.

use core::mem::size_of;

pub const KFD_IOCTL_BASE: u32 = b'K' as u32;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32 & 0x3FFF) << 16) | (KFD_IOCTL_BASE << 8) | nr
}

pub const fn ior<T>(nr: u32) -> u32 {
    ioc(IOC_READ, nr, size_of::<T>())
}

pub const fn iow<T>(nr: u32) -> u32 {
    ioc(IOC_WRITE, nr, size_of::<T>())
}

pub const fn iowr<T>(nr: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, nr, size_of::<T>())
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetVersionArgs {
    pub major_version: u32,
    pub minor_version: u32,
}

pub const KFD_IOC_QUEUE_TYPE_COMPUTE_AQL: u32 = 0x2;
pub const KFD_MAX_QUEUE_PERCENTAGE: u32 = 100;
pub const KFD_MAX_QUEUE_PRIORITY: u32 = 15;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CreateQueueArgs {
    pub ring_base_address: u64,
    pub write_pointer_address: u64,
    pub read_pointer_address: u64,
    /// Out: mmap offset of the queue's doorbell.
    pub doorbell_offset: u64,

    pub ring_size: u32,
    pub gpu_id: u32,
    pub queue_type: u32,
    pub queue_percentage: u32,
    pub queue_priority: u32,
    /// Out.
    pub queue_id: u32,

    pub eop_buffer_address: u64,
    pub eop_buffer_size: u64,
    pub ctx_save_restore_address: u64,
    pub ctx_save_restore_size: u32,
    pub ctl_stack_size: u32,
    pub sdma_engine_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DestroyQueueArgs {
    pub queue_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct UpdateQueueArgs {
    pub ring_base_address: u64,
    pub queue_id: u32,
    pub ring_size: u32,
    pub queue_percentage: u32,
    pub queue_priority: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SetCuMaskArgs {
    pub queue_id: u32,
    /// Number of mask bits, a multiple of 32.
    pub num_cu_mask: u32,
    pub cu_mask_ptr: u64,
}

pub const KFD_IOC_EVENT_SIGNAL: u32 = 0;
pub const KFD_IOC_EVENT_DEBUG_EVENT: u32 = 5;
pub const KFD_IOC_EVENT_QUEUE_EVENT: u32 = 7;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CreateEventArgs {
    pub event_page_offset: u64,
    pub event_trigger_data: u32,
    pub event_type: u32,
    pub auto_reset: u32,
    pub node_id: u32,
    pub event_id: u32,
    pub event_slot_index: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DestroyEventArgs {
    pub event_id: u32,
    pub pad: u32,
}

/// Exception codes. Masks are `1 << (code - 1)`.
pub mod ec {
    pub const QUEUE_WAVE_ABORT: u32 = 1;
    pub const QUEUE_WAVE_TRAP: u32 = 2;
    pub const QUEUE_WAVE_MATH_ERROR: u32 = 3;
    pub const QUEUE_WAVE_ILLEGAL_INSTRUCTION: u32 = 4;
    pub const QUEUE_WAVE_MEMORY_VIOLATION: u32 = 5;
    pub const QUEUE_WAVE_APERTURE_VIOLATION: u32 = 6;
    pub const QUEUE_PACKET_DISPATCH_DIM_INVALID: u32 = 16;
    pub const QUEUE_PACKET_DISPATCH_GROUP_SEGMENT_SIZE_INVALID: u32 = 17;
    pub const QUEUE_PACKET_DISPATCH_CODE_INVALID: u32 = 18;
    pub const QUEUE_PACKET_RESERVED: u32 = 19;
    pub const QUEUE_PACKET_UNSUPPORTED: u32 = 20;
    pub const QUEUE_PACKET_DISPATCH_WORK_GROUP_SIZE_INVALID: u32 = 21;
    pub const QUEUE_PACKET_DISPATCH_REGISTER_INVALID: u32 = 22;
    pub const QUEUE_PACKET_VENDOR_UNSUPPORTED: u32 = 23;
    pub const QUEUE_PREEMPTION_ERROR: u32 = 30;
    pub const QUEUE_NEW: u32 = 31;
    pub const DEVICE_QUEUE_DELETE: u32 = 32;
    pub const DEVICE_MEMORY_VIOLATION: u32 = 33;
    pub const DEVICE_NEW: u32 = 36;
    pub const PROCESS_RUNTIME: u32 = 48;

    pub const fn mask(code: u32) -> u64 {
        1 << (code - 1)
    }
}

pub const KFD_DBG_QUEUE_ERROR_BIT: u32 = 30;
pub const KFD_DBG_QUEUE_INVALID_BIT: u32 = 31;
pub const KFD_DBG_QUEUE_ERROR_MASK: u32 = 1 << KFD_DBG_QUEUE_ERROR_BIT;
pub const KFD_DBG_QUEUE_INVALID_MASK: u32 = 1 << KFD_DBG_QUEUE_INVALID_BIT;

/// Runtime state the driver reports when a debugger enables the trap.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub r_debug: u64,
    pub runtime_state: u32,
    pub ttmp_setup: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct QueueSnapshotEntry {
    pub exception_status: u64,
    pub ring_base_address: u64,
    pub write_pointer_address: u64,
    pub read_pointer_address: u64,
    pub ctx_save_restore_address: u64,
    pub queue_id: u32,
    pub gpu_id: u32,
    pub ring_size: u32,
    pub queue_type: u32,
    pub ctx_save_restore_area_size: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DbgDeviceInfoEntry {
    pub exception_status: u64,
    pub lds_base: u64,
    pub lds_limit: u64,
    pub scratch_base: u64,
    pub scratch_limit: u64,
    pub gpuvm_base: u64,
    pub gpuvm_limit: u64,
    pub gpu_id: u32,
    pub location_id: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub revision_id: u32,
    pub subsystem_vendor_id: u32,
    pub subsystem_device_id: u32,
    pub fw_version: u32,
    pub gfx_target_version: u32,
    pub simd_count: u32,
    pub max_waves_per_simd: u32,
    pub array_count: u32,
    pub simd_arrays_per_engine: u32,
    pub num_xcc: u32,
    pub capability: u32,
    pub debug_prop: u32,
}

/// Debug-trap sub-operations, the `op` field of [`DbgTrapArgs`].
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbgTrapOp {
    Enable = 0,
    Disable = 1,
    SendRuntimeEvent = 2,
    SetExceptionsEnabled = 3,
    SetWaveLaunchOverride = 4,
    SetWaveLaunchMode = 5,
    SuspendQueues = 6,
    ResumeQueues = 7,
    SetNodeAddressWatch = 8,
    ClearNodeAddressWatch = 9,
    SetFlags = 10,
    QueryDebugEvent = 11,
    QueryExceptionInfo = 12,
    GetQueueSnapshot = 13,
    GetDeviceSnapshot = 14,
}

impl DbgTrapOp {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Enable,
            1 => Self::Disable,
            2 => Self::SendRuntimeEvent,
            3 => Self::SetExceptionsEnabled,
            4 => Self::SetWaveLaunchOverride,
            5 => Self::SetWaveLaunchMode,
            6 => Self::SuspendQueues,
            7 => Self::ResumeQueues,
            8 => Self::SetNodeAddressWatch,
            9 => Self::ClearNodeAddressWatch,
            10 => Self::SetFlags,
            11 => Self::QueryDebugEvent,
            12 => Self::QueryExceptionInfo,
            13 => Self::GetQueueSnapshot,
            14 => Self::GetDeviceSnapshot,
            _ => return None,
        })
    }
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapEnableArgs {
    pub exception_mask: u64,
    pub rinfo_ptr: u64,
    pub rinfo_size: u32,
    pub dbg_fd: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapSendRuntimeEventArgs {
    pub exception_mask: u64,
    pub gpu_id: u32,
    pub queue_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapSetExceptionsEnabledArgs {
    pub exception_mask: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapSetWaveLaunchOverrideArgs {
    pub override_mode: u32,
    pub enable_mask: u32,
    pub support_request_mask: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapSetWaveLaunchModeArgs {
    pub launch_mode: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapSuspendQueuesArgs {
    pub exception_mask: u64,
    pub queue_array_ptr: u64,
    pub num_queues: u32,
    pub grace_period: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapResumeQueuesArgs {
    pub queue_array_ptr: u64,
    pub num_queues: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapSetNodeAddressWatchArgs {
    pub address: u64,
    pub mode: u32,
    pub mask: u32,
    pub gpu_id: u32,
    /// Out: watch point id.
    pub id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapClearNodeAddressWatchArgs {
    pub gpu_id: u32,
    pub id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapSetFlagsArgs {
    /// In: flags to set. Out: flags previously set.
    pub flags: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapQueryDebugEventArgs {
    pub exception_mask: u64,
    pub gpu_id: u32,
    pub queue_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapQueryExceptionInfoArgs {
    pub info_ptr: u64,
    pub info_size: u32,
    pub source_id: u32,
    pub exception_code: u32,
    pub clear_exception: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapQueueSnapshotArgs {
    pub exception_mask: u64,
    pub snapshot_buf_ptr: u64,
    /// In: buffer capacity in entries. Out: queues that exist.
    pub num_queues: u32,
    pub entry_size: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DbgTrapDeviceSnapshotArgs {
    pub exception_mask: u64,
    pub snapshot_buf_ptr: u64,
    pub num_devices: u32,
    pub entry_size: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union DbgTrapArgsUnion {
    pub enable: DbgTrapEnableArgs,
    pub send_runtime_event: DbgTrapSendRuntimeEventArgs,
    pub set_exceptions_enabled: DbgTrapSetExceptionsEnabledArgs,
    pub launch_override: DbgTrapSetWaveLaunchOverrideArgs,
    pub launch_mode: DbgTrapSetWaveLaunchModeArgs,
    pub suspend_queues: DbgTrapSuspendQueuesArgs,
    pub resume_queues: DbgTrapResumeQueuesArgs,
    pub set_node_address_watch: DbgTrapSetNodeAddressWatchArgs,
    pub clear_node_address_watch: DbgTrapClearNodeAddressWatchArgs,
    pub set_flags: DbgTrapSetFlagsArgs,
    pub query_debug_event: DbgTrapQueryDebugEventArgs,
    pub query_exception_info: DbgTrapQueryExceptionInfoArgs,
    pub queue_snapshot: DbgTrapQueueSnapshotArgs,
    pub device_snapshot: DbgTrapDeviceSnapshotArgs,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct DbgTrapArgs {
    pub pid: u32,
    pub op: u32,
    pub data: DbgTrapArgsUnion,
}

impl DbgTrapArgs {
    /// Arguments for `op` with every union byte zeroed.
    pub fn new(pid: u32, op: DbgTrapOp) -> Self {
        Self {
            pid,
            op: op as u32,
            // Largest members are 24 bytes without padding, so this zeroes the whole union.
            data: DbgTrapArgsUnion {
                device_snapshot: DbgTrapDeviceSnapshotArgs::default(),
            },
        }
    }

    pub fn op(&self) -> Option<DbgTrapOp> {
        DbgTrapOp::from_raw(self.op)
    }
}

impl core::fmt::Debug for DbgTrapArgs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DbgTrapArgs")
            .field("pid", &self.pid)
            .field("op", &self.op())
            .finish_non_exhaustive()
    }
}

pub const AMDKFD_IOC_GET_VERSION: u32 = ior::<GetVersionArgs>(0x01);
pub const AMDKFD_IOC_CREATE_QUEUE: u32 = iowr::<CreateQueueArgs>(0x02);
pub const AMDKFD_IOC_DESTROY_QUEUE: u32 = iowr::<DestroyQueueArgs>(0x03);
pub const AMDKFD_IOC_UPDATE_QUEUE: u32 = iow::<UpdateQueueArgs>(0x07);
pub const AMDKFD_IOC_CREATE_EVENT: u32 = iowr::<CreateEventArgs>(0x08);
pub const AMDKFD_IOC_DESTROY_EVENT: u32 = iow::<DestroyEventArgs>(0x09);
pub const AMDKFD_IOC_SET_CU_MASK: u32 = iow::<SetCuMaskArgs>(0x1A);
pub const AMDKFD_IOC_DBG_TRAP: u32 = iowr::<DbgTrapArgs>(0x26);

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;
    use pretty_assertions::assert_eq;

    #[test]
    fn create_queue_layout() {
        assert_eq!(size_of::<CreateQueueArgs>(), 96);
        assert_eq!(offset_of!(CreateQueueArgs, doorbell_offset), 24);
        assert_eq!(offset_of!(CreateQueueArgs, ring_size), 32);
        assert_eq!(offset_of!(CreateQueueArgs, queue_id), 52);
        assert_eq!(offset_of!(CreateQueueArgs, eop_buffer_address), 56);
        assert_eq!(offset_of!(CreateQueueArgs, ctx_save_restore_size), 80);
        assert_eq!(offset_of!(CreateQueueArgs, pad), 92);
    }

    #[test]
    fn small_arg_layouts() {
        assert_eq!(size_of::<UpdateQueueArgs>(), 24);
        assert_eq!(size_of::<SetCuMaskArgs>(), 16);
        assert_eq!(offset_of!(SetCuMaskArgs, cu_mask_ptr), 8);
        assert_eq!(size_of::<CreateEventArgs>(), 32);
        assert_eq!(offset_of!(CreateEventArgs, event_id), 24);
        assert_eq!(size_of::<QueueSnapshotEntry>(), 64);
        assert_eq!(size_of::<DbgDeviceInfoEntry>(), 120);
        assert_eq!(size_of::<RuntimeInfo>(), 16);
    }

    #[test]
    fn dbg_trap_layout() {
        assert_eq!(size_of::<DbgTrapArgsUnion>(), 24);
        assert_eq!(size_of::<DbgTrapArgs>(), 32);
        assert_eq!(offset_of!(DbgTrapArgs, data), 8);
        assert_eq!(offset_of!(DbgTrapEnableArgs, dbg_fd), 20);
        assert_eq!(offset_of!(DbgTrapSuspendQueuesArgs, grace_period), 20);
        assert_eq!(offset_of!(DbgTrapSetNodeAddressWatchArgs, id), 20);
    }

    #[test]
    fn request_codes() {
        assert_eq!(AMDKFD_IOC_GET_VERSION, 0x8008_4B01);
        assert_eq!(AMDKFD_IOC_CREATE_QUEUE, 0xC060_4B02);
        assert_eq!(AMDKFD_IOC_SET_CU_MASK, 0x4010_4B1A);
        assert_eq!(AMDKFD_IOC_DBG_TRAP, 0xC020_4B26);
    }

    #[test]
    fn new_args_zero_the_union() {
        let args = DbgTrapArgs::new(7, DbgTrapOp::SuspendQueues);
        // SAFETY: every member is plain integers; the constructor zeroed all 24 bytes.
        let raw: [u8; 32] = unsafe { core::mem::transmute(args) };
        assert_eq!(&raw[8..], &[0u8; 24]);
        assert_eq!(args.op(), Some(DbgTrapOp::SuspendQueues));
    }

    #[test]
    fn exception_masks_are_one_based() {
        assert_eq!(ec::mask(ec::QUEUE_WAVE_ABORT), 1);
        assert_eq!(ec::mask(ec::QUEUE_PACKET_DISPATCH_DIM_INVALID), 1 << 15);
    }
}
