//! The queue descriptor shared with the command processor.
//!
//! Hardware and firmware read this structure by address, so its layout is fixed. Fields the
//! runtime mutates while the queue runs are atomics of the same width.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const QUEUE_TYPE_MULTIPLE: u32 = 0;
pub const QUEUE_FEATURE_KERNEL_DISPATCH: u32 = 1;
pub const QUEUE_FEATURE_AGENT_DISPATCH: u32 = 2;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct QueueProperties: u32 {
        const ENABLE_TRAP_HANDLER = 1 << 0;
        const IS_PTR64 = 1 << 1;
        const ENABLE_TRAP_HANDLER_DEBUG_SGPRS = 1 << 2;
        const ENABLE_PROFILING = 1 << 3;
        /// Scratch is released after the next dispatch that uses it.
        const USE_SCRATCH_ONCE = 1 << 4;
    }
}

#[repr(C, align(64))]
pub struct AmdQueueDescriptor {
    pub queue_type: u32,
    pub features: u32,
    pub base_address: u64,
    pub doorbell_signal: u64,
    pub size: u32,
    reserved0: u32,
    pub id: u64,
    pub caps: u32,
    reserved1: [u32; 3],
    pub write_dispatch_id: AtomicU64,
    pub group_segment_aperture_base_hi: u32,
    pub private_segment_aperture_base_hi: u32,
    pub max_cu_id: u32,
    pub max_wave_id: u32,
    pub max_legacy_doorbell_dispatch_id_plus_1: AtomicU64,
    pub legacy_doorbell_lock: AtomicU32,
    reserved2: [u32; 9],
    pub read_dispatch_id: AtomicU64,
    pub read_dispatch_id_field_base_byte_offset: u32,
    pub compute_tmpring_size: AtomicU32,
    pub scratch_resource_descriptor: [AtomicU32; 4],
    pub scratch_backing_memory_location: AtomicU64,
    pub scratch_backing_memory_byte_size: AtomicU64,
    pub scratch_wave64_lane_byte_size: AtomicU32,
    pub queue_properties: AtomicU32,
    pub scratch_last_used_index: AtomicU64,
    pub queue_inactive_signal: u64,
    reserved4: [u32; 14],
}

const _: () = assert!(core::mem::size_of::<AmdQueueDescriptor>() == 256);

impl AmdQueueDescriptor {
    pub fn new(id: u64, ring_base: u64, size: u32, inactive_signal: u64) -> Self {
        Self {
            queue_type: QUEUE_TYPE_MULTIPLE,
            features: QUEUE_FEATURE_KERNEL_DISPATCH,
            base_address: ring_base,
            doorbell_signal: 0,
            size,
            reserved0: 0,
            id,
            caps: 0,
            reserved1: [0; 3],
            write_dispatch_id: AtomicU64::new(0),
            group_segment_aperture_base_hi: 0,
            private_segment_aperture_base_hi: 0,
            max_cu_id: 0,
            max_wave_id: 0,
            max_legacy_doorbell_dispatch_id_plus_1: AtomicU64::new(0),
            legacy_doorbell_lock: AtomicU32::new(0),
            reserved2: [0; 9],
            read_dispatch_id: AtomicU64::new(0),
            read_dispatch_id_field_base_byte_offset: core::mem::offset_of!(Self, read_dispatch_id)
                as u32,
            compute_tmpring_size: AtomicU32::new(0),
            scratch_resource_descriptor: Default::default(),
            scratch_backing_memory_location: AtomicU64::new(0),
            scratch_backing_memory_byte_size: AtomicU64::new(0),
            scratch_wave64_lane_byte_size: AtomicU32::new(0),
            queue_properties: AtomicU32::new(QueueProperties::IS_PTR64.bits()),
            scratch_last_used_index: AtomicU64::new(0),
            queue_inactive_signal: inactive_signal,
            reserved4: [0; 14],
        }
    }

    pub fn properties(&self) -> QueueProperties {
        QueueProperties::from_bits_retain(self.queue_properties.load(Ordering::Acquire))
    }

    pub fn insert_properties(&self, flags: QueueProperties) {
        self.queue_properties.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn remove_properties(&self, flags: QueueProperties) {
        self.queue_properties
            .fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn srd(&self) -> [u32; 4] {
        core::array::from_fn(|i| self.scratch_resource_descriptor[i].load(Ordering::Acquire))
    }

    pub fn address(&self) -> u64 {
        self as *const Self as u64
    }

    pub fn write_pointer_address(&self) -> u64 {
        &self.write_dispatch_id as *const AtomicU64 as u64
    }

    pub fn read_pointer_address(&self) -> u64 {
        &self.read_dispatch_id as *const AtomicU64 as u64
    }
}
