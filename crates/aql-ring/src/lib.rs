//! Producer-side building blocks of an AQL hardware queue.
//!
//! - [`packet`]: the 64-byte slot format and its typed views.
//! - [`ring`]: the power-of-two slot array, optionally double-mapped.
//! - [`doorbell`]: "new work exists" notification, native or legacy.

pub mod doorbell;
pub mod packet;
pub mod ring;

pub use doorbell::{Doorbell, DoorbellKind, DoorbellSink, IndexModel, MmioDoorbell, RecordingDoorbell};
pub use packet::{
    AqlPacket, BarrierAndPacket, FenceScope, InterceptMarker, KernelDispatchPacket, PacketHeader,
    PacketType, Pm4IbPacket,
};
pub use ring::{mapping_stats, page_size, MappingStats, RingBuffer, RingError, RingLimits};
