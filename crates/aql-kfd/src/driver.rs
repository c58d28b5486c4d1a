use crate::ioctl::{CreateEventArgs, CreateQueueArgs, DbgTrapArgs, UpdateQueueArgs};
use aql_ring::DoorbellSink;
use std::io;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum KfdError {
    #[error("failed to open {path}")]
    Open {
        path: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{request} ioctl failed")]
    Ioctl {
        request: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to map doorbell page at offset {offset:#x}")]
    DoorbellMap {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("queue {0} does not exist")]
    NoSuchQueue(u32),
    #[error("event {0} does not exist")]
    NoSuchEvent(u32),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl KfdError {
    pub(crate) fn ioctl(request: &'static str, errno: i32) -> Self {
        Self::Ioctl {
            request,
            source: io::Error::from_raw_os_error(errno),
        }
    }

    /// The driver had nothing to report yet (`EAGAIN`).
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Ioctl { source, .. } if source.raw_os_error() == Some(libc::EAGAIN))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KfdVersion {
    pub major: u32,
    pub minor: u32,
}

impl KfdVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Per-queue exception signals and the debug-trap ioctl.
    pub fn supports_exception_debugging(self) -> bool {
        self >= Self::new(1, 13)
    }
}

impl core::fmt::Display for KfdVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The subset of the amdkfd interface the runtime drives.
///
/// Argument structs are the raw ABI layouts; implementations fill the out-fields in place.
pub trait KfdDriver: Send + Sync {
    fn version(&self) -> KfdVersion;

    fn create_queue(&self, args: &mut CreateQueueArgs) -> Result<(), KfdError>;

    fn destroy_queue(&self, queue_id: u32) -> Result<(), KfdError>;

    fn update_queue(&self, args: &UpdateQueueArgs) -> Result<(), KfdError>;

    /// `mask` holds one bit per CU, 32 per word.
    fn set_cu_mask(&self, queue_id: u32, mask: &[u32]) -> Result<(), KfdError>;

    /// Maps the doorbell register returned by `create_queue`.
    fn map_doorbell(&self, gpu_id: u32, doorbell_offset: u64)
        -> Result<Arc<dyn DoorbellSink>, KfdError>;

    fn create_event(&self, args: &mut CreateEventArgs) -> Result<(), KfdError>;

    fn destroy_event(&self, event_id: u32) -> Result<(), KfdError>;

    /// Returns the ioctl's non-negative result (e.g. the number of queues suspended).
    fn dbg_trap(&self, args: &mut DbgTrapArgs) -> Result<u32, KfdError>;
}
