use crate::config::ConfigError;
use aql_kfd::KfdError;
use aql_ring::RingError;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Driver(#[from] KfdError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("queue {0} is not active")]
    QueueInactive(u64),
    #[error("out of resources: {0}")]
    OutOfResources(&'static str),
    #[error("not supported: {0}")]
    Unsupported(&'static str),
}

/// A fault a queue reports asynchronously through its error callback.
///
/// The queue has already been suspended when the callback sees one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueFault {
    #[error("out of resources")]
    OutOfResources,
    #[error("dispatch dimensions are incompatible")]
    IncompatibleArguments,
    #[error("group segment allocation is invalid")]
    InvalidAllocation,
    #[error("code object is invalid")]
    InvalidCodeObject,
    #[error("packet format is invalid")]
    InvalidPacketFormat,
    #[error("dispatch argument is invalid")]
    InvalidArgument,
    #[error("kernel register requirements are invalid for this ISA")]
    InvalidIsa,
    #[error("memory aperture violation")]
    MemoryApertureViolation,
    #[error("memory fault")]
    MemoryFault,
    #[error("illegal instruction")]
    IllegalInstruction,
    #[error("wave exception")]
    Exception,
    #[error("undefined error code {0:#x}")]
    Undefined(u64),
}
