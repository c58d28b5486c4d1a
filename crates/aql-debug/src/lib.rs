//! Debugger side of the driver's debug trap.
//!
//! A [`DebugSession`] enables the trap for one process and owns the pipe the driver writes to
//! when a watched exception fires. Everything else is a thin typed layer over the trap's
//! sub-operations.

mod pipe;
pub mod session;

pub use session::{
    DebugEvent, DebugFlags, DebugSession, LaunchOverride, QueueStatus, QueueUpdate,
    WatchMode, WatchPoint, WaveLaunchMode, WaveLaunchOverrideMode,
};

use aql_kfd::{KfdError, KfdVersion};
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    #[error("driver {0} has no debug trap")]
    Unsupported(KfdVersion),
    #[error("a debugger is already attached to process {0}")]
    AlreadyAttached(u32),
    #[error("failed to {op} debug event pipe")]
    Pipe {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Kfd(#[from] KfdError),
}
