//! User-mode GPU compute queue runtime.
//!
//! An [`Agent`] bundles a GPU with its driver, scratch pool and signal runtime. [`AqlQueue`]
//! owns one hardware queue and keeps it running: it grows scratch on demand and reports faults.
//! [`InterceptQueue`] lets tools rewrite packets on their way to an `AqlQueue`.
//! [`sim::PacketProcessor`] consumes queues in software for tests and tooling.

pub mod agent;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod queue;
pub mod regs;
pub mod scratch;
pub mod signal;
pub mod sim;

pub use agent::{Agent, AgentProperties, GfxVersion, IsaGeneration};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{QueueFault, RuntimeError};
pub use queue::{
    reserve_slots, submit_packets, AqlQueue, CuMaskOutcome, ErrorCallback, InterceptQueue,
    Interceptor, MarkerCallback, PacketWriter, Queue, QueueOptions, QueuePriority, QueueState,
};
pub use scratch::{ScratchAllocator, ScratchInfo, ScratchRequest, ScratchStats};
pub use signal::{Condition, HostSignal, Signal, SignalRuntime};
