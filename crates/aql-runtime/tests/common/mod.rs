//! Shared helpers for `aql-runtime` integration tests.

#![allow(dead_code)]

use aql_kfd::{KfdVersion, SimulatedKfd};
use aql_ring::{AqlPacket, FenceScope, KernelDispatchPacket, PacketHeader, PacketType};
use aql_runtime::{Agent, AgentProperties, GfxVersion, RuntimeConfig, SignalRuntime};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

/// Routes `tracing` output through the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct Rig {
    pub kfd: Arc<SimulatedKfd>,
    pub agent: Arc<Agent>,
}

impl Rig {
    pub fn new(props: AgentProperties) -> Self {
        Self::with(props, KfdVersion::new(1, 14), RuntimeConfig::default())
    }

    pub fn with(props: AgentProperties, version: KfdVersion, config: RuntimeConfig) -> Self {
        init_tracing();
        let kfd = Arc::new(SimulatedKfd::new(version));
        let signals = SignalRuntime::new().expect("signal runtime");
        let agent = Agent::new(props, kfd.clone(), signals, config);
        Self { kfd, agent }
    }

    pub fn gfx9() -> Self {
        Self::new(small_props(GfxVersion::new(9, 0, 10)))
    }
}

/// A tiny device so scratch sizes stay readable: 2 CUs with 4 scratch slots each.
pub fn small_props(gfx: GfxVersion) -> AgentProperties {
    let mut props = AgentProperties::new(gfx);
    props.compute_units = 2;
    props.scratch_slots_per_cu = 4;
    props.shader_engines = 1;
    props.queue_limits = aql_ring::RingLimits::new(16, 1 << 16);
    props.scratch_bytes = 64 << 20;
    props
}

pub fn dispatch(private_segment_size: u32, completion_signal: u64) -> AqlPacket {
    KernelDispatchPacket {
        header: PacketHeader::new(
            PacketType::KernelDispatch,
            false,
            FenceScope::System,
            FenceScope::System,
        ),
        dimensions: 1,
        workgroup_size: [64, 1, 1],
        grid_size: [256, 1, 1],
        private_segment_size,
        group_segment_size: 0,
        kernel_object: 0x1000,
        kernarg_address: 0,
        completion_signal,
    }
    .to_packet()
}

/// Polls `cond` until it holds or a generous deadline passes.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
