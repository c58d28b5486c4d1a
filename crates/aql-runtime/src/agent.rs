//! A GPU as seen by the queue runtime.

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::scratch::ScratchAllocator;
use crate::signal::SignalRuntime;
use aql_kfd::ioctl::{CreateEventArgs, KFD_IOC_EVENT_QUEUE_EVENT};
use aql_kfd::KfdDriver;
use aql_ring::{DoorbellKind, IndexModel, RingLimits};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GfxVersion {
    pub major: u32,
    pub minor: u32,
    pub stepping: u32,
}

impl GfxVersion {
    pub const fn new(major: u32, minor: u32, stepping: u32) -> Self {
        Self {
            major,
            minor,
            stepping,
        }
    }

    pub fn isa_generation(self) -> IsaGeneration {
        match self.major {
            0..=9 => IsaGeneration::Gfx9,
            10 => IsaGeneration::Gfx10,
            _ => IsaGeneration::Gfx11,
        }
    }

    /// Numeric target id as the driver reports it, e.g. 90010 for gfx90a.
    pub fn target_version(self) -> u32 {
        self.major * 10_000 + self.minor * 100 + self.stepping
    }
}

impl core::fmt::Display for GfxVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "gfx{}{}{:x}", self.major, self.minor, self.stepping)
    }
}

/// Register layout families for scratch descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsaGeneration {
    /// gfx7 through gfx9.
    Gfx9,
    Gfx10,
    Gfx11,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentProperties {
    pub node_id: u32,
    pub gpu_id: u32,
    pub gfx: GfxVersion,
    pub compute_units: u32,
    pub simds_per_cu: u32,
    pub waves_per_simd: u32,
    /// Waves per CU that may hold scratch at once.
    pub scratch_slots_per_cu: u32,
    pub shader_engines: u32,
    /// CUs are unevenly harvested across shader engines.
    pub asymmetric_harvest: bool,
    pub doorbell_kind: DoorbellKind,
    /// How legacy doorbells treat the write index; follows the process pointer width.
    pub index_model: IndexModel,
    /// Double-map the ring so hardware can see a full queue (older parts).
    pub queue_full_workaround: bool,
    pub microcode_version: u32,
    pub is_dgpu: bool,
    /// Bounds on the queue size, in packets, before the double-map halving.
    pub queue_limits: RingLimits,
    pub scratch_base: u64,
    pub scratch_bytes: u64,
}

impl AgentProperties {
    /// A discrete gfx9-family part with conservative defaults.
    pub fn new(gfx: GfxVersion) -> Self {
        Self {
            node_id: 0,
            gpu_id: 1,
            gfx,
            compute_units: 60,
            simds_per_cu: 4,
            waves_per_simd: 10,
            scratch_slots_per_cu: 32,
            shader_engines: 4,
            asymmetric_harvest: false,
            doorbell_kind: if gfx.major >= 9 {
                DoorbellKind::Aql64
            } else {
                DoorbellKind::LegacyDwordOffset
            },
            index_model: IndexModel::native(),
            queue_full_workaround: gfx.major < 9,
            microcode_version: 800,
            is_dgpu: true,
            queue_limits: RingLimits::new(64, 1 << 25),
            scratch_base: 0x7000_0000_0000,
            scratch_bytes: 1 << 30,
        }
    }

    pub fn max_cu_id(&self) -> u32 {
        self.compute_units.saturating_sub(1)
    }

    pub fn max_wave_id(&self) -> u32 {
        (self.simds_per_cu * self.waves_per_simd).saturating_sub(1)
    }

    /// Scratch wave slots across the device.
    ///
    /// With asymmetric harvesting the busiest shader engine decides, so every engine is counted
    /// as if it had that many CUs.
    pub fn max_scratch_slots(&self) -> u64 {
        let mut cus = self.max_cu_id() as u64 + 1;
        if self.asymmetric_harvest && self.shader_engines > 0 {
            let engines = self.shader_engines as u64;
            cus = cus.div_ceil(engines) * engines;
        }
        cus * self.scratch_slots_per_cu as u64
    }

    /// CUs are enabled in pairs from gfx10 on.
    pub fn requires_paired_cus(&self) -> bool {
        self.gfx.major >= 10
    }

    pub fn cu_mask_words(&self) -> usize {
        self.compute_units.div_ceil(32) as usize
    }

    /// Mask with every physical CU set.
    pub fn full_cu_mask(&self) -> Vec<u32> {
        let mut mask = vec![0u32; self.cu_mask_words()];
        for cu in 0..self.compute_units {
            mask[(cu / 32) as usize] |= 1 << (cu % 32);
        }
        mask
    }

    /// Ring size bounds in packets as allocated.
    ///
    /// A double-mapped ring must cover whole pages, and hardware sees twice the packets, so the
    /// upper bound is halved.
    pub fn ring_limits(&self, page_size: usize) -> RingLimits {
        let RingLimits {
            mut min_packets,
            mut max_packets,
        } = self.queue_limits;
        if self.queue_full_workaround {
            let page_packets = (page_size / aql_ring::packet::PACKET_SIZE) as u32;
            min_packets = min_packets.max(page_packets);
            max_packets = (max_packets / 2).max(min_packets);
        }
        RingLimits::new(min_packets, max_packets)
    }

    /// Wave lanes used for scratch sizing when the dispatch does not say otherwise.
    pub fn default_wave_lanes(&self) -> u32 {
        64
    }
}

/// A GPU node with everything its queues share.
pub struct Agent {
    props: AgentProperties,
    driver: Arc<dyn KfdDriver>,
    signals: Arc<SignalRuntime>,
    scratch: ScratchAllocator,
    config: RuntimeConfig,
    queue_event: Mutex<QueueEventState>,
    next_queue_id: AtomicU64,
}

#[derive(Default)]
struct QueueEventState {
    users: u32,
    event_id: Option<u32>,
}

impl Agent {
    pub fn new(
        props: AgentProperties,
        driver: Arc<dyn KfdDriver>,
        signals: Arc<SignalRuntime>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let scratch = ScratchAllocator::new(
            props.scratch_base,
            props.scratch_bytes,
            config.scratch_single_limit,
            config.scratch_async_reclaim,
        );
        tracing::debug!(
            gfx = %props.gfx,
            node = props.node_id,
            cus = props.compute_units,
            "agent ready"
        );
        Arc::new(Self {
            props,
            driver,
            signals,
            scratch,
            config,
            queue_event: Mutex::new(QueueEventState::default()),
            next_queue_id: AtomicU64::new(1),
        })
    }

    pub fn properties(&self) -> &AgentProperties {
        &self.props
    }

    pub fn driver(&self) -> &Arc<dyn KfdDriver> {
        &self.driver
    }

    pub fn signals(&self) -> &Arc<SignalRuntime> {
        &self.signals
    }

    pub fn scratch(&self) -> &ScratchAllocator {
        &self.scratch
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// CU mask applied to every queue on this agent, if configured.
    pub fn global_cu_mask(&self) -> Option<&[u32]> {
        self.config.cu_mask_for(self.props.node_id)
    }

    pub(crate) fn next_queue_id(&self) -> u64 {
        self.next_queue_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Takes a reference on the driver event that reports queue faults, creating it for the first
    /// queue.
    pub(crate) fn acquire_queue_event(self: &Arc<Self>) -> Result<QueueEventRef, RuntimeError> {
        let mut state = self.queue_event.lock().unwrap_or_else(|e| e.into_inner());
        if state.users == 0 {
            let mut args = CreateEventArgs {
                event_type: KFD_IOC_EVENT_QUEUE_EVENT,
                node_id: self.props.node_id,
                auto_reset: 1,
                ..Default::default()
            };
            self.driver.create_event(&mut args)?;
            state.event_id = Some(args.event_id);
        }
        state.users += 1;
        Ok(QueueEventRef {
            agent: self.clone(),
        })
    }

    pub fn queue_event_users(&self) -> u32 {
        self.queue_event
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .users
    }
}

/// Keeps the agent's queue event alive; the last one destroys it.
pub(crate) struct QueueEventRef {
    agent: Arc<Agent>,
}

impl Drop for QueueEventRef {
    fn drop(&mut self) {
        let mut state = self
            .agent
            .queue_event
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        state.users -= 1;
        if state.users == 0 {
            if let Some(id) = state.event_id.take() {
                if let Err(err) = self.agent.driver.destroy_event(id) {
                    tracing::warn!(%err, id, "failed to destroy queue event");
                }
            }
        }
    }
}
