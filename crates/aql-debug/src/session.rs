//! A debugger's hold on one process's debug trap.

use crate::pipe::EventPipe;
use crate::DebugError;
use aql_kfd::ioctl::{
    DbgDeviceInfoEntry, DbgTrapArgs, DbgTrapClearNodeAddressWatchArgs, DbgTrapDeviceSnapshotArgs,
    DbgTrapEnableArgs, DbgTrapOp, DbgTrapQueryDebugEventArgs, DbgTrapQueueSnapshotArgs,
    DbgTrapResumeQueuesArgs, DbgTrapSendRuntimeEventArgs, DbgTrapSetExceptionsEnabledArgs,
    DbgTrapSetFlagsArgs, DbgTrapSetNodeAddressWatchArgs, DbgTrapSetWaveLaunchModeArgs,
    DbgTrapSetWaveLaunchOverrideArgs, DbgTrapSuspendQueuesArgs, QueueSnapshotEntry, RuntimeInfo,
    KFD_DBG_QUEUE_ERROR_MASK, KFD_DBG_QUEUE_INVALID_MASK,
};
use aql_kfd::{KfdDriver, KfdError};
use std::sync::Arc;
use std::time::Duration;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        const SINGLE_MEMORY_OP = 1 << 0;
        const SINGLE_ALU_OP = 1 << 1;
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaveLaunchOverrideMode {
    Or = 0,
    Replace = 1,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaveLaunchMode {
    Normal = 0,
    Halt = 1,
    Debug = 3,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchMode {
    Read = 0,
    NonRead = 1,
    Atomic = 2,
    All = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchPoint {
    pub gpu_id: u32,
    pub id: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchOverride {
    /// Override bits that were enabled before this call.
    pub previous_mask: u32,
    /// Override bits the hardware supports.
    pub supported_mask: u32,
}

/// What the driver reported for one queue id of a suspend or resume request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    Updated,
    /// Already in the requested state, or the driver could not move it.
    Error,
    /// No such queue.
    Invalid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueUpdate {
    pub updated: u32,
    pub queues: Vec<(u32, QueueStatus)>,
}

impl QueueUpdate {
    fn from_marked(updated: u32, marked: &[u32]) -> Self {
        let flags = KFD_DBG_QUEUE_ERROR_MASK | KFD_DBG_QUEUE_INVALID_MASK;
        let queues = marked
            .iter()
            .map(|&raw| {
                let status = if raw & KFD_DBG_QUEUE_INVALID_MASK != 0 {
                    QueueStatus::Invalid
                } else if raw & KFD_DBG_QUEUE_ERROR_MASK != 0 {
                    QueueStatus::Error
                } else {
                    QueueStatus::Updated
                };
                (raw & !flags, status)
            })
            .collect();
        Self { updated, queues }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugEvent {
    pub exception_mask: u64,
    pub gpu_id: u32,
    pub queue_id: u32,
}

pub struct DebugSession {
    driver: Arc<dyn KfdDriver>,
    pid: u32,
    runtime_info: RuntimeInfo,
    pipe: EventPipe,
}

impl DebugSession {
    /// Enables the debug trap for `pid`, asking to be woken for `exception_mask`.
    pub fn attach(
        driver: Arc<dyn KfdDriver>,
        pid: u32,
        exception_mask: u64,
    ) -> Result<Self, DebugError> {
        let version = driver.version();
        if !version.supports_exception_debugging() {
            return Err(DebugError::Unsupported(version));
        }

        let pipe = EventPipe::new()?;
        let mut runtime_info = RuntimeInfo::default();
        let mut args = DbgTrapArgs::new(pid, DbgTrapOp::Enable);
        args.data.enable = DbgTrapEnableArgs {
            exception_mask,
            rinfo_ptr: &mut runtime_info as *mut RuntimeInfo as u64,
            rinfo_size: std::mem::size_of::<RuntimeInfo>() as u32,
            dbg_fd: pipe.write_fd() as u32,
        };
        match driver.dbg_trap(&mut args) {
            Ok(_) => {}
            Err(KfdError::Ioctl { source, .. }) if source.raw_os_error() == Some(libc::EBUSY) => {
                return Err(DebugError::AlreadyAttached(pid));
            }
            Err(err) => return Err(err.into()),
        }

        tracing::debug!(
            pid,
            exception_mask,
            runtime_state = runtime_info.runtime_state,
            "debug trap enabled"
        );
        Ok(Self {
            driver,
            pid,
            runtime_info,
            pipe,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// What the driver reported about the runtime when the trap was enabled.
    pub fn runtime_info(&self) -> RuntimeInfo {
        self.runtime_info
    }

    fn trap(
        &self,
        op: DbgTrapOp,
        fill: impl FnOnce(&mut DbgTrapArgs),
    ) -> Result<(DbgTrapArgs, u32), DebugError> {
        let mut args = DbgTrapArgs::new(self.pid, op);
        fill(&mut args);
        let rc = self.driver.dbg_trap(&mut args)?;
        Ok((args, rc))
    }

    pub fn send_runtime_event(
        &self,
        exception_mask: u64,
        gpu_id: u32,
        queue_id: u32,
    ) -> Result<(), DebugError> {
        self.trap(DbgTrapOp::SendRuntimeEvent, |args| {
            args.data.send_runtime_event = DbgTrapSendRuntimeEventArgs {
                exception_mask,
                gpu_id,
                queue_id,
            };
        })?;
        Ok(())
    }

    /// Replaces the set of exceptions that wake this session.
    pub fn set_exceptions_enabled(&self, exception_mask: u64) -> Result<(), DebugError> {
        self.trap(DbgTrapOp::SetExceptionsEnabled, |args| {
            args.data.set_exceptions_enabled = DbgTrapSetExceptionsEnabledArgs { exception_mask };
        })?;
        Ok(())
    }

    /// Returns the next pending event among `exception_mask`, clearing it, or `None` if there is
    /// nothing pending.
    pub fn query_debug_event(
        &self,
        exception_mask: u64,
    ) -> Result<Option<DebugEvent>, DebugError> {
        let result = self.trap(DbgTrapOp::QueryDebugEvent, |args| {
            args.data.query_debug_event = DbgTrapQueryDebugEventArgs {
                exception_mask,
                ..Default::default()
            };
        });
        match result {
            Ok((args, _)) => {
                // SAFETY: the union member matches the op.
                let q = unsafe { args.data.query_debug_event };
                Ok(Some(DebugEvent {
                    exception_mask: q.exception_mask,
                    gpu_id: q.gpu_id,
                    queue_id: q.queue_id,
                }))
            }
            Err(DebugError::Kfd(err)) if err.is_would_block() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Blocks until the driver posts an event or `timeout` elapses.
    ///
    /// On wake-up, drains exactly the bytes pending so the next notification is not lost, and
    /// returns `true`. The caller then queries events until `query_debug_event` returns `None`.
    pub fn wait_event(&self, timeout: Option<Duration>) -> Result<bool, DebugError> {
        if !self.pipe.poll(timeout)? {
            return Ok(false);
        }
        let drained = self.pipe.drain()?;
        tracing::trace!(pid = self.pid, drained, "debug event pipe woke");
        Ok(true)
    }

    fn update_queues(
        &self,
        op: DbgTrapOp,
        ids: &[u32],
        exception_mask: u64,
        grace_period: u32,
    ) -> Result<QueueUpdate, DebugError> {
        let mut marked = ids.to_vec();
        let ptr = marked.as_mut_ptr() as u64;
        let num_queues = marked.len() as u32;
        let (_, updated) = self.trap(op, |args| {
            if op == DbgTrapOp::SuspendQueues {
                args.data.suspend_queues = DbgTrapSuspendQueuesArgs {
                    exception_mask,
                    queue_array_ptr: ptr,
                    num_queues,
                    grace_period,
                };
            } else {
                args.data.resume_queues = DbgTrapResumeQueuesArgs {
                    queue_array_ptr: ptr,
                    num_queues,
                    pad: 0,
                };
            }
        })?;
        let update = QueueUpdate::from_marked(updated, &marked);
        tracing::debug!(
            pid = self.pid,
            ?op,
            requested = ids.len(),
            updated,
            "queue debug state changed"
        );
        Ok(update)
    }

    /// Suspends `ids`, clearing `exception_mask` on each. `grace_period` is in microseconds.
    pub fn suspend_queues(
        &self,
        ids: &[u32],
        exception_mask: u64,
        grace_period: u32,
    ) -> Result<QueueUpdate, DebugError> {
        self.update_queues(DbgTrapOp::SuspendQueues, ids, exception_mask, grace_period)
    }

    pub fn resume_queues(&self, ids: &[u32]) -> Result<QueueUpdate, DebugError> {
        self.update_queues(DbgTrapOp::ResumeQueues, ids, 0, 0)
    }

    /// Every queue of the process. Exception bits in `exception_mask` are cleared on the queues
    /// reported.
    pub fn queue_snapshot(
        &self,
        exception_mask: u64,
    ) -> Result<Vec<QueueSnapshotEntry>, DebugError> {
        let entry_size = std::mem::size_of::<QueueSnapshotEntry>() as u32;
        let mut capacity = 0u32;
        loop {
            let mut entries = vec![QueueSnapshotEntry::default(); capacity as usize];
            let buf = entries.as_mut_ptr() as u64;
            // Probe with an empty mask so nothing is cleared until the buffer is big enough.
            let mask = if capacity == 0 { 0 } else { exception_mask };
            let (args, _) = self.trap(DbgTrapOp::GetQueueSnapshot, |args| {
                args.data.queue_snapshot = DbgTrapQueueSnapshotArgs {
                    exception_mask: mask,
                    snapshot_buf_ptr: buf,
                    num_queues: capacity,
                    entry_size,
                };
            })?;
            // SAFETY: the union member matches the op.
            let total = unsafe { args.data.queue_snapshot.num_queues };
            if total <= capacity {
                entries.truncate(total as usize);
                return Ok(entries);
            }
            capacity = total;
        }
    }

    pub fn device_snapshot(&self) -> Result<Vec<DbgDeviceInfoEntry>, DebugError> {
        let entry_size = std::mem::size_of::<DbgDeviceInfoEntry>() as u32;
        let mut capacity = 0u32;
        loop {
            let mut entries = vec![DbgDeviceInfoEntry::default(); capacity as usize];
            let buf = entries.as_mut_ptr() as u64;
            let (args, _) = self.trap(DbgTrapOp::GetDeviceSnapshot, |args| {
                args.data.device_snapshot = DbgTrapDeviceSnapshotArgs {
                    exception_mask: 0,
                    snapshot_buf_ptr: buf,
                    num_devices: capacity,
                    entry_size,
                };
            })?;
            // SAFETY: the union member matches the op.
            let total = unsafe { args.data.device_snapshot.num_devices };
            if total <= capacity {
                entries.truncate(total as usize);
                return Ok(entries);
            }
            capacity = total;
        }
    }

    pub fn set_wave_launch_override(
        &self,
        mode: WaveLaunchOverrideMode,
        enable_mask: u32,
        support_request_mask: u32,
    ) -> Result<LaunchOverride, DebugError> {
        let (args, _) = self.trap(DbgTrapOp::SetWaveLaunchOverride, |args| {
            args.data.launch_override = DbgTrapSetWaveLaunchOverrideArgs {
                override_mode: mode as u32,
                enable_mask,
                support_request_mask,
                pad: 0,
            };
        })?;
        // SAFETY: the union member matches the op.
        let out = unsafe { args.data.launch_override };
        Ok(LaunchOverride {
            previous_mask: out.enable_mask,
            supported_mask: out.support_request_mask,
        })
    }

    pub fn set_wave_launch_mode(&self, mode: WaveLaunchMode) -> Result<(), DebugError> {
        self.trap(DbgTrapOp::SetWaveLaunchMode, |args| {
            args.data.launch_mode = DbgTrapSetWaveLaunchModeArgs {
                launch_mode: mode as u32,
                pad: 0,
            };
        })?;
        Ok(())
    }

    pub fn set_address_watch(
        &self,
        gpu_id: u32,
        address: u64,
        mask: u32,
        mode: WatchMode,
    ) -> Result<WatchPoint, DebugError> {
        let (args, _) = self.trap(DbgTrapOp::SetNodeAddressWatch, |args| {
            args.data.set_node_address_watch = DbgTrapSetNodeAddressWatchArgs {
                address,
                mode: mode as u32,
                mask,
                gpu_id,
                id: 0,
            };
        })?;
        // SAFETY: the union member matches the op.
        let id = unsafe { args.data.set_node_address_watch.id };
        tracing::debug!(pid = self.pid, gpu_id, id, address, "address watch set");
        Ok(WatchPoint { gpu_id, id })
    }

    pub fn clear_address_watch(&self, watch: WatchPoint) -> Result<(), DebugError> {
        self.trap(DbgTrapOp::ClearNodeAddressWatch, |args| {
            args.data.clear_node_address_watch = DbgTrapClearNodeAddressWatchArgs {
                gpu_id: watch.gpu_id,
                id: watch.id,
            };
        })?;
        Ok(())
    }

    /// Sets the trap flags and returns the ones previously set.
    pub fn set_flags(&self, flags: DebugFlags) -> Result<DebugFlags, DebugError> {
        let (args, _) = self.trap(DbgTrapOp::SetFlags, |args| {
            args.data.set_flags = DbgTrapSetFlagsArgs {
                flags: flags.bits(),
                pad: 0,
            };
        })?;
        // SAFETY: the union member matches the op.
        let previous = unsafe { args.data.set_flags.flags };
        Ok(DebugFlags::from_bits_retain(previous))
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        let mut args = DbgTrapArgs::new(self.pid, DbgTrapOp::Disable);
        match self.driver.dbg_trap(&mut args) {
            Ok(_) => tracing::debug!(pid = self.pid, "debug trap disabled"),
            Err(err) => {
                tracing::warn!(pid = self.pid, error = %err, "failed to disable debug trap")
            }
        }
    }
}

impl core::fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DebugSession")
            .field("pid", &self.pid)
            .field("runtime_info", &self.runtime_info)
            .finish_non_exhaustive()
    }
}
