//! Power-of-two ring of AQL packet slots.
//!
//! Indices handed to this type are the queue's monotonically increasing 64-bit read/write
//! indices; the slot is `index & (size - 1)`. On hardware with the queue-full erratum the ring is
//! double-mapped: one backing object is mapped twice at adjacent virtual addresses so the consumer
//! may address slot `i` at either `i` or `i + size`.

use crate::packet::{AqlPacket, PacketHeader, PACKET_DWORDS, PACKET_SIZE};
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("queue size {0} is not a power of two")]
    NotPowerOfTwo(u32),
    #[error("ring of {bytes} bytes is not a multiple of the {page} byte page size")]
    Misaligned { bytes: usize, page: usize },
    #[error("failed to {op} ring memory")]
    Map {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("double-mapped rings are not supported on this platform")]
    DoubleMapUnsupported,
}

/// Hardware bounds on the ring size, in packets. Both bounds are powers of two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingLimits {
    pub min_packets: u32,
    pub max_packets: u32,
}

impl RingLimits {
    pub const fn new(min_packets: u32, max_packets: u32) -> Self {
        Self {
            min_packets,
            max_packets,
        }
    }

    pub fn clamp(self, packets: u32) -> u32 {
        packets.clamp(self.min_packets, self.max_packets)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MappingStats {
    pub live_mappings: usize,
    pub live_bytes: usize,
}

static LIVE_MAPPINGS: AtomicUsize = AtomicUsize::new(0);
static LIVE_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Process-wide count of ring mappings that have not been unmapped yet.
pub fn mapping_stats() -> MappingStats {
    MappingStats {
        live_mappings: LIVE_MAPPINGS.load(Ordering::Acquire),
        live_bytes: LIVE_BYTES.load(Ordering::Acquire),
    }
}

/// Granule a double-mapped ring must be a multiple of.
pub fn page_size() -> usize {
    platform::page_size()
}

mod platform {
    //! The two ways of backing a ring: one anonymous mapping, or one shared object mapped twice.

    use super::{RingError, LIVE_BYTES, LIVE_MAPPINGS};
    use std::io;
    use std::ptr::NonNull;
    use std::sync::atomic::Ordering;

    /// An owned virtual range, unmapped on drop.
    pub(super) struct Mapping {
        pub(super) ptr: NonNull<u8>,
        pub(super) len: usize,
    }

    impl Mapping {
        fn adopt(ptr: *mut libc::c_void, len: usize, op: &'static str) -> Result<Self, RingError> {
            if ptr == libc::MAP_FAILED {
                return Err(RingError::Map {
                    op,
                    source: io::Error::last_os_error(),
                });
            }
            let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(RingError::Map {
                op,
                source: io::Error::from(io::ErrorKind::OutOfMemory),
            })?;
            LIVE_MAPPINGS.fetch_add(1, Ordering::AcqRel);
            LIVE_BYTES.fetch_add(len, Ordering::AcqRel);
            Ok(Self { ptr, len })
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            // SAFETY: `ptr..ptr+len` was mapped by `adopt` and nothing else unmaps it.
            let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
            if rc != 0 {
                tracing::warn!(
                    len = self.len,
                    error = %io::Error::last_os_error(),
                    "munmap of ring memory failed"
                );
            }
            LIVE_MAPPINGS.fetch_sub(1, Ordering::AcqRel);
            LIVE_BYTES.fetch_sub(self.len, Ordering::AcqRel);
        }
    }

    pub(super) fn page_size() -> usize {
        // SAFETY: sysconf has no memory-safety preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page <= 0 {
            4096
        } else {
            page as usize
        }
    }

    pub(super) fn map_single(bytes: usize) -> Result<Mapping, RingError> {
        // SAFETY: fresh anonymous mapping, no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        Mapping::adopt(ptr, bytes, "map")
    }

    #[cfg(target_os = "linux")]
    pub(super) fn map_double(bytes: usize) -> Result<Mapping, RingError> {
        use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

        let name = b"aql-ring\0";
        // SAFETY: `name` is NUL-terminated.
        let fd = unsafe { libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(RingError::Map {
                op: "create backing object for",
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: `fd` was just returned by memfd_create and is owned by nobody else.
        let backing = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: plain syscall on an fd we own.
        if unsafe { libc::ftruncate(backing.as_raw_fd(), bytes as libc::off_t) } != 0 {
            return Err(RingError::Map {
                op: "size",
                source: io::Error::last_os_error(),
            });
        }

        // Reserve both halves first so the second view is guaranteed to be adjacent.
        // SAFETY: fresh PROT_NONE reservation, no address hint.
        let reserve = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes * 2,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        let reservation = Mapping::adopt(reserve, bytes * 2, "reserve")?;

        for half in 0..2 {
            // SAFETY: the target lies inside `reservation`, which we own; MAP_FIXED replaces our
            // own PROT_NONE pages only.
            let view = unsafe {
                libc::mmap(
                    reservation.ptr.as_ptr().add(half * bytes).cast(),
                    bytes,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    backing.as_raw_fd(),
                    0,
                )
            };
            if view == libc::MAP_FAILED {
                return Err(RingError::Map {
                    op: "alias",
                    source: io::Error::last_os_error(),
                });
            }
        }

        // The views keep the backing object alive; the fd can go.
        drop(backing);
        Ok(reservation)
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn map_double(_bytes: usize) -> Result<Mapping, RingError> {
        Err(RingError::DoubleMapUnsupported)
    }
}

pub struct RingBuffer {
    base: NonNull<AqlPacket>,
    size: u32,
    double_mapped: bool,
    _mapping: platform::Mapping,
}

// SAFETY: the ring is plain memory; all cross-thread hand-off goes through the atomic header word.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Maps a ring of `requested` packets, clamped into `limits`.
    ///
    /// Every header is set to INVALID. The rest of each slot is left as the OS provided it.
    pub fn allocate(requested: u32, limits: RingLimits, double_map: bool) -> Result<Self, RingError> {
        if !requested.is_power_of_two() {
            return Err(RingError::NotPowerOfTwo(requested));
        }
        debug_assert!(limits.min_packets.is_power_of_two() && limits.max_packets.is_power_of_two());
        let size = limits.clamp(requested);
        let bytes = size as usize * PACKET_SIZE;

        let mapping = if double_map {
            let page = platform::page_size();
            if bytes % page != 0 {
                return Err(RingError::Misaligned { bytes, page });
            }
            platform::map_double(bytes)?
        } else {
            platform::map_single(bytes)?
        };

        let ring = Self {
            base: mapping.ptr.cast(),
            size,
            double_mapped: double_map,
            _mapping: mapping,
        };
        for index in 0..size as u64 {
            ring.invalidate(index);
        }

        tracing::debug!(size, double_map, base = ring.base_address(), "allocated AQL ring");
        Ok(ring)
    }

    /// Slots in the ring.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn mask(&self) -> u64 {
        self.size as u64 - 1
    }

    pub fn is_double_mapped(&self) -> bool {
        self.double_mapped
    }

    pub fn base_address(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    /// Bytes of virtual address space the ring occupies, counting the alias.
    pub fn mapped_bytes(&self) -> usize {
        self.size as usize * PACKET_SIZE * if self.double_mapped { 2 } else { 1 }
    }

    pub fn slot_ptr(&self, index: u64) -> *mut AqlPacket {
        // SAFETY: masked index is within the first `size` slots.
        unsafe { self.base.as_ptr().add((index & self.mask()) as usize) }
    }

    /// Pointer to the slot through the upper alias. Only meaningful on double-mapped rings.
    pub fn alias_slot_ptr(&self, index: u64) -> Option<*mut AqlPacket> {
        if !self.double_mapped {
            return None;
        }
        let wrapped = index & (self.size as u64 * 2 - 1);
        // SAFETY: double-mapped rings span `2 * size` slots.
        Some(unsafe { self.base.as_ptr().add(wrapped as usize) })
    }

    /// Dword 0 of a slot: header plus setup.
    pub fn header_word(&self, index: u64) -> &AtomicU32 {
        // SAFETY: the slot is live for `&self` and 64-byte aligned; dword 0 is only ever accessed
        // through this atomic.
        unsafe { &*(self.slot_ptr(index) as *const AtomicU32) }
    }

    pub fn load_header(&self, index: u64, order: Ordering) -> PacketHeader {
        PacketHeader(self.header_word(index).load(order) as u16)
    }

    /// Writes dwords 1..16, then release-stores dword 0.
    ///
    /// The caller must own the slot (header INVALID, index reserved).
    pub fn publish(&self, index: u64, packet: &AqlPacket) {
        self.write_body(index, packet);
        self.header_word(index)
            .store(packet.dwords[0], Ordering::Release);
    }

    /// Writes every dword except dword 0.
    pub fn write_body(&self, index: u64, packet: &AqlPacket) {
        let dst = self.slot_ptr(index).cast::<u32>();
        for dw in 1..PACKET_DWORDS {
            // SAFETY: in bounds of one slot; the caller owns the slot body.
            unsafe { core::ptr::write_volatile(dst.add(dw), packet.dwords[dw]) };
        }
    }

    /// Reads a whole slot. Only meaningful after an acquire load observed a valid header.
    pub fn read_packet(&self, index: u64) -> AqlPacket {
        let mut out = AqlPacket::zeroed();
        out.dwords[0] = self.header_word(index).load(Ordering::Acquire);
        let src = self.slot_ptr(index).cast::<u32>();
        for dw in 1..PACKET_DWORDS {
            // SAFETY: in bounds of one slot.
            out.dwords[dw] = unsafe { core::ptr::read_volatile(src.add(dw)) };
        }
        out
    }

    /// Returns the slot to producers.
    pub fn invalidate(&self, index: u64) {
        self.header_word(index)
            .store(PacketHeader::INVALID.0 as u32, Ordering::Release);
    }
}

impl core::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("base", &format_args!("{:#x}", self.base_address()))
            .field("size", &self.size)
            .field("double_mapped", &self.double_mapped)
            .finish()
    }
}
