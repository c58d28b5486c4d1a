//! AQL packet slot format.
//!
//! Every slot is 64 bytes. The low 16 bits of dword 0 are the header; the high 16 bits are the
//! packet-specific setup field. The header is the only field a consumer polls: a slot is owned by
//! the producer while its type is [`PacketType::Invalid`] and by the consumer otherwise.

pub const PACKET_SIZE: usize = 64;
pub const PACKET_DWORDS: usize = PACKET_SIZE / 4;

pub mod header_bits {
    //! Bit positions inside [`super::PacketHeader`].

    pub const TYPE_MASK: u16 = 0x00FF;
    pub const BARRIER: u16 = 1 << 8;
    pub const ACQUIRE_FENCE_SHIFT: u16 = 9;
    pub const RELEASE_FENCE_SHIFT: u16 = 11;
    pub const FENCE_SCOPE_MASK: u16 = 0x3;
}

/// Vendor format byte of a PM4 indirect-buffer packet.
pub const AMD_AQL_FORMAT_PM4_IB: u8 = 0x1;
/// Vendor format byte of an intercept marker. Markers never reach hardware.
pub const AMD_AQL_FORMAT_INTERCEPT_MARKER: u8 = 0xFE;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    VendorSpecific = 0,
    Invalid = 1,
    KernelDispatch = 2,
    BarrierAnd = 3,
    AgentDispatch = 4,
    BarrierOr = 5,
}

impl PacketType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::VendorSpecific,
            1 => Self::Invalid,
            2 => Self::KernelDispatch,
            3 => Self::BarrierAnd,
            4 => Self::AgentDispatch,
            5 => Self::BarrierOr,
            _ => return None,
        })
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FenceScope {
    None = 0,
    Agent = 1,
    System = 2,
}

impl FenceScope {
    fn from_bits(bits: u16) -> Self {
        match bits & header_bits::FENCE_SCOPE_MASK {
            0 => Self::None,
            1 => Self::Agent,
            // 3 is reserved; hardware treats it as system scope.
            _ => Self::System,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHeader(pub u16);

impl PacketHeader {
    pub const INVALID: Self = Self(PacketType::Invalid as u16);

    pub fn new(ty: PacketType, barrier: bool, acquire: FenceScope, release: FenceScope) -> Self {
        let mut raw = ty as u16;
        if barrier {
            raw |= header_bits::BARRIER;
        }
        raw |= (acquire as u16) << header_bits::ACQUIRE_FENCE_SHIFT;
        raw |= (release as u16) << header_bits::RELEASE_FENCE_SHIFT;
        Self(raw)
    }

    pub fn raw_type(self) -> u8 {
        (self.0 & header_bits::TYPE_MASK) as u8
    }

    pub fn packet_type(self) -> Option<PacketType> {
        PacketType::from_raw(self.raw_type())
    }

    pub fn is_valid(self) -> bool {
        self.raw_type() != PacketType::Invalid as u8
    }

    pub fn barrier(self) -> bool {
        self.0 & header_bits::BARRIER != 0
    }

    pub fn acquire_scope(self) -> FenceScope {
        FenceScope::from_bits(self.0 >> header_bits::ACQUIRE_FENCE_SHIFT)
    }

    pub fn release_scope(self) -> FenceScope {
        FenceScope::from_bits(self.0 >> header_bits::RELEASE_FENCE_SHIFT)
    }

    pub fn with_release_scope(self, scope: FenceScope) -> Self {
        let mask = header_bits::FENCE_SCOPE_MASK << header_bits::RELEASE_FENCE_SHIFT;
        Self((self.0 & !mask) | ((scope as u16) << header_bits::RELEASE_FENCE_SHIFT))
    }
}

impl core::fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketHeader")
            .field("type", &self.packet_type())
            .field("barrier", &self.barrier())
            .field("acquire", &self.acquire_scope())
            .field("release", &self.release_scope())
            .finish()
    }
}

/// One ring slot, viewed as raw dwords.
#[repr(C, align(64))]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AqlPacket {
    pub dwords: [u32; PACKET_DWORDS],
}

impl Default for AqlPacket {
    fn default() -> Self {
        Self::invalid()
    }
}

impl AqlPacket {
    pub const fn zeroed() -> Self {
        Self {
            dwords: [0; PACKET_DWORDS],
        }
    }

    pub const fn invalid() -> Self {
        let mut dwords = [0; PACKET_DWORDS];
        dwords[0] = PacketType::Invalid as u32;
        Self { dwords }
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader(self.dwords[0] as u16)
    }

    pub fn setup(&self) -> u16 {
        (self.dwords[0] >> 16) as u16
    }

    pub fn set_header(&mut self, header: PacketHeader) {
        self.dwords[0] = (self.dwords[0] & 0xFFFF_0000) | header.0 as u32;
    }

    pub fn set_setup(&mut self, setup: u16) {
        self.dwords[0] = (self.dwords[0] & 0x0000_FFFF) | (setup as u32) << 16;
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        self.header().packet_type()
    }

    /// Vendor format byte for vendor-specific packets.
    pub fn vendor_format(&self) -> Option<u8> {
        match self.packet_type() {
            Some(PacketType::VendorSpecific) => Some(self.setup() as u8),
            _ => None,
        }
    }

    pub fn is_intercept_marker(&self) -> bool {
        self.vendor_format() == Some(AMD_AQL_FORMAT_INTERCEPT_MARKER)
    }

    /// Completion signal handle; the same dwords for dispatch, barrier and PM4 packets.
    pub fn completion_signal(&self) -> u64 {
        self.u64_at(14)
    }

    pub fn set_completion_signal(&mut self, handle: u64) {
        self.set_u64(14, handle);
    }

    pub fn u64_at(&self, dword: usize) -> u64 {
        self.dwords[dword] as u64 | (self.dwords[dword + 1] as u64) << 32
    }

    pub fn set_u64(&mut self, dword: usize, value: u64) {
        self.dwords[dword] = value as u32;
        self.dwords[dword + 1] = (value >> 32) as u32;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelDispatchPacket {
    pub header: PacketHeader,
    pub dimensions: u16,
    pub workgroup_size: [u16; 3],
    pub grid_size: [u32; 3],
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernel_object: u64,
    pub kernarg_address: u64,
    pub completion_signal: u64,
}

impl KernelDispatchPacket {
    pub fn to_packet(&self) -> AqlPacket {
        let mut p = AqlPacket::zeroed();
        p.set_header(self.header);
        p.set_setup(self.dimensions);
        p.dwords[1] = self.workgroup_size[0] as u32 | (self.workgroup_size[1] as u32) << 16;
        p.dwords[2] = self.workgroup_size[2] as u32;
        p.dwords[3..6].copy_from_slice(&self.grid_size);
        p.dwords[6] = self.private_segment_size;
        p.dwords[7] = self.group_segment_size;
        p.set_u64(8, self.kernel_object);
        p.set_u64(10, self.kernarg_address);
        p.set_completion_signal(self.completion_signal);
        p
    }

    pub fn from_packet(p: &AqlPacket) -> Option<Self> {
        if p.packet_type() != Some(PacketType::KernelDispatch) {
            return None;
        }
        Some(Self {
            header: p.header(),
            dimensions: p.setup(),
            workgroup_size: [
                p.dwords[1] as u16,
                (p.dwords[1] >> 16) as u16,
                p.dwords[2] as u16,
            ],
            grid_size: [p.dwords[3], p.dwords[4], p.dwords[5]],
            private_segment_size: p.dwords[6],
            group_segment_size: p.dwords[7],
            kernel_object: p.u64_at(8),
            kernarg_address: p.u64_at(10),
            completion_signal: p.completion_signal(),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BarrierAndPacket {
    pub barrier: bool,
    pub acquire: Option<FenceScope>,
    pub release: Option<FenceScope>,
    pub dep_signals: [u64; 5],
    pub completion_signal: u64,
}

impl BarrierAndPacket {
    pub fn header(&self) -> PacketHeader {
        PacketHeader::new(
            PacketType::BarrierAnd,
            self.barrier,
            self.acquire.unwrap_or(FenceScope::None),
            self.release.unwrap_or(FenceScope::None),
        )
    }

    pub fn to_packet(&self) -> AqlPacket {
        let mut p = AqlPacket::zeroed();
        p.set_header(self.header());
        for (i, dep) in self.dep_signals.iter().enumerate() {
            p.set_u64(2 + i * 2, *dep);
        }
        p.set_completion_signal(self.completion_signal);
        p
    }

    pub fn from_packet(p: &AqlPacket) -> Option<Self> {
        if p.packet_type() != Some(PacketType::BarrierAnd) {
            return None;
        }
        let header = p.header();
        let mut dep_signals = [0; 5];
        for (i, dep) in dep_signals.iter_mut().enumerate() {
            *dep = p.u64_at(2 + i * 2);
        }
        Some(Self {
            barrier: header.barrier(),
            acquire: Some(header.acquire_scope()),
            release: Some(header.release_scope()),
            dep_signals,
            completion_signal: p.completion_signal(),
        })
    }
}

/// Vendor packet asking the command processor to jump into an indirect buffer of PM4 commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pm4IbPacket {
    pub header: PacketHeader,
    pub ib_jump_cmd: [u32; 4],
    pub dw_cnt_remain: u32,
    pub completion_signal: u64,
}

impl Pm4IbPacket {
    /// Dwords of the PM4 stream the vendor packet occupies beyond the jump command.
    pub const DW_CNT_REMAIN: u32 = 0xA;

    pub fn to_packet(&self) -> AqlPacket {
        let mut p = AqlPacket::zeroed();
        p.set_header(self.header);
        p.set_setup(AMD_AQL_FORMAT_PM4_IB as u16);
        p.dwords[1..5].copy_from_slice(&self.ib_jump_cmd);
        p.dwords[5] = self.dw_cnt_remain;
        p.set_completion_signal(self.completion_signal);
        p
    }

    pub fn from_packet(p: &AqlPacket) -> Option<Self> {
        if p.vendor_format() != Some(AMD_AQL_FORMAT_PM4_IB) {
            return None;
        }
        let mut ib_jump_cmd = [0; 4];
        ib_jump_cmd.copy_from_slice(&p.dwords[1..5]);
        Some(Self {
            header: p.header(),
            ib_jump_cmd,
            dw_cnt_remain: p.dwords[5],
            completion_signal: p.completion_signal(),
        })
    }
}

/// Ordering marker observed by tooling at its exact submission position.
///
/// Markers are consumed by the intercept layer and never occupy a hardware slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterceptMarker {
    pub callback: u32,
    pub user_data: [u64; 2],
}

impl InterceptMarker {
    pub fn to_packet(&self) -> AqlPacket {
        let mut p = AqlPacket::zeroed();
        p.set_header(PacketHeader::new(
            PacketType::VendorSpecific,
            false,
            FenceScope::None,
            FenceScope::None,
        ));
        p.set_setup(AMD_AQL_FORMAT_INTERCEPT_MARKER as u16);
        p.set_u64(2, self.user_data[0]);
        p.set_u64(4, self.user_data[1]);
        p.dwords[6] = self.callback;
        p
    }

    pub fn from_packet(p: &AqlPacket) -> Option<Self> {
        if !p.is_intercept_marker() {
            return None;
        }
        Some(Self {
            callback: p.dwords[6],
            user_data: [p.u64_at(2), p.u64_at(4)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn packet_is_one_cache_line() {
        assert_eq!(core::mem::size_of::<AqlPacket>(), PACKET_SIZE);
        assert_eq!(core::mem::align_of::<AqlPacket>(), PACKET_SIZE);
    }

    #[test]
    fn header_bit_layout() {
        let h = PacketHeader::new(
            PacketType::KernelDispatch,
            true,
            FenceScope::System,
            FenceScope::Agent,
        );
        assert_eq!(h.0, 0x0002 | 0x0100 | (2 << 9) | (1 << 11));
        assert_eq!(h.acquire_scope(), FenceScope::System);
        assert_eq!(h.release_scope(), FenceScope::Agent);

        let h = h.with_release_scope(FenceScope::System);
        assert_eq!(h.release_scope(), FenceScope::System);
        assert!(h.barrier());
        assert_eq!(h.packet_type(), Some(PacketType::KernelDispatch));
    }

    #[test]
    fn invalid_header_is_type_one() {
        assert_eq!(AqlPacket::invalid().dwords[0], 1);
        assert!(!AqlPacket::invalid().header().is_valid());
        assert!(AqlPacket::zeroed().header().is_valid());
    }

    #[test]
    fn kernel_dispatch_field_placement() {
        let d = KernelDispatchPacket {
            header: PacketHeader::new(
                PacketType::KernelDispatch,
                false,
                FenceScope::System,
                FenceScope::System,
            ),
            dimensions: 3,
            workgroup_size: [64, 2, 1],
            grid_size: [1024, 4, 1],
            private_segment_size: 2048,
            group_segment_size: 512,
            kernel_object: 0x1122_3344_5566_7788,
            kernarg_address: 0xAABB_CCDD_0000_1000,
            completion_signal: 0x55,
        };
        let p = d.to_packet();
        assert_eq!(p.dwords[0] >> 16, 3);
        assert_eq!(p.dwords[1], 64 | 2 << 16);
        assert_eq!(p.dwords[2], 1);
        assert_eq!(&p.dwords[3..6], &[1024, 4, 1]);
        assert_eq!(p.dwords[6], 2048);
        assert_eq!(p.dwords[8], 0x5566_7788);
        assert_eq!(p.dwords[9], 0x1122_3344);
        assert_eq!(p.dwords[14], 0x55);
        assert_eq!(KernelDispatchPacket::from_packet(&p), Some(d));
        assert_eq!(BarrierAndPacket::from_packet(&p), None);
    }

    #[test]
    fn barrier_dependencies_start_at_dword_two() {
        let b = BarrierAndPacket {
            dep_signals: [7, 0, 0, 0, 9],
            completion_signal: 3,
            ..Default::default()
        };
        let p = b.to_packet();
        assert_eq!(p.packet_type(), Some(PacketType::BarrierAnd));
        assert_eq!(p.dwords[2], 7);
        assert_eq!(p.dwords[10], 9);
        assert_eq!(p.completion_signal(), 3);
    }

    #[test]
    fn vendor_formats_are_distinguished() {
        let marker = InterceptMarker {
            callback: 4,
            user_data: [1, 2],
        }
        .to_packet();
        assert!(marker.is_intercept_marker());
        assert_eq!(Pm4IbPacket::from_packet(&marker), None);
        assert_eq!(
            InterceptMarker::from_packet(&marker),
            Some(InterceptMarker {
                callback: 4,
                user_data: [1, 2]
            })
        );

        let ib = Pm4IbPacket {
            header: PacketHeader::new(
                PacketType::VendorSpecific,
                true,
                FenceScope::None,
                FenceScope::System,
            ),
            ib_jump_cmd: [0xC002_3F00, 0x1000, 0, 0x80_0004],
            dw_cnt_remain: Pm4IbPacket::DW_CNT_REMAIN,
            completion_signal: 8,
        }
        .to_packet();
        assert_eq!(ib.vendor_format(), Some(AMD_AQL_FORMAT_PM4_IB));
        assert!(!ib.is_intercept_marker());
    }
}
