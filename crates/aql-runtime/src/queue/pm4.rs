//! The few PM4 type-3 packets the runtime emits itself.

pub const IT_NOP: u32 = 0x10;
pub const IT_INDIRECT_BUFFER: u32 = 0x3F;
pub const IT_RELEASE_MEM: u32 = 0x49;

const RELEASE_MEM_EVENT_INDEX_AQL: u32 = 0x7;

/// Largest command stream `execute_pm4` accepts, in dwords.
pub const IB_CAPACITY_DWORDS: usize = 1024;

/// Type-3 header for a packet of `dwords` total dwords.
pub const fn header(opcode: u32, dwords: u32) -> u32 {
    (3 << 30) | (((dwords - 2) & 0x3FFF) << 16) | (opcode << 8)
}

/// Jump into the indirect buffer at `address` holding `dwords` commands.
pub fn indirect_buffer(address: u64, dwords: u32) -> [u32; 4] {
    [
        header(IT_INDIRECT_BUFFER, 4),
        ((address >> 2) as u32 & 0x3FFF_FFFF) << 2,
        (address >> 32) as u32 & 0xFFFF,
        (dwords & 0xF_FFFF) | (1 << 23),
    ]
}

/// End-of-packet event that lets the command processor retire an AQL slot carrying raw PM4.
pub fn release_mem() -> [u32; 7] {
    let mut cmd = [0; 7];
    cmd[0] = header(IT_RELEASE_MEM, 7);
    cmd[1] = (RELEASE_MEM_EVENT_INDEX_AQL & 0xF) << 8;
    cmd
}

/// A whole 16-dword ring slot for parts without the PM4 vendor packet: NOP padding, the jump,
/// then the release.
pub fn legacy_slot(ib_address: u64, ib_dwords: u32) -> [u32; 16] {
    const IB: usize = 4;
    const RELEASE: usize = 7;
    const PAD: usize = 16 - IB - RELEASE;

    let mut slot = [0; 16];
    slot[0] = header(IT_NOP, PAD as u32);
    slot[PAD..PAD + IB].copy_from_slice(&indirect_buffer(ib_address, ib_dwords));
    slot[PAD + IB..].copy_from_slice(&release_mem());
    slot
}
