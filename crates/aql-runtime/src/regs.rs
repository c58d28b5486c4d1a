//! Scratch buffer resource descriptor and `COMPUTE_TMPRING_SIZE` encodings.
//!
//! Field layouts follow the shader register references for each family. Every field is packed
//! explicitly so the bit positions are visible at the use site.

use crate::agent::IsaGeneration;
use crate::scratch::ScratchInfo;

const SQ_SEL_X: u32 = 4;
const SQ_SEL_Y: u32 = 5;
const SQ_SEL_Z: u32 = 6;
const SQ_SEL_W: u32 = 7;

const BUF_NUM_FORMAT_UINT: u32 = 4;
const BUF_DATA_FORMAT_32: u32 = 4;
const BUF_FORMAT_32_UINT: u32 = 20;

/// Index stride of 64 lanes.
const INDEX_STRIDE_64: u32 = 3;
/// Raw buffer bounds checking.
const OOB_SELECT_RAW: u32 = 2;

#[inline]
fn field(value: u32, shift: u32, width: u32) -> u32 {
    debug_assert!(width == 32 || value < (1 << width), "field overflow");
    (value & (u32::MAX >> (32 - width))) << shift
}

fn dst_sel() -> u32 {
    field(SQ_SEL_X, 0, 3) | field(SQ_SEL_Y, 3, 3) | field(SQ_SEL_Z, 6, 3) | field(SQ_SEL_W, 9, 3)
}

/// Four-dword buffer descriptor covering the queue's scratch.
pub fn scratch_srd(generation: IsaGeneration, full_profile: bool, scratch: &ScratchInfo) -> [u32; 4] {
    let base = scratch.base.unwrap_or(0);
    let word0 = base as u32;
    let base_hi = field((base >> 32) as u32 & 0xFFFF, 0, 16);
    // STRIDE and CACHE_SWIZZLE stay zero.
    let word2 = scratch.size.min(u32::MAX as u64) as u32;

    match generation {
        IsaGeneration::Gfx9 => {
            let word1 = base_hi | field(1, 31, 1);
            let word3 = dst_sel()
                | field(BUF_NUM_FORMAT_UINT, 12, 3)
                | field(BUF_DATA_FORMAT_32, 15, 4)
                | field(1, 19, 2) // ELEMENT_SIZE: 4 bytes
                | field(INDEX_STRIDE_64, 21, 2)
                | field(1, 23, 1) // ADD_TID_ENABLE
                | field(full_profile as u32, 24, 1); // ATC
            [word0, word1, word2, word3]
        }
        IsaGeneration::Gfx10 => {
            let word1 = base_hi | field(1, 31, 1);
            let word3 = dst_sel()
                | field(BUF_FORMAT_32_UINT, 12, 7)
                | field(INDEX_STRIDE_64, 21, 2)
                | field(1, 23, 1)
                | field(1, 24, 1) // RESOURCE_LEVEL
                | field(OOB_SELECT_RAW, 28, 2);
            [word0, word1, word2, word3]
        }
        IsaGeneration::Gfx11 => {
            // Two-bit swizzle: 16-byte elements.
            let word1 = base_hi | field(3, 30, 2);
            let word3 = dst_sel()
                | field(BUF_FORMAT_32_UINT, 12, 6)
                | field(INDEX_STRIDE_64, 21, 2)
                | field(1, 23, 1)
                | field(OOB_SELECT_RAW, 28, 2);
            [word0, word1, word2, word3]
        }
    }
}

/// Bytes per `WAVESIZE` unit.
pub fn wave_granule(generation: IsaGeneration) -> u64 {
    match generation {
        IsaGeneration::Gfx11 => 256,
        _ => 1024,
    }
}

/// `COMPUTE_TMPRING_SIZE`: per-wave scratch size and how many waves fit.
pub fn tmpring_size(generation: IsaGeneration, scratch: &ScratchInfo, max_scratch_waves: u64) -> u32 {
    if !scratch.is_allocated() {
        return 0;
    }
    let granule = wave_granule(generation);
    let wave_size = (scratch.lanes_per_wave as u64 * scratch.size_per_thread).div_ceil(granule);
    let waves = if wave_size == 0 {
        0
    } else {
        (scratch.size / (wave_size * granule)).min(max_scratch_waves)
    };
    let wavesize_width = match generation {
        IsaGeneration::Gfx11 => 15,
        _ => 13,
    };
    debug_assert!(wave_size < 1 << wavesize_width, "WAVESIZE overflow");
    field(waves.min(0xFFF) as u32, 0, 12) | field(wave_size as u32, 12, wavesize_width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn held(base: u64, size: u64, spt: u64, lanes: u32) -> ScratchInfo {
        ScratchInfo {
            base: Some(base),
            size,
            size_per_thread: spt,
            lanes_per_wave: lanes,
            ..Default::default()
        }
    }

    #[test]
    fn gfx9_descriptor() {
        let s = held(0x1234_5678_9000, 0x40_0000, 2048, 64);
        let srd = scratch_srd(IsaGeneration::Gfx9, false, &s);
        assert_eq!(srd[0], 0x5678_9000);
        assert_eq!(srd[1], 0x8000_1234);
        assert_eq!(srd[2], 0x40_0000);
        // dst_sel 0xFAC, num fmt 4<<12, data fmt 4<<15, elem 1<<19, stride 3<<21, tid 1<<23
        assert_eq!(srd[3], 0xFAC | 0x4000 | 0x2_0000 | 0x8_0000 | 0x60_0000 | 0x80_0000);
    }

    #[test]
    fn gfx10_and_gfx11_descriptors() {
        let s = held(0x1_0000_0000, 0x1000, 16, 64);
        let g10 = scratch_srd(IsaGeneration::Gfx10, false, &s);
        assert_eq!(g10[1], 0x8000_0001);
        assert_eq!(g10[3], 0xFAC | (20 << 12) | 0x60_0000 | 0x80_0000 | 0x100_0000 | 0x2000_0000);

        let g11 = scratch_srd(IsaGeneration::Gfx11, false, &s);
        assert_eq!(g11[1], 0xC000_0001);
        assert_eq!(g11[3], 0xFAC | (20 << 12) | 0x60_0000 | 0x80_0000 | 0x2000_0000);
    }

    #[test]
    fn tmpring_waves_and_size() {
        // 2048 bytes/lane * 64 lanes = 128 KiB per wave = 128 units of 1 KiB.
        let s = held(0, 128 * 1024 * 10, 2048, 64);
        let reg = tmpring_size(IsaGeneration::Gfx9, &s, 1000);
        assert_eq!(reg & 0xFFF, 10);
        assert_eq!(reg >> 12, 128);

        let capped = tmpring_size(IsaGeneration::Gfx9, &s, 4);
        assert_eq!(capped & 0xFFF, 4);

        let g11 = tmpring_size(IsaGeneration::Gfx11, &s, 1000);
        assert_eq!(g11 >> 12, 512);
        assert_eq!(tmpring_size(IsaGeneration::Gfx9, &ScratchInfo::default(), 8), 0);
    }
}
