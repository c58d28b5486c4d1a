//! Wire format of an IPC handle.
//!
//! Layout (eight little-endian `u32` words):
//! - magic
//! - exporting pid
//! - block serial, low then high
//! - block length in bytes, low then high
//! - fragment word: [`FRAGMENT_FLAG`] | page offset, or 0 for the whole block
//! - reserved, always 0
//!
//! The fragment word is part of the cross-process contract; its packing must not change.

use crate::IpcError;
use std::ffi::CString;

pub const HANDLE_WORDS: usize = 8;
pub const HANDLE_BYTES: usize = HANDLE_WORDS * 4;

/// `b"AQLI"` as a little-endian `u32`.
pub const HANDLE_MAGIC: u32 = 0x494C_5141;

/// Set in the fragment word when the handle names a range inside a larger block.
pub const FRAGMENT_FLAG: u32 = 0x8000_0000;
pub const MAX_FRAGMENT_PAGES: u32 = FRAGMENT_FLAG - 1;

pub mod word {
    pub const MAGIC: usize = 0;
    pub const PID: usize = 1;
    pub const SERIAL_LO: usize = 2;
    pub const SERIAL_HI: usize = 3;
    pub const LEN_LO: usize = 4;
    pub const LEN_HI: usize = 5;
    pub const FRAGMENT: usize = 6;
    pub const RESERVED: usize = 7;
}

/// Identifies one exported block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShareToken {
    pub pid: u32,
    pub serial: u64,
    pub len: u64,
}

impl ShareToken {
    /// Name of the POSIX shared-memory object backing the block.
    pub fn object_name(&self) -> CString {
        // Digits and dots only, so there is never an interior NUL.
        CString::new(format!("/aql-ipc.{}.{}", self.pid, self.serial)).unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct IpcHandle(pub [u32; HANDLE_WORDS]);

impl IpcHandle {
    pub fn new(token: ShareToken) -> Self {
        let mut words = [0u32; HANDLE_WORDS];
        words[word::MAGIC] = HANDLE_MAGIC;
        words[word::PID] = token.pid;
        words[word::SERIAL_LO] = token.serial as u32;
        words[word::SERIAL_HI] = (token.serial >> 32) as u32;
        words[word::LEN_LO] = token.len as u32;
        words[word::LEN_HI] = (token.len >> 32) as u32;
        Self(words)
    }

    pub fn token(&self) -> Result<ShareToken, IpcError> {
        let w = &self.0;
        if w[word::MAGIC] != HANDLE_MAGIC {
            return Err(IpcError::InvalidHandle(w[word::MAGIC]));
        }
        Ok(ShareToken {
            pid: w[word::PID],
            serial: w[word::SERIAL_LO] as u64 | (w[word::SERIAL_HI] as u64) << 32,
            len: w[word::LEN_LO] as u64 | (w[word::LEN_HI] as u64) << 32,
        })
    }

    /// Marks the handle as naming the range `pages` pages into the block.
    pub fn with_fragment(mut self, pages: u64) -> Result<Self, IpcError> {
        if pages > MAX_FRAGMENT_PAGES as u64 {
            return Err(IpcError::FragmentTooFar(pages));
        }
        self.0[word::FRAGMENT] = FRAGMENT_FLAG | pages as u32;
        Ok(self)
    }

    /// Page offset into the block, if this is a fragment handle.
    pub fn fragment_pages(&self) -> Option<u32> {
        let w = self.0[word::FRAGMENT];
        (w & FRAGMENT_FLAG != 0).then_some(w & MAX_FRAGMENT_PAGES)
    }

    /// The handle of the enclosing block.
    pub fn whole(mut self) -> Self {
        self.0[word::FRAGMENT] = 0;
        self
    }

    pub fn to_bytes(&self) -> [u8; HANDLE_BYTES] {
        let mut out = [0u8; HANDLE_BYTES];
        for (chunk, w) in out.chunks_exact_mut(4).zip(self.0) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: [u8; HANDLE_BYTES]) -> Self {
        let mut words = [0u32; HANDLE_WORDS];
        for (w, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TOKEN: ShareToken = ShareToken {
        pid: 4242,
        serial: 0x1_0000_0007,
        len: 0x2_0000_1000,
    };

    #[test]
    fn words_land_where_the_format_says() {
        let handle = IpcHandle::new(TOKEN).with_fragment(3).unwrap();
        assert_eq!(
            handle.0,
            [HANDLE_MAGIC, 4242, 7, 1, 0x1000, 2, 0x8000_0003, 0]
        );
        assert_eq!(&handle.to_bytes()[..4], b"AQLI");
        assert_eq!(handle.token().unwrap(), TOKEN);
        assert_eq!(handle.fragment_pages(), Some(3));
        assert_eq!(handle.whole(), IpcHandle::new(TOKEN));
    }

    #[test]
    fn whole_block_handles_carry_no_fragment() {
        let handle = IpcHandle::new(TOKEN);
        assert_eq!(handle.fragment_pages(), None);
        // Offset zero is still a fragment when flagged.
        assert_eq!(handle.with_fragment(0).unwrap().fragment_pages(), Some(0));
    }

    #[test]
    fn foreign_bytes_are_rejected() {
        let handle = IpcHandle::from_bytes([0xAB; HANDLE_BYTES]);
        assert!(matches!(handle.token(), Err(IpcError::InvalidHandle(0xABAB_ABAB))));
    }

    #[test]
    fn fragment_offset_is_bounded() {
        let handle = IpcHandle::new(TOKEN);
        assert!(handle.with_fragment(MAX_FRAGMENT_PAGES as u64).is_ok());
        assert!(matches!(
            handle.with_fragment(FRAGMENT_FLAG as u64),
            Err(IpcError::FragmentTooFar(_))
        ));
    }

    #[test]
    fn object_names_are_per_pid_and_serial() {
        assert_eq!(
            TOKEN.object_name().to_str().unwrap(),
            "/aql-ipc.4242.4294967303"
        );
    }
}
