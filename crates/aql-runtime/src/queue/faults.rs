//! Decoding of the two ways a queue reports trouble: error codes the packet processor stores
//! in the inactive signal, and exception masks the driver stores in the exception signal.

use crate::error::QueueFault;
use aql_kfd::ioctl::ec;

/// The dispatch needs more scratch than the queue holds.
pub const ERROR_INSUFFICIENT_SCRATCH: u64 = 1 << 0;
pub const ERROR_INCOMPATIBLE_ARGUMENTS: u64 = 1 << 1;
pub const ERROR_INVALID_ALLOCATION: u64 = 1 << 2;
pub const ERROR_INVALID_CODE_OBJECT: u64 = 1 << 3;
pub const ERROR_INVALID_PACKET_FORMAT: u64 = 1 << 5;
pub const ERROR_INVALID_ARGUMENT: u64 = 1 << 6;
pub const ERROR_INVALID_ISA: u64 = 1 << 7;
pub const ERROR_UNSUPPORTED_PACKET: u64 = 1 << 8;
/// Exact value: the single-use scratch of the last dispatch can be returned.
pub const ERROR_LARGE_SCRATCH_RECLAIM: u64 = 512;
/// Accompanies [`ERROR_INSUFFICIENT_SCRATCH`] for wave32 dispatches.
pub const ERROR_WAVE32: u64 = 0x400;
pub const ERROR_MEMORY_APERTURE_VIOLATION: u64 = 0x2000_0000;
pub const ERROR_ILLEGAL_INSTRUCTION: u64 = 0x4000_0000;
pub const ERROR_EXCEPTION: u64 = 0x8000_0000;

/// What the inactive signal is asking the runtime to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InactiveCode {
    InsufficientScratch { wave32: bool },
    ReclaimScratch,
    Fatal(QueueFault),
}

pub fn classify_error_code(code: u64) -> InactiveCode {
    if code & ERROR_INSUFFICIENT_SCRATCH != 0 {
        return InactiveCode::InsufficientScratch {
            wave32: code & ERROR_WAVE32 != 0,
        };
    }
    if code == ERROR_LARGE_SCRATCH_RECLAIM {
        return InactiveCode::ReclaimScratch;
    }
    let fault = if code & ERROR_INCOMPATIBLE_ARGUMENTS != 0 {
        QueueFault::IncompatibleArguments
    } else if code & ERROR_INVALID_ALLOCATION != 0 {
        QueueFault::InvalidAllocation
    } else if code & ERROR_INVALID_CODE_OBJECT != 0 {
        QueueFault::InvalidCodeObject
    } else if code & (ERROR_INVALID_PACKET_FORMAT | ERROR_UNSUPPORTED_PACKET) != 0 {
        QueueFault::InvalidPacketFormat
    } else if code & ERROR_INVALID_ARGUMENT != 0 {
        QueueFault::InvalidArgument
    } else if code & ERROR_INVALID_ISA != 0 {
        QueueFault::InvalidIsa
    } else if code & ERROR_MEMORY_APERTURE_VIOLATION != 0 {
        QueueFault::MemoryApertureViolation
    } else if code & ERROR_ILLEGAL_INSTRUCTION != 0 {
        QueueFault::IllegalInstruction
    } else if code & ERROR_EXCEPTION != 0 {
        QueueFault::Exception
    } else {
        debug_assert!(false, "unknown queue error code {code:#x}");
        QueueFault::Undefined(code)
    };
    InactiveCode::Fatal(fault)
}

/// Exception codes in the order they are checked.
const EXCEPTION_FAULTS: &[(u32, QueueFault)] = &[
    (ec::QUEUE_WAVE_ABORT, QueueFault::Exception),
    (ec::QUEUE_WAVE_TRAP, QueueFault::Exception),
    (ec::QUEUE_WAVE_MATH_ERROR, QueueFault::Exception),
    (ec::QUEUE_WAVE_ILLEGAL_INSTRUCTION, QueueFault::IllegalInstruction),
    (ec::QUEUE_WAVE_MEMORY_VIOLATION, QueueFault::MemoryFault),
    (ec::QUEUE_WAVE_APERTURE_VIOLATION, QueueFault::MemoryApertureViolation),
    (ec::QUEUE_PACKET_DISPATCH_DIM_INVALID, QueueFault::IncompatibleArguments),
    (ec::QUEUE_PACKET_DISPATCH_GROUP_SEGMENT_SIZE_INVALID, QueueFault::InvalidAllocation),
    (ec::QUEUE_PACKET_DISPATCH_CODE_INVALID, QueueFault::InvalidCodeObject),
    (ec::QUEUE_PACKET_RESERVED, QueueFault::InvalidPacketFormat),
    (ec::QUEUE_PACKET_UNSUPPORTED, QueueFault::InvalidPacketFormat),
    (ec::QUEUE_PACKET_DISPATCH_WORK_GROUP_SIZE_INVALID, QueueFault::InvalidArgument),
    (ec::QUEUE_PACKET_DISPATCH_REGISTER_INVALID, QueueFault::InvalidIsa),
    (ec::QUEUE_PACKET_VENDOR_UNSUPPORTED, QueueFault::InvalidPacketFormat),
    (ec::QUEUE_PREEMPTION_ERROR, QueueFault::Exception),
];

/// Maps an exception mask to the first fault it carries. Zero means nothing happened.
pub fn classify_exception_mask(mask: u64) -> Option<QueueFault> {
    if mask == 0 {
        return None;
    }
    let fault = EXCEPTION_FAULTS
        .iter()
        .find(|(code, _)| mask & ec::mask(*code) != 0)
        .map(|&(_, fault)| fault)
        .unwrap_or(QueueFault::Undefined(mask));
    Some(fault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn scratch_codes() {
        assert_eq!(
            classify_error_code(1),
            InactiveCode::InsufficientScratch { wave32: false }
        );
        assert_eq!(
            classify_error_code(1 | 0x400),
            InactiveCode::InsufficientScratch { wave32: true }
        );
        assert_eq!(classify_error_code(512), InactiveCode::ReclaimScratch);
    }

    #[test]
    fn fatal_codes() {
        let cases = [
            (2, QueueFault::IncompatibleArguments),
            (4, QueueFault::InvalidAllocation),
            (8, QueueFault::InvalidCodeObject),
            (32, QueueFault::InvalidPacketFormat),
            (256, QueueFault::InvalidPacketFormat),
            (64, QueueFault::InvalidArgument),
            (128, QueueFault::InvalidIsa),
            (0x2000_0000, QueueFault::MemoryApertureViolation),
            (0x4000_0000, QueueFault::IllegalInstruction),
            (0x8000_0000, QueueFault::Exception),
        ];
        for (code, fault) in cases {
            assert_eq!(classify_error_code(code), InactiveCode::Fatal(fault), "code {code:#x}");
        }
    }

    #[test]
    fn exception_masks() {
        assert_eq!(classify_exception_mask(0), None);
        assert_eq!(
            classify_exception_mask(ec::mask(ec::QUEUE_WAVE_MEMORY_VIOLATION)),
            Some(QueueFault::MemoryFault)
        );
        assert_eq!(
            classify_exception_mask(ec::mask(ec::QUEUE_WAVE_ILLEGAL_INSTRUCTION)),
            Some(QueueFault::IllegalInstruction)
        );
        assert_eq!(
            classify_exception_mask(ec::mask(ec::QUEUE_PACKET_DISPATCH_CODE_INVALID)),
            Some(QueueFault::InvalidCodeObject)
        );
        // First match wins.
        assert_eq!(
            classify_exception_mask(
                ec::mask(ec::QUEUE_PACKET_UNSUPPORTED) | ec::mask(ec::QUEUE_WAVE_TRAP)
            ),
            Some(QueueFault::Exception)
        );
        let unknown = ec::mask(ec::DEVICE_NEW);
        assert_eq!(classify_exception_mask(unknown), Some(QueueFault::Undefined(unknown)));
    }
}
