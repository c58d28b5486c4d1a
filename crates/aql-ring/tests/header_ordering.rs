//! A consumer that sees a valid header must see the whole packet the producer wrote before it.

use aql_ring::{AqlPacket, FenceScope, PacketHeader, PacketType, RingBuffer, RingLimits};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const ROUNDS: u32 = 20_000;

fn pattern(token: u32) -> AqlPacket {
    let mut p = AqlPacket::zeroed();
    p.set_header(PacketHeader::new(
        PacketType::KernelDispatch,
        false,
        FenceScope::System,
        FenceScope::System,
    ));
    p.set_setup((token & 0xFFFF) as u16);
    p.dwords[1] = token;
    for dw in 2..16 {
        p.dwords[dw] = token.wrapping_mul(0x9E37_79B9) ^ dw as u32;
    }
    p
}

#[test]
fn reader_never_observes_a_partial_slot() {
    let ring = Arc::new(RingBuffer::allocate(16, RingLimits::new(16, 16), false).unwrap());
    let start = Arc::new(Barrier::new(2));
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let ring = ring.clone();
        let start = start.clone();
        thread::spawn(move || {
            start.wait();
            for token in 0..ROUNDS {
                let index = token as u64;
                while ring.load_header(index, Ordering::Acquire).is_valid() {
                    thread::yield_now();
                }
                ring.publish(index, &pattern(token));
            }
        })
    };

    let reader = {
        let ring = ring.clone();
        let done = done.clone();
        thread::spawn(move || {
            start.wait();
            let mut next = 0u64;
            while next < ROUNDS as u64 {
                if !ring.load_header(next, Ordering::Acquire).is_valid() {
                    thread::yield_now();
                    continue;
                }
                let seen = ring.read_packet(next);
                let token = seen.dwords[1];
                assert_eq!(seen, pattern(token), "slot {next}");
                assert_eq!(token, next as u32);
                ring.invalidate(next);
                next += 1;
            }
            done.store(true, Ordering::Release);
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    assert!(done.load(Ordering::Acquire));
}
