mod common;

use aql_ring::{AqlPacket, InterceptMarker, KernelDispatchPacket, PacketType};
use aql_runtime::sim::{PacketProcessor, Step};
use aql_runtime::{
    submit_packets, AqlQueue, Condition, InterceptQueue, PacketWriter, Queue, QueueOptions, Signal,
};
use common::{dispatch, wait_until, Rig};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn kernel(object: u64, signal: u64) -> AqlPacket {
    let mut packet = KernelDispatchPacket::from_packet(&dispatch(0, signal)).unwrap();
    packet.kernel_object = object;
    packet.to_packet()
}

fn kernel_object(packet: &AqlPacket) -> u64 {
    KernelDispatchPacket::from_packet(packet).unwrap().kernel_object
}

/// Steps the hardware queue until `count` dispatches retired, returning their kernel objects in
/// retirement order. Barriers are stepped over.
fn retire_dispatches(cp: &mut PacketProcessor, wrapped: &AqlQueue, count: u64) -> Vec<u64> {
    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while seen.len() < count as usize {
        assert!(Instant::now() < deadline, "hardware queue stalled after {} dispatches", seen.len());
        let read = wrapped.load_read_index(Ordering::Acquire);
        if !wrapped.ring().load_header(read, Ordering::Acquire).is_valid() {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        let packet = wrapped.ring().read_packet(read);
        match cp.step() {
            Step::Completed(PacketType::KernelDispatch) => seen.push(kernel_object(&packet)),
            Step::Completed(_) => {}
            _ => std::thread::sleep(Duration::from_millis(1)),
        }
    }
    seen
}

fn proxy(rig: &Rig, hw_size: u32, proxy_size: u32) -> InterceptQueue {
    let wrapped = AqlQueue::create(
        &rig.agent,
        QueueOptions {
            size: hw_size,
            ..Default::default()
        },
    )
    .unwrap();
    InterceptQueue::create(wrapped, proxy_size).unwrap()
}

#[test]
fn packets_pass_through_newest_interceptor_first() {
    let rig = Rig::gfx9();
    let queue = proxy(&rig, 64, 4);
    let log = Arc::new(Mutex::new(Vec::new()));

    for name in ["outer", "inner"] {
        let log = log.clone();
        queue.add_interceptor(
            move |packets: &[AqlPacket], index: u64, writer: &mut PacketWriter<'_>| {
                log.lock().unwrap().push((name, index, kernel_object(&packets[0])));
                writer.write(packets);
            },
        );
    }

    let done = rig.agent.signals().create_signal(4);
    let packets: Vec<_> = (0..4).map(|i| kernel(100 + i, done.handle())).collect();
    assert_eq!(submit_packets(&queue, &packets).unwrap(), 0);

    // The doorbell drains synchronously on the producer's thread.
    assert_eq!(queue.load_read_index(Ordering::Acquire), 4);
    let wrapped = queue.wrapped();
    assert_eq!(wrapped.load_write_index(Ordering::Acquire), 4);
    for i in 0..4 {
        assert_eq!(kernel_object(&wrapped.ring().read_packet(i)), 100 + i);
        assert!(!queue.ring().load_header(i, Ordering::Acquire).is_valid());
    }

    let expected: Vec<_> = (0..4u64)
        .flat_map(|i| [("inner", i, 100 + i), ("outer", i, 100 + i)])
        .collect();
    assert_eq!(*log.lock().unwrap(), expected);

    assert_eq!(PacketProcessor::new(wrapped).run_until_idle(), 4);
    assert_eq!(done.load(Ordering::Acquire), 0);
}

#[test]
fn interceptors_can_rewrite_and_expand() {
    let rig = Rig::gfx9();
    let queue = proxy(&rig, 64, 8);

    // Duplicates every packet, bumping the copy's kernel object.
    queue.add_interceptor(|packets: &[AqlPacket], _: u64, writer: &mut PacketWriter<'_>| {
        for packet in packets {
            let mut copy = KernelDispatchPacket::from_packet(packet).unwrap();
            copy.kernel_object += 1000;
            writer.write(&[*packet, copy.to_packet()]);
        }
    });

    submit_packets(&queue, &[kernel(1, 0), kernel(2, 0)]).unwrap();
    let wrapped = queue.wrapped();
    assert_eq!(wrapped.load_write_index(Ordering::Acquire), 4);
    let objects: Vec<_> = (0..4).map(|i| kernel_object(&wrapped.ring().read_packet(i))).collect();
    assert_eq!(objects, vec![1, 1001, 2, 1002]);
}

#[test]
fn markers_fire_in_stream_order_without_a_slot() {
    let rig = Rig::gfx9();
    let queue = Arc::new(proxy(&rig, 64, 8));
    let fired = Arc::new(Mutex::new(Vec::new()));

    let id = {
        let fired = fired.clone();
        let weak = Arc::downgrade(&queue);
        queue.register_marker_callback(move |marker| {
            let placed = weak
                .upgrade()
                .map(|q| q.wrapped().load_write_index(Ordering::Acquire));
            fired.lock().unwrap().push((marker.user_data, placed));
        })
    };
    assert_eq!(id, 1);

    let marker = InterceptMarker {
        callback: id,
        user_data: [7, 9],
    };
    submit_packets(queue.as_ref(), &[kernel(1, 0), marker.to_packet(), kernel(2, 0)]).unwrap();

    assert_eq!(*fired.lock().unwrap(), vec![([7, 9], Some(1))]);
    assert_eq!(queue.load_read_index(Ordering::Acquire), 3);
    assert_eq!(queue.wrapped().load_write_index(Ordering::Acquire), 2);

    // Unknown ids are skipped.
    let stray = InterceptMarker {
        callback: 42,
        user_data: [0, 0],
    };
    submit_packets(queue.as_ref(), &[stray.to_packet()]).unwrap();
    assert_eq!(queue.load_read_index(Ordering::Acquire), 4);
    assert_eq!(fired.lock().unwrap().len(), 1);
}

#[test]
fn full_hardware_ring_defers_behind_a_barrier() {
    const PREFILL: u64 = 60;
    const SUBMITTED: u64 = 10;

    let rig = Rig::gfx9();
    let queue = proxy(&rig, 64, 16);
    let wrapped = queue.wrapped();
    assert_eq!(wrapped.size(), 64);

    let prefill: Vec<_> = (0..PREFILL).map(|i| kernel(1000 + i, 0)).collect();
    submit_packets(wrapped, &prefill).unwrap();

    let done = rig.agent.signals().create_signal(SUBMITTED as i64);
    let packets: Vec<_> = (0..SUBMITTED).map(|i| kernel(i, done.handle())).collect();
    submit_packets(&queue, &packets).unwrap();

    // Three fit, the fourth slot carries the retry barrier.
    assert_eq!(wrapped.load_write_index(Ordering::Acquire), 64);
    assert_eq!(wrapped.ring().read_packet(63).packet_type(), Some(PacketType::BarrierAnd));
    assert!(queue.overflow_len() > 0);

    let seen = retire_dispatches(&mut PacketProcessor::new(wrapped), wrapped, PREFILL + SUBMITTED);
    let expected: Vec<_> = (0..PREFILL).map(|i| 1000 + i).chain(0..SUBMITTED).collect();
    assert_eq!(seen, expected);
    assert_eq!(done.wait(Condition::Eq, 0, Some(Duration::from_secs(1))), 0);
    wait_until("overflow drained", || queue.overflow_len() == 0);
    assert_eq!(queue.load_read_index(Ordering::Acquire), SUBMITTED);
}

#[test]
fn zero_free_hardware_ring_keeps_overflow_until_space_returns() {
    const SIZE: u64 = 64;
    const SUBMITTED: u64 = 2;

    let rig = Rig::gfx9();
    let queue = proxy(&rig, SIZE as u32, 16);
    let wrapped = queue.wrapped();

    let prefill: Vec<_> = (0..SIZE).map(|i| kernel(1000 + i, 0)).collect();
    submit_packets(wrapped, &prefill).unwrap();

    let done = rig.agent.signals().create_signal(SUBMITTED as i64);
    let packets: Vec<_> = (0..SUBMITTED).map(|i| kernel(i, done.handle())).collect();
    submit_packets(&queue, &packets).unwrap();

    // Not even the retry barrier fits.
    assert_eq!(wrapped.load_write_index(Ordering::Acquire), SIZE);
    assert_eq!(queue.overflow_len(), 1);
    assert_eq!(queue.load_read_index(Ordering::Acquire), 1);

    let seen = retire_dispatches(&mut PacketProcessor::new(wrapped), wrapped, SIZE + SUBMITTED);
    let expected: Vec<_> = (0..SIZE).map(|i| 1000 + i).chain(0..SUBMITTED).collect();
    assert_eq!(seen, expected);
    assert_eq!(done.wait(Condition::Eq, 0, Some(Duration::from_secs(1))), 0);
    wait_until("overflow drained", || queue.overflow_len() == 0);
    assert_eq!(queue.load_read_index(Ordering::Acquire), SUBMITTED);
}

#[test]
fn pending_retry_lets_the_flush_fill_every_free_slot() {
    const PREFILL: u64 = 60;
    const SUBMITTED: u64 = 10;

    let rig = Rig::gfx9();
    let queue = proxy(&rig, 64, 16);
    let wrapped = queue.wrapped();

    let prefill: Vec<_> = (0..PREFILL).map(|i| kernel(1000 + i, 0)).collect();
    submit_packets(wrapped, &prefill).unwrap();
    let packets: Vec<_> = (0..SUBMITTED).map(|i| kernel(i, 0)).collect();
    submit_packets(&queue, &packets).unwrap();
    assert_eq!(wrapped.load_write_index(Ordering::Acquire), 64);
    assert_eq!(wrapped.ring().read_packet(63).packet_type(), Some(PacketType::BarrierAnd));

    // Free four slots well ahead of the barrier, then ring the proxy again.
    let mut cp = PacketProcessor::new(wrapped);
    for _ in 0..4 {
        assert_eq!(cp.step(), Step::Completed(PacketType::KernelDispatch));
    }
    queue.ring_doorbell(queue.load_write_index(Ordering::Acquire) - 1);

    assert_eq!(wrapped.load_write_index(Ordering::Acquire), 68);
    let flushed: Vec<_> = (64..68).map(|i| kernel_object(&wrapped.ring().read_packet(i))).collect();
    assert_eq!(flushed, vec![3, 4, 5, 6]);
    assert_eq!(queue.overflow_len(), 1);

    let seen = retire_dispatches(&mut cp, wrapped, PREFILL - 4 + SUBMITTED);
    let expected: Vec<_> = (4..PREFILL).map(|i| 1000 + i).chain(0..SUBMITTED).collect();
    assert_eq!(seen, expected);
    wait_until("overflow drained", || queue.overflow_len() == 0);
}

#[test]
fn submissions_from_inside_the_chain_are_deferred() {
    let rig = Rig::gfx9();
    let queue = Arc::new(proxy(&rig, 64, 8));
    let weak = Arc::downgrade(&queue);

    // The first packet makes the interceptor submit a follow-up through the proxy itself.
    queue.add_interceptor(move |packets: &[AqlPacket], _: u64, writer: &mut PacketWriter<'_>| {
        writer.write(packets);
        if kernel_object(&packets[0]) == 1 {
            if let Some(queue) = weak.upgrade() {
                submit_packets(queue.as_ref(), &[kernel(2, 0)]).unwrap();
            }
        }
    });

    submit_packets(queue.as_ref(), &[kernel(1, 0)]).unwrap();
    wait_until("deferred drain", || {
        queue.wrapped().load_write_index(Ordering::Acquire) == 2
    });
    let wrapped = queue.wrapped();
    assert_eq!(kernel_object(&wrapped.ring().read_packet(0)), 1);
    assert_eq!(kernel_object(&wrapped.ring().read_packet(1)), 2);
}

#[test]
fn proxy_teardown_releases_the_wrapped_queue() {
    let rig = Rig::gfx9();
    let queue = proxy(&rig, 64, 4);
    let driver_id = queue.wrapped().driver_queue_id();
    assert!(rig.kfd.queue(driver_id).is_some());

    drop(queue);
    assert!(rig.kfd.queue(driver_id).is_none());
    wait_until("handlers retired", || rig.agent.signals().armed_handlers() == 0);
}
