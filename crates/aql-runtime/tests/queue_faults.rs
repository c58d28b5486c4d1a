mod common;

use aql_kfd::ioctl::ec;
use aql_kfd::KfdVersion;
use aql_runtime::queue::faults::{ERROR_EXCEPTION, ERROR_INVALID_ARGUMENT, ERROR_INVALID_ISA};
use aql_runtime::{
    AqlQueue, ErrorCallback, GfxVersion, Queue, QueueFault, QueueOptions, QueueState,
    RuntimeConfig, RuntimeError, Signal,
};
use common::{small_props, wait_until, Rig};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

type Faults = Arc<Mutex<Vec<(QueueFault, u64, u32)>>>;

/// Records each fault along with the queue percentage the driver had at callback time.
fn faulting_queue(rig: &Rig) -> (AqlQueue, Faults) {
    let faults: Faults = Arc::default();
    let queue_id = Arc::new(Mutex::new(None::<u32>));
    let callback: ErrorCallback = {
        let faults = faults.clone();
        let kfd = rig.kfd.clone();
        let queue_id = queue_id.clone();
        Arc::new(move |fault, id| {
            let percentage = queue_id
                .lock()
                .unwrap()
                .and_then(|q| kfd.queue(q))
                .map_or(u32::MAX, |q| q.percentage);
            faults.lock().unwrap().push((fault, id, percentage));
        })
    };
    let queue = AqlQueue::create(
        &rig.agent,
        QueueOptions {
            error_callback: Some(callback),
            ..Default::default()
        },
    )
    .unwrap();
    *queue_id.lock().unwrap() = Some(queue.driver_queue_id());
    (queue, faults)
}

#[test]
fn error_code_suspends_before_reporting() {
    let rig = Rig::gfx9();
    let (queue, faults) = faulting_queue(&rig);

    queue
        .inactive_signal()
        .store(ERROR_INVALID_ARGUMENT as i64, Ordering::Release);
    wait_until("fault callback", || !faults.lock().unwrap().is_empty());

    assert_eq!(
        *faults.lock().unwrap(),
        vec![(QueueFault::InvalidArgument, queue.id(), 0)]
    );
    assert_eq!(queue.state(), QueueState::Suspended);
}

#[test]
fn callback_fires_once_per_queue() {
    let rig = Rig::gfx9();
    let (queue, faults) = faulting_queue(&rig);

    queue
        .inactive_signal()
        .store(ERROR_INVALID_ISA as i64, Ordering::Release);
    wait_until("fault callback", || !faults.lock().unwrap().is_empty());

    let exception = queue.exception_signal().unwrap();
    exception.store(ec::mask(ec::QUEUE_WAVE_TRAP) as i64, Ordering::Release);
    // Both handlers retire after a fault.
    wait_until("handlers retired", || rig.agent.signals().armed_handlers() == 0);

    let faults = faults.lock().unwrap();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].0, QueueFault::InvalidIsa);
}

#[test]
fn exception_mask_reports_first_matching_fault() {
    let rig = Rig::gfx9();
    let (queue, faults) = faulting_queue(&rig);

    let mask = ec::mask(ec::QUEUE_WAVE_APERTURE_VIOLATION) | ec::mask(ec::QUEUE_PACKET_RESERVED);
    queue
        .exception_signal()
        .unwrap()
        .store(mask as i64, Ordering::Release);
    wait_until("fault callback", || !faults.lock().unwrap().is_empty());

    assert_eq!(
        *faults.lock().unwrap(),
        vec![(QueueFault::MemoryApertureViolation, queue.id(), 0)]
    );
}

#[test]
fn old_drivers_have_no_exception_signal() {
    let rig = Rig::with(
        small_props(GfxVersion::new(9, 0, 10)),
        KfdVersion::new(1, 12),
        RuntimeConfig::default(),
    );
    let queue = AqlQueue::create(&rig.agent, QueueOptions::default()).unwrap();
    assert!(queue.exception_signal().is_none());
    assert_eq!(rig.agent.signals().armed_handlers(), 1);
}

#[test]
fn quiet_fault_messages_still_report() {
    let config = RuntimeConfig {
        queue_fault_messages: false,
        ..Default::default()
    };
    let rig = Rig::with(small_props(GfxVersion::new(9, 0, 10)), KfdVersion::new(1, 14), config);
    let (queue, faults) = faulting_queue(&rig);

    queue
        .inactive_signal()
        .store(ERROR_EXCEPTION as i64, Ordering::Release);
    wait_until("fault callback", || !faults.lock().unwrap().is_empty());
    assert_eq!(faults.lock().unwrap()[0].0, QueueFault::Exception);
}

#[test]
fn inactivated_queue_rejects_work() {
    let rig = Rig::gfx9();
    let queue = AqlQueue::create(&rig.agent, QueueOptions::default()).unwrap();
    let id = queue.driver_queue_id();

    queue.inactivate().unwrap();
    queue.inactivate().unwrap();
    assert_eq!(queue.state(), QueueState::Inactive);
    assert!(rig.kfd.queue(id).is_none());
    assert!(matches!(
        queue.execute_pm4(&[0]),
        Err(RuntimeError::QueueInactive(_))
    ));
    assert!(matches!(
        queue.set_priority(aql_runtime::QueuePriority::High),
        Err(RuntimeError::QueueInactive(_))
    ));
}
