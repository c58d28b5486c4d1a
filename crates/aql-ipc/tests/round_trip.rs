//! An exporter and an importer in one process, each with its own pool and mapping.

use aql_ipc::{IpcError, IpcHandle, IpcSignal, SharedMemoryPool};
use aql_runtime::{Condition, Signal};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn fill(ptr: *mut u8, len: usize, seed: u8) {
    for i in 0..len {
        // SAFETY: callers pass ranges inside live mappings.
        unsafe { ptr.add(i).write_volatile(seed.wrapping_add(i as u8)) };
    }
}

fn read(ptr: *const u8, len: usize) -> Vec<u8> {
    // SAFETY: as above.
    (0..len).map(|i| unsafe { ptr.add(i).read_volatile() }).collect()
}

#[test]
fn memory_round_trips_through_two_mappings() {
    let exporter = SharedMemoryPool::new();
    let importer = SharedMemoryPool::new();
    let page = exporter.page_size();

    let local = exporter.allocate(2 * page).unwrap().as_ptr();
    fill(local, 2 * page, 3);

    // The handle crosses the boundary as bytes.
    let bytes = exporter.export(local, 2 * page).unwrap().to_bytes();
    let remote = importer
        .attach(&IpcHandle::from_bytes(bytes), 2 * page)
        .unwrap()
        .as_ptr();
    assert_ne!(remote, local);
    assert_eq!(read(remote, 2 * page), read(local, 2 * page));

    // Writes flow back the other way.
    fill(remote, 16, 200);
    assert_eq!(read(local, 16), (200..216).collect::<Vec<u8>>());

    importer.detach(remote).unwrap();
    assert_eq!(importer.stats().attachments, 0);
    exporter.free(local).unwrap();
}

#[test]
fn fragments_attach_at_their_offset() {
    let exporter = SharedMemoryPool::new();
    let importer = SharedMemoryPool::new();
    let page = exporter.page_size();

    let base = exporter.allocate(4 * page).unwrap().as_ptr();
    // SAFETY: in bounds of the 4-page block.
    let third = unsafe { base.add(2 * page) };
    fill(third, page, 77);

    let handle = exporter.export(third, page).unwrap();
    assert_eq!(handle.fragment_pages(), Some(2));

    let remote = importer.attach(&handle, page).unwrap().as_ptr();
    assert_eq!(read(remote, page), read(third, page));

    // Past the end of the block, counting from the fragment.
    assert!(matches!(
        importer.attach(&handle, 3 * page),
        Err(IpcError::OutOfRange { .. })
    ));
    importer.detach(remote).unwrap();
}

#[test]
fn importers_keep_their_view_after_free() {
    let exporter = SharedMemoryPool::new();
    let importer = SharedMemoryPool::new();

    let local = exporter.allocate(64).unwrap().as_ptr();
    fill(local, 64, 1);
    let handle = exporter.export(local, 64).unwrap();
    let remote = importer.attach(&handle, 64).unwrap().as_ptr();

    exporter.free(local).unwrap();
    assert_eq!(read(remote, 4), vec![1, 2, 3, 4]);
    assert!(matches!(importer.attach(&handle, 64), Err(IpcError::Gone)));
    importer.detach(remote).unwrap();
}

#[test]
fn tampered_lengths_are_caught() {
    let exporter = SharedMemoryPool::new();
    let importer = SharedMemoryPool::new();
    let page = exporter.page_size();

    let local = exporter.allocate(page).unwrap().as_ptr();
    let mut handle = exporter.export(local, page).unwrap();
    handle.0[aql_ipc::handle::word::LEN_LO] = 2 * page as u32;
    assert!(matches!(
        importer.attach(&handle, page),
        Err(IpcError::SizeMismatch { .. })
    ));
}

#[test]
fn signals_are_shared_between_pools() {
    let exporter = Arc::new(SharedMemoryPool::new());
    let importer = Arc::new(SharedMemoryPool::new());

    let owner = IpcSignal::create(&exporter, 3).unwrap();
    let remote = IpcSignal::attach(&importer, &owner.handle()).unwrap();
    assert!(!remote.is_owner());
    assert_eq!(remote.load(Ordering::Acquire), 3);

    let waiter = thread::spawn(move || {
        let seen = remote.wait(Condition::Eq, 0, Some(Duration::from_secs(10)));
        remote.store(-1, Ordering::Release);
        seen
    });
    for _ in 0..3 {
        owner.sub(1, Ordering::AcqRel);
    }
    assert_eq!(waiter.join().unwrap(), 0);
    assert_eq!(
        owner.wait(Condition::Lt, 0, Some(Duration::from_secs(10))),
        -1
    );

    // The waiter dropped its end.
    assert_eq!(importer.stats().attachments, 0);
    drop(owner);
    assert_eq!(exporter.stats().blocks, 0);
}
