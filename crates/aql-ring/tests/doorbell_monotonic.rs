#![cfg(not(target_arch = "wasm32"))]

use aql_ring::{Doorbell, DoorbellKind, IndexModel, RecordingDoorbell};
use proptest::prelude::*;
use std::sync::Arc;

proptest! {
    #[test]
    fn legacy_register_only_sees_new_maxima(values in proptest::collection::vec(0u64..512, 1..64)) {
        let sink = Arc::new(RecordingDoorbell::new());
        let db = Doorbell::new(DoorbellKind::LegacyIndex, IndexModel::Large, 1024, false, sink.clone());

        let mut expected = Vec::new();
        let mut max = 0u64;
        for &v in &values {
            db.ring(v, || (0, 0));
            if v + 1 > max {
                max = v + 1;
                expected.push(max);
            }
        }

        let history = sink.history();
        prop_assert_eq!(&history, &expected);
        prop_assert!(history.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(db.max_dispatch_id_plus_1(), max);
    }

    #[test]
    fn small_model_never_regresses(
        steps in proptest::collection::vec((0u64..64, 0u64..64), 1..64),
    ) {
        let sink = Arc::new(RecordingDoorbell::new());
        let db = Doorbell::new(DoorbellKind::LegacyIndex, IndexModel::Small, 16, false, sink.clone());

        for (write, behind) in steps {
            let read = write.saturating_sub(behind);
            db.ring(write, || (write, read));
        }
        let history = sink.history();
        prop_assert!(history.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn concurrent_rings_leave_the_maximum() {
    let sink = Arc::new(RecordingDoorbell::new());
    let db = Arc::new(Doorbell::new(
        DoorbellKind::LegacyIndex,
        IndexModel::Large,
        4096,
        false,
        sink.clone(),
    ));

    let threads: Vec<_> = (0..4u64)
        .map(|t| {
            let db = db.clone();
            std::thread::spawn(move || {
                for i in 0..500u64 {
                    db.ring(i * 4 + t, || (0, 0));
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let history = sink.history();
    assert!(history.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(history.last().copied(), Some(2000));
}
