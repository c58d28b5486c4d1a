#![cfg(not(target_arch = "wasm32"))]

use aql_ipc::handle::{word, HANDLE_BYTES};
use aql_ipc::{IpcError, IpcHandle, ShareToken, FRAGMENT_FLAG, HANDLE_MAGIC, MAX_FRAGMENT_PAGES};
use proptest::prelude::*;

fn token_strategy() -> impl Strategy<Value = ShareToken> {
    (any::<u32>(), any::<u64>(), any::<u64>()).prop_map(|(pid, serial, len)| ShareToken {
        pid,
        serial,
        len,
    })
}

proptest! {
    #[test]
    fn fragment_word_packs_flag_and_page_offset(
        token in token_strategy(),
        pages in 0..=MAX_FRAGMENT_PAGES,
    ) {
        let handle = IpcHandle::new(token).with_fragment(pages as u64).unwrap();
        let fragment = handle.0[word::FRAGMENT];

        prop_assert_eq!(fragment & FRAGMENT_FLAG, FRAGMENT_FLAG);
        prop_assert_eq!(fragment & !FRAGMENT_FLAG, pages);
        prop_assert_eq!(handle.0[word::RESERVED], 0);
        prop_assert_eq!(handle.0[word::MAGIC], HANDLE_MAGIC);

        // The fragment bits never disturb the token words.
        prop_assert_eq!(&handle.0[..word::FRAGMENT], &IpcHandle::new(token).0[..word::FRAGMENT]);

        let bytes = handle.to_bytes();
        prop_assert_eq!(bytes.len(), HANDLE_BYTES);
        prop_assert_eq!(
            &bytes[word::FRAGMENT * 4..word::FRAGMENT * 4 + 4],
            &fragment.to_le_bytes()[..]
        );
        let parsed = IpcHandle::from_bytes(bytes);
        prop_assert_eq!(parsed.token().unwrap(), token);
        prop_assert_eq!(parsed.fragment_pages(), Some(pages));
    }

    #[test]
    fn offsets_past_the_flag_bit_are_refused(pages in (MAX_FRAGMENT_PAGES as u64 + 1)..=u64::MAX) {
        let err = IpcHandle::new(ShareToken { pid: 1, serial: 1, len: 1 })
            .with_fragment(pages)
            .unwrap_err();
        prop_assert!(matches!(err, IpcError::FragmentTooFar(p) if p == pages));
    }
}
