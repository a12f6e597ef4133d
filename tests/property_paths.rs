//! Property-based tests for path translation and record checksums
//!
//! Uses proptest to check that client paths survive the trip to the native
//! namespace and back, and that checksum validation tracks payload edits.

use proptest::prelude::*;
use sdshare::record::{CHECKSUM_LEN, CHECKSUM_OFFSET, HEADER_LEN};
use sdshare::storage::paths;
use sdshare::{Record, RECORD_LEN};
use std::path::Path;

fn segment() -> impl Strategy<Value = String> {
    "[A-Za-z0-9 _+-][A-Za-z0-9 _+.-]{0,11}"
}

proptest! {
    #[test]
    fn prop_client_native_round_trip(segments in prop::collection::vec(segment(), 0..6)) {
        let root = Path::new("/media/card");
        let client = format!("/{}", segments.join("/"));

        let native = paths::to_native(root, &client).unwrap();
        prop_assert!(native.starts_with(root));
        prop_assert_eq!(paths::to_client(root, &native).unwrap(), client);
    }

    #[test]
    fn prop_normalize_is_idempotent(segments in prop::collection::vec(segment(), 0..6)) {
        let messy = format!("//{}/./", segments.join("//"));
        let once = paths::normalize(&messy).unwrap();
        prop_assert_eq!(paths::normalize(&once).unwrap(), once.clone());
        prop_assert!(once.starts_with('/'));
        prop_assert!(once == "/" || !once.ends_with('/'));
    }

    #[test]
    fn prop_parent_segments_rejected(
        before in prop::collection::vec(segment(), 0..3),
        after in prop::collection::vec(segment(), 0..3)
    ) {
        let mut all = before;
        all.push("..".to_string());
        all.extend(after);
        prop_assert!(paths::normalize(&all.join("/")).is_err());
    }

    #[test]
    fn prop_payload_edit_breaks_checksum_until_saved(
        offset in HEADER_LEN..RECORD_LEN,
        value in any::<u8>()
    ) {
        let mut record = Record::from_bytes(vec![0u8; RECORD_LEN]).unwrap();
        record.save();
        prop_assume!(record.as_bytes()[offset] != value);

        record.patch(offset, &[value]).unwrap();
        prop_assert!(!record.checksum_valid());
        record.save();
        prop_assert!(record.checksum_valid());
    }

    #[test]
    fn prop_header_edit_keeps_checksum(offset in 0usize..HEADER_LEN, value in any::<u8>()) {
        prop_assume!(!(CHECKSUM_OFFSET..CHECKSUM_OFFSET + CHECKSUM_LEN).contains(&offset));

        let mut record = Record::from_bytes(vec![0x5Au8; RECORD_LEN]).unwrap();
        record.save();
        record.patch(offset, &[value]).unwrap();
        prop_assert!(record.checksum_valid());
    }
}
