//! Bulk record patching across a card tree

use sdshare::arbiter::hal::{DirectoryMedia, GpioBus, SimulatedSense, SimulatedSwitch};
use sdshare::{bulk_patch, Arbiter, ArbiterConfig, PatchRequest, Record, Storage, RECORD_LEN};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::TempDir;

fn storage(root: &Path) -> Storage {
    let hardware = GpioBus::new(
        SimulatedSense::new(true),
        SimulatedSwitch::new(),
        DirectoryMedia::new(root),
    );
    let config = ArbiterConfig {
        debounce_ms: 200,
        poll_interval_ms: 5,
        boot_quiescence_ms: 0,
    };
    Storage::new(Arc::new(Arbiter::new(Box::new(hardware), config)))
}

fn write_record(path: &Path, fill: u8) {
    let mut record = Record::from_bytes(vec![fill; RECORD_LEN]).unwrap();
    fs::write(path, record.save()).unwrap();
}

#[test]
fn test_patch_tree_of_records() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("profiles/n64")).unwrap();
    fs::create_dir_all(root.join("profiles/snes")).unwrap();
    write_record(&root.join("profiles/n64/a.rt4"), 0);
    write_record(&root.join("profiles/snes/b.rt4"), 1);
    write_record(&root.join("top.rt4"), 2);
    fs::write(root.join("profiles/notes.txt"), "not a record").unwrap();
    fs::write(root.join("profiles/short.rt4"), vec![0u8; 100]).unwrap();

    let storage = storage(root);
    let request = PatchRequest::parse("0x300", "CAFE").unwrap();

    let report = bulk_patch(&storage, "/", &request).unwrap();
    assert_eq!(report.scanned, 4);
    assert_eq!(report.patched, 3);
    assert_eq!(report.unchanged, 0);
    assert_eq!(report.failed, 1);

    for path in ["profiles/n64/a.rt4", "profiles/snes/b.rt4", "top.rt4"] {
        let bytes = fs::read(root.join(path)).unwrap();
        assert_eq!(&bytes[0x300..0x302], &[0xCA, 0xFE], "{}", path);
        assert!(Record::from_bytes(bytes).unwrap().checksum_valid(), "{}", path);
    }
    assert_eq!(fs::read_to_string(root.join("profiles/notes.txt")).unwrap(), "not a record");
}

#[test]
fn test_second_run_skips_matching_records() {
    let dir = TempDir::new().unwrap();
    write_record(&dir.path().join("one.rt4"), 7);
    let storage = storage(dir.path());
    let request = PatchRequest::parse("4096", "00112233").unwrap();

    assert_eq!(bulk_patch(&storage, "/", &request).unwrap().patched, 1);
    let modified: SystemTime = fs::metadata(dir.path().join("one.rt4")).unwrap().modified().unwrap();

    let report = bulk_patch(&storage, "/", &request).unwrap();
    assert_eq!(report.patched, 0);
    assert_eq!(report.unchanged, 1);
    assert_eq!(
        fs::metadata(dir.path().join("one.rt4")).unwrap().modified().unwrap(),
        modified
    );
}

#[test]
fn test_missing_root_is_an_error() {
    let dir = TempDir::new().unwrap();
    let storage = storage(dir.path());
    let request = PatchRequest::parse("200", "01").unwrap();
    assert!(bulk_patch(&storage, "/absent", &request).is_err());
}
