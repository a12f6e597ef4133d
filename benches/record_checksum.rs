//! Benchmarks for record checksums and region checks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sdshare::arbiter::hal::{DirectoryMedia, GpioBus, SimulatedSense, SimulatedSwitch};
use sdshare::{crc16, Arbiter, ArbiterConfig, Record, Storage, RECORD_LEN};
use std::sync::Arc;
use tempfile::TempDir;

fn benchmark_crc16(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc16");

    for size in [128usize, 4096, RECORD_LEN].iter() {
        let data: Vec<u8> = (0..*size).map(|i| (i * 31) as u8).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| crc16(black_box(data)));
        });
    }

    group.finish();
}

fn benchmark_record_save(c: &mut Criterion) {
    let mut record = Record::from_bytes(vec![0xA5; RECORD_LEN]).unwrap();
    c.bench_function("record_patch_and_save", |b| {
        b.iter(|| {
            record.patch(black_box(0x200), black_box(&[0xDE, 0xAD])).unwrap();
            black_box(record.save().len());
        });
    });
}

fn benchmark_check_region(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut record = Record::from_bytes(vec![0u8; RECORD_LEN]).unwrap();
    record.patch(0x200, &[0xBE, 0xEF]).unwrap();
    std::fs::write(dir.path().join("r.rt4"), record.save()).unwrap();

    let hardware = GpioBus::new(
        SimulatedSense::new(true),
        SimulatedSwitch::new(),
        DirectoryMedia::new(dir.path()),
    );
    let config = ArbiterConfig {
        debounce_ms: 60_000,
        poll_interval_ms: 1,
        boot_quiescence_ms: 0,
    };
    let storage = Storage::new(Arc::new(Arbiter::new(Box::new(hardware), config)));

    let mut group = c.benchmark_group("check_region");
    group.bench_function("match", |b| {
        b.iter(|| storage.check_region(black_box("/r.rt4"), 0x200, &[0xBE, 0xEF]).unwrap());
    });
    group.bench_function("full_read", |b| {
        b.iter(|| black_box(storage.read_raw(black_box("/r.rt4")).unwrap().len()));
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_crc16,
    benchmark_record_save,
    benchmark_check_region
);
criterion_main!(benches);
