//! Benchmarks for commit log append and replay
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use transit::commitlog::{CommitLog, CommitLogOptions, LogEntry, Mode};
use transit::offset::{LogManager, Offset, OffsetManager};
use transit::Op;

fn entry(i: u64, value_len: usize) -> LogEntry {
    LogEntry {
        key: b"bench.items".to_vec(),
        value: vec![(i % 251) as u8; value_len],
        timestamp: i,
        mode: Mode::Copy,
        op: Op::Insert,
    }
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_log_append");

    for value_len in [64, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Bytes(*value_len as u64));
        group.bench_with_input(
            BenchmarkId::new("append", value_len),
            value_len,
            |b, &value_len| {
                let dir = tempfile::tempdir().unwrap();
                let log = CommitLog::open(CommitLogOptions::new(dir.path().join("log"))).unwrap();
                let mut i = 0u64;
                b.iter(|| {
                    log.append(black_box(&entry(i, value_len))).unwrap();
                    i += 1;
                });
            },
        );
    }

    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_log_replay");

    for count in [1_000u64, 10_000].iter() {
        let dir = tempfile::tempdir().unwrap();
        let log = CommitLog::open(
            CommitLogOptions::new(dir.path().join("log")).max_segment_bytes(256 * 1024),
        )
        .unwrap();
        for i in 0..*count {
            log.append(&entry(i, 128)).unwrap();
        }

        group.throughput(Throughput::Elements(*count));
        group.bench_with_input(BenchmarkId::new("read_all", count), count, |b, &count| {
            b.iter(|| {
                let mut reader = log.reader(0).unwrap();
                let mut n = 0u64;
                while let Some((offset, entry)) = reader.next_entry().unwrap() {
                    black_box((offset, entry));
                    n += 1;
                }
                assert_eq!(n, count);
            });
        });
    }

    group.finish();
}

fn bench_offset_commit(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let manager = LogManager::open(dir.path(), "bench").unwrap();
    let mut i = 0u64;

    c.bench_function("offset_commit", |b| {
        b.iter(|| {
            manager
                .commit_offset(black_box(Offset::new("bench.items", i, 0)))
                .unwrap();
            i += 1;
        });
    });
}

criterion_group!(benches, bench_append, bench_replay, bench_offset_commit);
criterion_main!(benches);
