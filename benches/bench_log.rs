//! Benchmarks for appending to the log.
#![allow(missing_docs)]

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;
use txnlog::storage::{Directory, FsDirectory, MemoryDirectory};
use txnlog::{Log, LogConfig, LogEditType, UserLogRecord};

const RECORDS: usize = 10_000;

fn append_all(log: &Log, sync_every: Option<usize>) {
    let payload = vec![0xABu8; 100];
    for i in 0..RECORDS {
        let sync = sync_every.is_some_and(|n| i % n == n - 1);
        let mut r = UserLogRecord::new(LogEditType::Data, payload.clone());
        log.log(&mut r, sync).unwrap();
    }
}

fn bench_log_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("log");
    group.sample_size(10);

    group.bench_function("append_10k_memory_buffer_64k", |b| {
        b.iter_batched(
            || {
                let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
                Log::with_directory(dir, LogConfig::new("mem").with_buffer_size(64 * 1024))
                    .unwrap()
            },
            |log| {
                append_all(&log, None);
                log.close().unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("append_10k_memory_unbuffered", |b| {
        b.iter_batched(
            || {
                let dir: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
                Log::with_directory(dir, LogConfig::new("mem").with_buffer_size(0)).unwrap()
            },
            |log| {
                append_all(&log, None);
                log.close().unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("append_10k_fs_buffer_64k", |b| {
        b.iter_batched(
            || {
                let tmp = tempfile::tempdir().unwrap();
                let dir: Arc<dyn Directory> = Arc::new(FsDirectory::new(tmp.path()).unwrap());
                let log = Log::with_directory(
                    dir,
                    LogConfig::new(tmp.path()).with_buffer_size(64 * 1024),
                )
                .unwrap();
                (tmp, log)
            },
            |(_tmp, log)| {
                append_all(&log, None);
                log.close().unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("append_10k_fs_sync_every_64", |b| {
        b.iter_batched(
            || {
                let tmp = tempfile::tempdir().unwrap();
                let dir: Arc<dyn Directory> = Arc::new(FsDirectory::new(tmp.path()).unwrap());
                let log = Log::with_directory(
                    dir,
                    LogConfig::new(tmp.path()).with_buffer_size(64 * 1024),
                )
                .unwrap();
                (tmp, log)
            },
            |(_tmp, log)| {
                append_all(&log, Some(64));
                log.close().unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("append_10k_fs_small_segments", |b| {
        b.iter_batched(
            || {
                let tmp = tempfile::tempdir().unwrap();
                let dir: Arc<dyn Directory> = Arc::new(FsDirectory::new(tmp.path()).unwrap());
                let log = Log::with_directory(
                    dir,
                    LogConfig::new(tmp.path())
                        .with_buffer_size(16 * 1024)
                        .with_soft_file_size_limit(64 * 1024),
                )
                .unwrap();
                (tmp, log)
            },
            |(_tmp, log)| {
                append_all(&log, None);
                log.close().unwrap();
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_log_append);
criterion_main!(benches);
