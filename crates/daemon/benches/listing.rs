//! Performance benchmarks for request hot paths.
//!
//! These run on every request before any I/O:
//! - Path validation
//! - Page selection over a sorted directory
//! - Page token encoding

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daemon::model::page::{self, ListingOrder};
use daemon::model::safe::is_safe_relative_path;
use daemon::model::{Page, PageToken};

#[derive(Clone)]
struct Entry {
    name: String,
    is_directory: bool,
}

impl ListingOrder for Entry {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_directory(&self) -> bool {
        self.is_directory
    }
}

/// A sorted directory of `n` entries: a tenth directories, some hidden files.
fn directory(n: usize) -> Vec<Entry> {
    let mut entries: Vec<Entry> = (0..n)
        .map(|i| Entry {
            name: if i % 7 == 0 {
                format!(".hidden{:06}", i)
            } else {
                format!("IMG_{:06}.jpg", i)
            },
            is_directory: i % 10 == 0,
        })
        .collect();
    entries.sort_by(page::compare);
    entries
}

fn visible(entry: &Entry) -> bool {
    !entry.name.starts_with('.')
}

/// Benchmark the path sandbox.
fn bench_path_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_validation");

    for path in [
        "a.jpg",
        "holiday/2019/summer/beach/IMG_1234.jpg",
        "holiday/2019/../../../etc/passwd",
    ] {
        group.throughput(Throughput::Bytes(path.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(path.len()), path, |b, path| {
            b.iter(|| is_safe_relative_path(black_box(path)));
        });
    }

    group.finish();
}

/// Benchmark cutting one page out of directories of growing size.
fn bench_paginate(c: &mut Criterion) {
    let mut group = c.benchmark_group("paginate");

    for n in [100usize, 10_000, 100_000] {
        let entries = directory(n);
        let middle = PageToken::after(&entries[n / 2]);

        group.bench_with_input(BenchmarkId::new("first_page", n), &entries, |b, entries| {
            let request = Page::new(None, Some(100));
            b.iter(|| page::paginate(black_box(entries), &request, visible));
        });

        group.bench_with_input(BenchmarkId::new("middle_page", n), &entries, |b, entries| {
            let request = Page::new(Some(middle.clone()), Some(100));
            b.iter(|| page::paginate(black_box(entries), &request, visible));
        });
    }

    group.finish();
}

/// Benchmark page token encoding and decoding.
fn bench_page_token(c: &mut Criterion) {
    let token = PageToken::new("IMG_004711.jpg", false);
    let encoded = token.encode();

    c.bench_function("page_token_encode", |b| b.iter(|| black_box(&token).encode()));
    c.bench_function("page_token_decode", |b| {
        b.iter(|| PageToken::decode(black_box(&encoded)))
    });
}

criterion_group!(benches, bench_path_validation, bench_paginate, bench_page_token);

criterion_main!(benches);
