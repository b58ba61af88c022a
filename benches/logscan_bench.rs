use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ecmpool::logscan::{classify, WatchedFile};
use std::io::Write;

fn curve_log(curves: usize) -> String {
    let mut log = String::from("GMP-ECM 7.0.5 [configured with GMP 6.2.1, --enable-asm-redc] [ECM]\n");
    for i in 1..=curves {
        log.push_str(&format!(
            "Run {i} out of {curves}:\n\
             Using B1=11000000, B2=35133391030, polynomial Dickson(12), sigma=1:{i}\n\
             Step 1 took 41203ms\n\
             Step 2 took 18227ms\n"
        ));
    }
    log
}

fn bench_classify(c: &mut Criterion) {
    let lines = [
        "Step 1 took 41203ms",
        "Using B1=11000000, B2=35133391030, polynomial Dickson(12), sigma=1:42",
        "********** Factor found in step 2: 1000000007",
        "Run 17 out of 100:",
        "Input number is 1000000016000000063 (19 digits)",
    ];
    c.bench_function("classify(5 lines)", |b| {
        b.iter(|| {
            for line in &lines {
                black_box(classify(black_box(line)));
            }
        });
    });
}

fn bench_scan_large_log(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job0001_t00.txt");
    std::fs::write(&path, curve_log(10_000)).unwrap();
    c.bench_function("scan(10000 curves)", |b| {
        b.iter(|| WatchedFile::scan(black_box(&path)));
    });
}

fn bench_idle_poll(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job0001_t00.txt");
    std::fs::write(&path, curve_log(1_000)).unwrap();
    let mut watched = WatchedFile::scan(&path);
    c.bench_function("poll(unchanged file)", |b| {
        b.iter(|| black_box(watched.poll()));
    });
}

fn bench_incremental_poll(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job0001_t00.txt");
    let mut file = std::fs::File::create(&path).unwrap();
    let mut watched = WatchedFile::new(&path);
    let block = "Run 1 out of 1:\nStep 1 took 41203ms\nStep 2 took 18227ms\n";
    c.bench_function("poll(one new curve)", |b| {
        b.iter(|| {
            file.write_all(block.as_bytes()).unwrap();
            black_box(watched.poll())
        });
    });
}

criterion_group!(
    benches,
    bench_classify,
    bench_scan_large_log,
    bench_idle_poll,
    bench_incremental_poll
);
criterion_main!(benches);
