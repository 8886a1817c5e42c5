use std::{fs, io::Cursor, path::PathBuf};

use apt_pipeline::{
    KeyedLineIndex, MergePolicy, QcThresholds, Reader, SampleMetrics, evaluate_samples,
    merge_static_column_file,
};
use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rayon::ThreadPoolBuilder;
use tempfile::{NamedTempFile, tempdir};

fn create_calls_table(dir: &tempfile::TempDir, name: &str, rows: usize, step: usize) -> PathBuf {
    let path = dir.path().join(name);
    let mut content = String::from("#%affymetrix-algorithm-name=AxiomGT1\nprobeset_id\tS1.CEL\tS2.CEL\tS3.CEL\n");
    for i in (0..rows).step_by(step) {
        content.push_str(&format!("AX-{}\t0\t1\t2\n", 10_000_000 + i));
    }
    fs::write(&path, content).unwrap();
    path
}

fn bench_index_build(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let table = create_calls_table(&dir, "calls.txt", 20_000, 1);

    c.bench_function("index_build", |b| {
        b.iter(|| black_box(KeyedLineIndex::build(&table).unwrap().into_parts().0.len()));
    });
}

fn bench_static_merge(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let default = create_calls_table(&dir, "default.txt", 20_000, 1);
    let modified = create_calls_table(&dir, "modified.txt", 20_000, 7);
    let dir_path = dir.path().to_path_buf();
    let improved: Vec<String> = (0..20_000)
        .step_by(21)
        .map(|i| format!("AX-{}", 10_000_000 + i))
        .collect();

    let mut group = c.benchmark_group("static_merge");
    for (label, policy) in [
        ("modified_wins", MergePolicy::new()),
        ("improved_list", MergePolicy::new().with_improved(improved)),
    ] {
        group.bench_function(BenchmarkId::new(label, 20_000), |b| {
            b.iter_batched(
                || NamedTempFile::new_in(&dir_path).unwrap(),
                |output| {
                    merge_static_column_file(&default, &modified, output.path(), &policy)
                        .expect("merge");
                    output.close().unwrap();
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_grouped_posteriors(c: &mut Criterion) {
    let mut content = String::from("#%SnpPosteriorFormatVer=1.0\nid\tBB\tAB\tAA\tCV\n");
    for i in 0..5_000 {
        content.push_str(&format!("AX-{i}:1\t0.1,0.2\t0.3,0.4\t0.5,0.6\t0.7\n"));
        content.push_str(&format!("AX-{i}:2\t0.1,0.2\t0.3,0.4\t0.5,0.6\t0.7\n"));
    }
    let data = content.into_bytes();

    c.bench_function("grouped_posteriors", |b| {
        b.iter(|| {
            let reader = Reader::posteriors(Cursor::new(&data));
            for result in reader {
                black_box(&result);
            }
        });
    });
}

fn bench_plate_qc(c: &mut Criterion) {
    let samples: Vec<SampleMetrics> = (0..9_600)
        .map(|i| SampleMetrics {
            sample_id: format!("S{i}.CEL"),
            plate_barcode: format!("P{:03}", i / 96),
            dqc: 0.8 + (i % 20) as f64 / 100.0,
            qccr: 96.0 + (i % 40) as f64 / 10.0,
        })
        .collect();
    let thresholds = QcThresholds::default();
    let sequential_pool = ThreadPoolBuilder::new().num_threads(1).build().unwrap();
    let parallel_pool = ThreadPoolBuilder::new().num_threads(4).build().unwrap();

    let mut group = c.benchmark_group("plate_qc");
    group.bench_function("sequential", |b| {
        b.iter(|| sequential_pool.install(|| black_box(evaluate_samples(&samples, &thresholds))));
    });
    group.bench_function("parallel", |b| {
        b.iter(|| parallel_pool.install(|| black_box(evaluate_samples(&samples, &thresholds))));
    });
    group.finish();
}

criterion_group!(
    merge_benches,
    bench_index_build,
    bench_static_merge,
    bench_grouped_posteriors,
    bench_plate_qc
);
criterion_main!(merge_benches);
