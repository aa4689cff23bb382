/// Drift evaluation cost as the window grows.
///
/// Run with: cargo bench --bench drift_eval

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;

use model_governance::drift::{self, DriftWindow, ReferenceSnapshot};
use model_governance::schema::{FeatureDescriptor, LabeledRecord, Record, Value};
use model_governance::{Dataset, FeatureSchema};

fn rows(n: usize, shift: f64, seed: u64) -> Vec<LabeledRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| {
        let mut features = Record::new();
        features.insert("Age".into(), Value::Number(rng.gen_range(20.0..60.0) + shift));
        features.insert("MonthlyIncome".into(), Value::Number(rng.gen_range(1500.0..15000.0)));
        features.insert("Department".into(), Value::Text(["Sales", "R&D", "HR"][rng.gen_range(0..3)].into()));
        LabeledRecord { features, label: rng.gen_bool(0.2) }
    }).collect()
}

fn bench_evaluate(c: &mut Criterion) {
    let schema = Arc::new(FeatureSchema::new(vec![
        FeatureDescriptor::numeric("Age"),
        FeatureDescriptor::numeric("MonthlyIncome"),
        FeatureDescriptor::categorical("Department"),
    ], "Attrition").unwrap());
    let reference = Dataset::new(schema, rows(5_000, 0.0, 1)).unwrap();
    let snapshot = ReferenceSnapshot::capture("bench", Some(1), &reference, &[], 5_000);

    let mut group = c.benchmark_group("drift_evaluate");
    for size in [200usize, 2_000, 20_000] {
        let window = DriftWindow::new(rows(size, 3.0, 2).into_iter().map(|r| r.features).collect(), vec![]);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &window, |b, w| {
            b.iter(|| black_box(drift::evaluate(w, &snapshot, 0.01).unwrap()));
        });
    }
    group.finish();
}

fn bench_ks(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(3);
    let mut a: Vec<f64> = (0..10_000).map(|_| rng.gen()).collect();
    let mut b: Vec<f64> = (0..10_000).map(|_| rng.gen::<f64>() + 0.05).collect();
    a.sort_by(|x, y| x.total_cmp(y));
    b.sort_by(|x, y| x.total_cmp(y));
    c.bench_function("ks_statistic_10k", |bench| bench.iter(|| black_box(drift::ks_statistic(&a, &b))));
    c.bench_function("psi_10k", |bench| bench.iter(|| black_box(drift::psi(&a, &b, drift::PSI_BINS))));
}

criterion_group!(benches, bench_evaluate, bench_ks);
criterion_main!(benches);
