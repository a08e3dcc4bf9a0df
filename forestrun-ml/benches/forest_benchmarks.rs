use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use forestrun_ml::data::{DataSplit, FeatureMatrix};
use forestrun_ml::forest::{ForestParams, MaxFeatures, RandomForestRegressor};
use forestrun_ml::metrics::root_mean_squared_error;

fn synthetic(rows: usize, cols: usize) -> DataSplit {
    let values: Vec<f64> = (0..rows * cols)
        .map(|i| ((i * 7919) % 1013) as f64 / 10.0)
        .collect();
    let features = FeatureMatrix::new(rows, cols, values).unwrap();
    let target: Vec<f64> = features
        .rows()
        .map(|r| r.iter().enumerate().map(|(j, v)| v * (j + 1) as f64).sum())
        .collect();
    DataSplit::new(features, target).unwrap()
}

fn bench_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("forest_fit");
    group.sample_size(10);
    for rows in [500, 2000] {
        let split = synthetic(rows, 8);
        let params = ForestParams {
            n_estimators: 20,
            ..ForestParams::default()
        };
        group.bench_with_input(BenchmarkId::new("all_features", rows), &split, |b, split| {
            b.iter(|| {
                RandomForestRegressor::new(params.clone())
                    .fit(black_box(split))
                    .unwrap()
            })
        });
        let sqrt = ForestParams {
            max_features: MaxFeatures::Sqrt,
            ..params.clone()
        };
        group.bench_with_input(BenchmarkId::new("sqrt_features", rows), &split, |b, split| {
            b.iter(|| RandomForestRegressor::new(sqrt.clone()).fit(black_box(split)).unwrap())
        });
    }
    group.finish();
}

fn bench_predict(c: &mut Criterion) {
    let train = synthetic(2000, 8);
    let valid = synthetic(500, 8);
    let forest = RandomForestRegressor::new(ForestParams::default())
        .fit(&train)
        .unwrap();

    c.bench_function("forest_predict_batch_500", |b| {
        b.iter(|| forest.predict_batch(black_box(&valid.features)).unwrap())
    });

    let predictions = forest.predict_batch(&valid.features).unwrap();
    c.bench_function("rmse_500", |b| {
        b.iter(|| root_mean_squared_error(black_box(&valid.target), black_box(&predictions)).unwrap())
    });
}

criterion_group!(benches, bench_fit, bench_predict);
criterion_main!(benches);
