use allotment::{
    assign, estimate_win_probabilities, BetaBernoulli, Direction, Engine, EngineConfig, Outcome,
    PosteriorParams, ResponseSubmission,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::hint::black_box;

fn bench_estimate(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate_win_probabilities");
    group.sample_size(20);
    for &k in &[2usize, 4, 8] {
        // Slightly separated posteriors so every arm wins some columns.
        let posteriors: Vec<PosteriorParams> = (0..k)
            .map(|i| PosteriorParams::new(10.0 + i as f64, 12.0))
            .collect();
        for &n_sim in &[10_000usize, 100_000] {
            group.bench_with_input(
                BenchmarkId::new(format!("k{k}"), n_sim),
                &n_sim,
                |b, &n_sim| {
                    let mut rng = StdRng::seed_from_u64(7);
                    b.iter(|| {
                        let pi = estimate_win_probabilities(
                            &BetaBernoulli,
                            black_box(&posteriors),
                            Direction::Max,
                            n_sim,
                            &mut rng,
                        )
                        .unwrap();
                        black_box(pi);
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_assign(c: &mut Criterion) {
    let cumulative: Vec<f64> = (1..=8).map(|i| i as f64 / 8.0).collect();
    c.bench_function("assign/k8", |b| {
        let mut draw = 0.0f64;
        b.iter(|| {
            // Golden-ratio stride walks [0, 1) evenly.
            draw = (draw + 0.618_033_988_75) % 1.0;
            black_box(assign(black_box(&cumulative), draw).unwrap());
        })
    });
}

fn bench_record(c: &mut Criterion) {
    c.bench_function("engine/assign_record", |b| {
        let engine = Engine::in_memory(EngineConfig {
            n_sim: 10_000,
            batch_capacity: 50,
            assignment_seed: Some(1),
            ..EngineConfig::default()
        })
        .unwrap();
        engine
            .initialize(&["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let a = engine.assign_current().unwrap();
            let r = engine
                .record_response(ResponseSubmission::for_assignment(&a, Outcome::from(i % 3 == 0)))
                .unwrap();
            black_box(r);
        })
    });
}

criterion_group!(benches, bench_estimate, bench_assign, bench_record);
criterion_main!(benches);
