use criterion::{criterion_group, criterion_main, Criterion};
use lora_router::lora::{LoraConfig, Linear, RoutedLinear, RoutingMode};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn layer(routing: RoutingMode) -> RoutedLinear {
    let mut rng = StdRng::seed_from_u64(7);
    let config = LoraConfig { r: 8, routing, ..LoraConfig::default() };
    RoutedLinear::new(Linear::random(256, 256, false, &mut rng), &config).unwrap()
}

fn bench_router(c: &mut Criterion) {
    let x = DMatrix::new_random(16, 256);

    for routing in [RoutingMode::Off, RoutingMode::Router, RoutingMode::Mixer] {
        let mut l = layer(routing);
        c.bench_function(&format!("forward_16x256_r8_{}", routing), |b| {
            b.iter(|| l.forward(&x).unwrap())
        });
    }

    let l = layer(RoutingMode::Mixer);
    c.bench_function("routing_weights_16x256_r8_mixer", |b| {
        b.iter(|| l.routing_weights(&x).unwrap())
    });
}

criterion_group!(benches, bench_router);
criterion_main!(benches);
