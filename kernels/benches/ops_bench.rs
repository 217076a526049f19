use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use syncbn_kernels::{cpu_channel_affine, cpu_channel_sum, cpu_channel_sum_sq};

fn benchmark_channel_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_reduce");
    let channels = [16, 64, 256];

    for &ch in &channels {
        let shape = [8, ch, 32, 32];
        let data = vec![1.0f32; shape.iter().product()];

        group.bench_function(format!("sum_8x{}x32x32", ch), |b| {
            b.iter(|| cpu_channel_sum(black_box(&data), black_box(&shape)).unwrap())
        });
        group.bench_function(format!("sum_sq_8x{}x32x32", ch), |b| {
            b.iter(|| cpu_channel_sum_sq(black_box(&data), black_box(&shape)).unwrap())
        });
    }
    group.finish();
}

fn benchmark_channel_affine(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_affine");
    let channels = [16, 64, 256];

    for &ch in &channels {
        let shape = [8, ch, 32, 32];
        let data = vec![1.0f32; shape.iter().product()];
        let scale = vec![0.5f32; ch];
        let shift = vec![0.1f32; ch];

        group.bench_function(format!("8x{}x32x32", ch), |b| {
            b.iter(|| {
                cpu_channel_affine(
                    black_box(&data),
                    black_box(&shape),
                    black_box(&scale),
                    black_box(&shift),
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_channel_reduce, benchmark_channel_affine);
criterion_main!(benches);
