// Benchmark suite for the Hablar quantized kernels
// Uses Criterion.rs for statistical benchmarking

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hablar::quantize::{
    dequantize_q4_0, dot_f32, fused_q4_0_dot, matvec_q4_0_into, softmax, BLOCK_SIZE,
    Q4_0_BLOCK_BYTES,
};

/// Deterministic Q4_0 row data: fixed scale, LCG nibbles
fn q4_0_row(cols: usize) -> Vec<u8> {
    let blocks = cols / BLOCK_SIZE;
    let scale = half::f16::from_f32(0.05).to_le_bytes();
    let mut out = Vec::with_capacity(blocks * Q4_0_BLOCK_BYTES);
    let mut s = 0x1357_9BDF_u32;
    for _ in 0..blocks {
        out.extend_from_slice(&scale);
        for _ in 0..16 {
            s = s.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            out.push((s >> 24) as u8);
        }
    }
    out
}

fn activations(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i * 37) % 100) as f32 * 0.01 - 0.5).collect()
}

fn benchmark_fused_dot(c: &mut Criterion) {
    let mut group = c.benchmark_group("fused_q4_0_dot");

    for cols in [256usize, 1024, 4096] {
        let row = q4_0_row(cols);
        let x = activations(cols);
        group.bench_with_input(BenchmarkId::from_parameter(cols), &cols, |b, _| {
            b.iter(|| black_box(fused_q4_0_dot(black_box(&row), black_box(&x))));
        });
    }

    group.finish();
}

fn benchmark_fused_vs_dequantize(c: &mut Criterion) {
    let cols = 1024usize;
    let row = q4_0_row(cols);
    let x = activations(cols);

    let mut group = c.benchmark_group("q4_0_dot_strategies");
    group.bench_function("fused", |b| {
        b.iter(|| black_box(fused_q4_0_dot(black_box(&row), black_box(&x))));
    });
    group.bench_function("dequantize_then_dot", |b| {
        b.iter(|| {
            let w = dequantize_q4_0(black_box(&row)).expect("valid row");
            black_box(dot_f32(&w, black_box(&x)))
        });
    });
    group.finish();
}

fn benchmark_matvec(c: &mut Criterion) {
    let mut group = c.benchmark_group("matvec_q4_0");
    group.sample_size(20);

    for (rows, cols) in [(64usize, 256usize), (512, 1024)] {
        let weight = q4_0_row(rows * cols);
        let x = activations(cols);
        let mut out = vec![0.0f32; rows];
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{rows}x{cols}")),
            &rows,
            |b, _| {
                b.iter(|| {
                    matvec_q4_0_into(black_box(&weight), black_box(&x), cols, &mut out)
                        .expect("valid matvec");
                    black_box(out[0])
                });
            },
        );
    }

    group.finish();
}

fn benchmark_softmax(c: &mut Criterion) {
    let mut group = c.benchmark_group("softmax");

    for len in [64usize, 2048, 32_768] {
        let base = activations(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter_batched(
                || base.clone(),
                |mut scores| {
                    softmax(&mut scores);
                    black_box(scores)
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_fused_dot,
    benchmark_fused_vs_dequantize,
    benchmark_matvec,
    benchmark_softmax
);
criterion_main!(benches);
