//! Benchmark for device buffer lifetimes and the vector addition pipeline.
//!
//! Runs against the host runtime, so it measures the handle and gate overhead
//! rather than device throughput.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cuda_computation::{launch_vector_add, vector_add_gpu_with_ctx, CudaContext, DeviceBuffer};

/// Benchmark allocate-then-release of a single buffer
fn bench_alloc_release(c: &mut Criterion) {
    let (_host, ctx) = CudaContext::host(1 << 28).unwrap();

    let mut group = c.benchmark_group("DeviceBuffer_AllocRelease");

    for len in [1usize, 1024, 1 << 20].iter() {
        let len = *len;
        group.throughput(Throughput::Bytes((len * std::mem::size_of::<f32>()) as u64));
        group.bench_with_input(BenchmarkId::new("f32", len), &len, |bench, &len| {
            bench.iter(|| {
                let buffer: DeviceBuffer<f32> = ctx.alloc(black_box(len)).unwrap();
                black_box(buffer.device_ptr())
            })
        });
    }

    group.finish();
}

/// Benchmark upload, add and download with buffers allocated per call
fn bench_vector_add(c: &mut Criterion) {
    let (_host, ctx) = CudaContext::host(1 << 28).unwrap();

    let mut group = c.benchmark_group("VectorAdd");

    for len in [256usize, 4096, 65536].iter() {
        let n = *len;
        let a: Vec<f32> = (0..n).map(|i| ((i % 1000) as f32) * 0.01).collect();
        let b: Vec<f32> = (0..n).map(|i| (((i + 500) % 1000) as f32) * 0.01).collect();

        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("one_shot", n), &n, |bench, _| {
            bench.iter(|| {
                let a_gpu = ctx.upload(&a).unwrap();
                let b_gpu = ctx.upload(&b).unwrap();
                let c_gpu = vector_add_gpu_with_ctx(&ctx, &a_gpu, &b_gpu).unwrap();
                black_box(c_gpu.to_host().unwrap())
            })
        });

        // Operands stay resident (outside benchmark)
        let a_gpu = ctx.upload(&a).unwrap();
        let b_gpu = ctx.upload(&b).unwrap();
        let mut c_gpu = ctx.alloc::<f32>(n).unwrap();

        group.bench_with_input(BenchmarkId::new("resident", n), &n, |bench, _| {
            bench.iter(|| launch_vector_add(&ctx, &a_gpu, &b_gpu, &mut c_gpu).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_alloc_release, bench_vector_add);
criterion_main!(benches);
