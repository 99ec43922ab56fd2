#![allow(dead_code)]

use fluxbench::{Bencher, flux};
use std::hint::black_box;

use hybridgemm::prelude::*;
use hybridgemm::runtime::sim::SimRuntime;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn rand_vec_f64(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| ((i * 17 + 3) % 1000) as f64 / 1000.0)
        .collect()
}

fn context(config: Config) -> HybridGemm<SimRuntime> {
    let ctx = HybridGemm::with_config(SimRuntime::new(1, 512 << 20), config).unwrap();
    ctx.initialize(&InitOptions::new([0])).unwrap();
    ctx
}

fn square(b: &mut Bencher, ctx: &HybridGemm<SimRuntime>, size: usize) {
    let a = rand_vec_f64(size * size);
    let bm = rand_vec_f64(size * size);
    let mut c = vec![0.0f64; size * size];
    b.iter(|| {
        black_box(
            ctx.dgemm(
                Transpose::NoTrans,
                Transpose::NoTrans,
                size,
                size,
                size,
                1.0,
                &a,
                size,
                &bm,
                size,
                0.0,
                &mut c,
                size,
            )
            .unwrap(),
        )
    });
}

// ---------------------------------------------------------------------------
// Host only vs hybrid split
// ---------------------------------------------------------------------------

#[flux::bench(group = "dgemm_square", args = [128, 256, 512])]
fn host_only(b: &mut Bencher, size: usize) {
    let ctx = context(Config::default().with_mode(ExecutionMode::CpuOnly));
    square(b, &ctx, size);
}

#[flux::bench(group = "dgemm_square", args = [128, 256, 512])]
fn hybrid_half(b: &mut Bencher, size: usize) {
    let config = Config::default()
        .with_thresholds(64, 4096)
        .with_split(GemmKind::Double, 0.5);
    square(b, &context(config), size);
}

#[flux::bench(group = "dgemm_square", args = [256, 512])]
fn hybrid_self_tuned(b: &mut Bencher, size: usize) {
    let config = Config::default()
        .with_thresholds(64, 4096)
        .with_self_tune(true);
    square(b, &context(config), size);
}

// ---------------------------------------------------------------------------
// Capacity partitioning
// ---------------------------------------------------------------------------

#[flux::bench(group = "dgemm_partitioned", args = [256, 512])]
fn bisected_scratch(b: &mut Bencher, size: usize) {
    let ctx = context(Config::default().with_thresholds(64, 4096));
    // room for roughly a quarter of the operands
    ctx.set_scratch_capacity(0, size * size * 8).unwrap();
    square(b, &ctx, size);
}

// ---------------------------------------------------------------------------
// K-split
// ---------------------------------------------------------------------------

#[flux::bench(group = "dgemm_long_k", args = [2048, 8192])]
fn special_k(b: &mut Bencher, k: usize) {
    let config = Config::default()
        .with_thresholds(64, 1024)
        .with_special_k(true)
        .with_special_k_block(512);
    let ctx = context(config);
    let m = 128;
    let a = rand_vec_f64(m * k);
    let bm = rand_vec_f64(k * m);
    let mut c = vec![0.0f64; m * m];
    b.iter(|| {
        black_box(
            ctx.dgemm(
                Transpose::NoTrans,
                Transpose::NoTrans,
                m,
                m,
                k,
                1.0,
                &a,
                m,
                &bm,
                k,
                0.0,
                &mut c,
                m,
            )
            .unwrap(),
        )
    });
}

fn main() {
    fluxbench::run().unwrap();
}
