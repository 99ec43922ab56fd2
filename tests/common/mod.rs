//! Common test utilities
#![allow(dead_code)]

use hybridgemm::prelude::*;
use hybridgemm::runtime::sim::SimRuntime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const MIB: usize = 1 << 20;

/// Simulated devices with `memory` bytes each
pub fn sim(devices: usize, memory: usize) -> SimRuntime {
    SimRuntime::new(devices, memory)
}

/// Context over simulated devices; the returned runtime handle shares state
/// with the one owned by the context.
pub fn sim_context(devices: usize, config: Config) -> (HybridGemm<SimRuntime>, SimRuntime) {
    let rt = sim(devices, 64 * MIB);
    let ctx = HybridGemm::with_config(rt.clone(), config).unwrap();
    (ctx, rt)
}

/// Thresholds low enough for small test problems to use the devices
pub fn small_problem_config() -> Config {
    Config::default().with_thresholds(16, 4096)
}

/// Deterministic random values in [-1, 1)
pub fn random_vec<T: GemmScalar>(len: usize, seed: u64) -> Vec<T> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| {
            let re = rng.random_range(-1.0..1.0);
            let im = rng.random_range(-1.0..1.0);
            T::from_parts(re, im)
        })
        .collect()
}

/// Straightforward triple loop, column-major
pub fn reference_gemm<T: GemmScalar>(
    op_a: Transpose,
    op_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: T,
    a: &[T],
    lda: usize,
    b: &[T],
    ldb: usize,
    beta: T,
    c: &mut [T],
    ldc: usize,
) {
    let at = |i: usize, l: usize| match op_a {
        Transpose::NoTrans => a[l * lda + i],
        Transpose::Trans => a[i * lda + l],
        Transpose::ConjTrans => a[i * lda + l].conj(),
    };
    let bt = |l: usize, j: usize| match op_b {
        Transpose::NoTrans => b[j * ldb + l],
        Transpose::Trans => b[l * ldb + j],
        Transpose::ConjTrans => b[l * ldb + j].conj(),
    };
    for j in 0..n {
        for i in 0..m {
            let mut sum = T::zero();
            for l in 0..k {
                sum = sum + at(i, l) * bt(l, j);
            }
            let prior = if beta.is_zero() {
                T::zero()
            } else {
                beta * c[j * ldc + i]
            };
            c[j * ldc + i] = alpha * sum + prior;
        }
    }
}

/// Assert two slices are close: |a - b| <= atol + rtol * |b|
pub fn assert_allclose<T: GemmScalar>(a: &[T], b: &[T], rtol: f64, atol: f64, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (&x, &y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).magnitude();
        let tol = atol + rtol * y.magnitude();
        assert!(
            diff <= tol,
            "{}: element {} differs: {:?} vs {:?} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

/// Tolerances suited to the precision of `T`
pub fn tolerance<T: GemmScalar>() -> (f64, f64) {
    match T::KIND {
        GemmKind::Single | GemmKind::ComplexSingle => (1e-4, 1e-4),
        GemmKind::Double | GemmKind::ComplexDouble => (1e-10, 1e-10),
    }
}

/// One GEMM problem with padded leading dimensions
pub struct Problem<T> {
    pub op_a: Transpose,
    pub op_b: Transpose,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: T,
    pub beta: T,
    pub a: Vec<T>,
    pub lda: usize,
    pub b: Vec<T>,
    pub ldb: usize,
    pub c: Vec<T>,
    pub ldc: usize,
}

impl<T: GemmScalar> Problem<T> {
    /// Random operands; every leading dimension is padded by `pad`
    pub fn new(
        op_a: Transpose,
        op_b: Transpose,
        (m, n, k): (usize, usize, usize),
        pad: usize,
        seed: u64,
    ) -> Self {
        let (a_rows, a_cols) = op_a.stored_shape(m, k);
        let (b_rows, b_cols) = op_b.stored_shape(k, n);
        let (lda, ldb, ldc) = (a_rows.max(1) + pad, b_rows.max(1) + pad, m.max(1) + pad);
        Self {
            op_a,
            op_b,
            m,
            n,
            k,
            alpha: T::from_parts(0.75, 0.25),
            beta: T::from_parts(-0.5, 0.5),
            a: random_vec(lda * a_cols, seed),
            lda,
            b: random_vec(ldb * b_cols, seed + 1),
            ldb,
            c: random_vec(ldc * n, seed + 2),
            ldc,
        }
    }

    pub fn with_beta(mut self, beta: T) -> Self {
        self.beta = beta;
        self
    }

    /// Expected C from the reference loop
    pub fn expected(&self) -> Vec<T> {
        let mut c = self.c.clone();
        reference_gemm(
            self.op_a, self.op_b, self.m, self.n, self.k, self.alpha, &self.a, self.lda,
            &self.b, self.ldb, self.beta, &mut c, self.ldc,
        );
        c
    }

    /// Run through `ctx`, returning the report and the computed C
    #[track_caller]
    pub fn run<R: DeviceRuntime>(&self, ctx: &HybridGemm<R>) -> (GemmReport, Vec<T>) {
        let mut c = self.c.clone();
        let report = ctx
            .gemm(
                self.op_a, self.op_b, self.m, self.n, self.k, self.alpha, &self.a, self.lda,
                &self.b, self.ldb, self.beta, &mut c, self.ldc,
            )
            .unwrap();
        (report, c)
    }

    /// Run through `ctx` and compare with the reference
    #[track_caller]
    pub fn check<R: DeviceRuntime>(&self, ctx: &HybridGemm<R>, msg: &str) -> GemmReport {
        let (report, c) = self.run(ctx);
        let (rtol, atol) = tolerance::<T>();
        assert_allclose(&c, &self.expected(), rtol, atol, msg);
        report
    }
}
