//! Host-side BLAS
//!
//! The hybrid pipeline runs the host share of every split through a
//! [`HostBlas`] implementation, synchronously on the dispatching thread.
//! [`ReferenceBlas`] is the bundled implementation: a portable kernel that
//! spreads output columns over a rayon pool when the `rayon` feature is on.

pub mod kernel;

use crate::dtype::GemmScalar;
#[cfg(feature = "rayon")]
use crate::error::Error;
use crate::error::Result;
use crate::matrix::{MatMut, MatRef, Transpose};
#[cfg(feature = "rayon")]
use std::sync::Arc;

/// Synchronous host GEMM
///
/// `C = alpha*op(A)*op(B) + beta*C` with `m = c.rows()`, `n = c.cols()`.
/// Zero-sized views must be accepted as no-ops.
pub trait HostBlas: Send + Sync {
    /// Run one GEMM to completion on the calling thread
    fn gemm<T: GemmScalar>(
        &self,
        op_a: Transpose,
        op_b: Transpose,
        alpha: T,
        a: MatRef<'_, T>,
        b: MatRef<'_, T>,
        beta: T,
        c: MatMut<'_, T>,
    );

    /// Number of host threads a call may use
    fn threads(&self) -> usize;
}

/// Work below this many multiply-adds stays on the calling thread.
#[cfg(feature = "rayon")]
const PARALLEL_THRESHOLD: usize = 64 * 64 * 64;

/// Reference host BLAS
#[derive(Clone, Default)]
pub struct ReferenceBlas {
    #[cfg(feature = "rayon")]
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl std::fmt::Debug for ReferenceBlas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceBlas")
            .field("threads", &self.threads())
            .finish()
    }
}

impl ReferenceBlas {
    /// Use the global rayon pool (or the calling thread without `rayon`)
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a dedicated pool of `threads` workers.
    ///
    /// Without the `rayon` feature the count is ignored and work stays on
    /// the calling thread.
    pub fn with_threads(threads: usize) -> Result<Self> {
        #[cfg(feature = "rayon")]
        {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("hybridgemm-host-{i}"))
                .build()
                .map_err(|e| Error::config("host_threads", e.to_string()))?;
            Ok(Self {
                pool: Some(Arc::new(pool)),
            })
        }
        #[cfg(not(feature = "rayon"))]
        {
            let _ = threads;
            Ok(Self::default())
        }
    }

    #[cfg(feature = "rayon")]
    fn gemm_parallel<T: GemmScalar>(
        &self,
        op_a: Transpose,
        op_b: Transpose,
        alpha: T,
        a: MatRef<'_, T>,
        b: MatRef<'_, T>,
        beta: T,
        c: MatMut<'_, T>,
    ) {
        use rayon::prelude::*;

        let n = c.cols();
        let blocks = (self.threads() * 2).clamp(1, n);
        let width = n.div_ceil(blocks);

        // Carve C into disjoint column blocks; each block only reads the
        // matching columns of op(B).
        let mut parts = Vec::with_capacity(blocks);
        let mut rest = c;
        let mut j0 = 0;
        while rest.cols() > 0 {
            let w = width.min(rest.cols());
            let (head, tail) = rest.split_cols_at(w);
            parts.push((j0, head));
            j0 += w;
            rest = tail;
        }

        let run = || {
            parts.into_par_iter().for_each(|(j0, block)| {
                let w = block.cols();
                let b_block = kernel::op_cols(b, op_b, j0, w);
                kernel::gemm(op_a, op_b, alpha, a, b_block, beta, block);
            })
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}

impl HostBlas for ReferenceBlas {
    fn gemm<T: GemmScalar>(
        &self,
        op_a: Transpose,
        op_b: Transpose,
        alpha: T,
        a: MatRef<'_, T>,
        b: MatRef<'_, T>,
        beta: T,
        c: MatMut<'_, T>,
    ) {
        if c.is_empty() {
            return;
        }

        #[cfg(feature = "rayon")]
        {
            let k = if op_a.is_transposed() {
                a.rows()
            } else {
                a.cols()
            };
            let work = c.rows() * c.cols() * k.max(1);
            if work >= PARALLEL_THRESHOLD && c.cols() > 1 && self.threads() > 1 {
                self.gemm_parallel(op_a, op_b, alpha, a, b, beta, c);
                return;
            }
        }

        kernel::gemm(op_a, op_b, alpha, a, b, beta, c);
    }

    fn threads(&self) -> usize {
        #[cfg(feature = "rayon")]
        {
            match &self.pool {
                Some(pool) => pool.current_num_threads(),
                None => rayon::current_num_threads(),
            }
        }
        #[cfg(not(feature = "rayon"))]
        {
            1
        }
    }
}
