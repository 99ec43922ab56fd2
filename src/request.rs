//! One GEMM call over borrowed views

use crate::dtype::{GemmKind, GemmScalar};
use crate::error::{Error, Result};
use crate::matrix::{MatMut, MatRef, Transpose};
use crate::runtime::host::kernel::{op_cols, op_rows};
use crate::strategy::SplitAxis;

/// `C = alpha*op(A)*op(B) + beta*C` over views
///
/// `m = c.rows()`, `n = c.cols()`, and `k` is the inner dimension of
/// `op(A)`. Splitting a request consumes it, so the output regions of the
/// two halves can never overlap.
#[derive(Debug)]
pub struct GemmRequest<'a, T> {
    /// Operation on A
    pub op_a: Transpose,
    /// Operation on B
    pub op_b: Transpose,
    /// Scale of the product
    pub alpha: T,
    /// Scale of the prior C
    pub beta: T,
    /// Stored A
    pub a: MatRef<'a, T>,
    /// Stored B
    pub b: MatRef<'a, T>,
    /// Output
    pub c: MatMut<'a, T>,
}

impl<'a, T: GemmScalar> GemmRequest<'a, T> {
    /// Build a request, checking that the operand shapes agree
    pub fn new(
        op_a: Transpose,
        op_b: Transpose,
        alpha: T,
        a: MatRef<'a, T>,
        b: MatRef<'a, T>,
        beta: T,
        c: MatMut<'a, T>,
    ) -> Result<Self> {
        let (m, n) = (c.rows(), c.cols());
        let k = if op_a.is_transposed() {
            a.rows()
        } else {
            a.cols()
        };
        if op_a.stored_shape(m, k) != (a.rows(), a.cols()) {
            return Err(Error::invalid_argument(
                "a",
                format!(
                    "op(A) must be {m}x{k}, stored A is {}x{}",
                    a.rows(),
                    a.cols()
                ),
            ));
        }
        if op_b.stored_shape(k, n) != (b.rows(), b.cols()) {
            return Err(Error::invalid_argument(
                "b",
                format!(
                    "op(B) must be {k}x{n}, stored B is {}x{}",
                    b.rows(),
                    b.cols()
                ),
            ));
        }
        Ok(Self {
            op_a,
            op_b,
            alpha,
            beta,
            a,
            b,
            c,
        })
    }

    /// Rows of C
    #[inline]
    pub fn m(&self) -> usize {
        self.c.rows()
    }

    /// Columns of C
    #[inline]
    pub fn n(&self) -> usize {
        self.c.cols()
    }

    /// Inner dimension
    #[inline]
    pub fn k(&self) -> usize {
        if self.op_a.is_transposed() {
            self.a.rows()
        } else {
            self.a.cols()
        }
    }

    /// Element kind
    #[inline]
    pub fn kind(&self) -> GemmKind {
        T::KIND
    }

    /// Split along `axis` at `at`: the first request covers rows (or
    /// columns) `[0, at)` of C, the second the rest.
    pub fn split(self, axis: SplitAxis, at: usize) -> (Self, Self) {
        let Self {
            op_a,
            op_b,
            alpha,
            beta,
            a,
            b,
            c,
        } = self;
        let ((a1, a2), (b1, b2), (c1, c2)) = match axis {
            SplitAxis::A => {
                let rest = c.rows() - at;
                (
                    (op_rows(a, op_a, 0, at), op_rows(a, op_a, at, rest)),
                    (b, b),
                    c.split_rows_at(at),
                )
            }
            SplitAxis::B => {
                let rest = c.cols() - at;
                (
                    (a, a),
                    (op_cols(b, op_b, 0, at), op_cols(b, op_b, at, rest)),
                    c.split_cols_at(at),
                )
            }
        };
        let half = |a, b, c| Self {
            op_a,
            op_b,
            alpha,
            beta,
            a,
            b,
            c,
        };
        (half(a1, b1, c1), half(a2, b2, c2))
    }
}
