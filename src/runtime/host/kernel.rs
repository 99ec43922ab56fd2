//! Reference GEMM kernel
//!
//! Column-major `C = alpha*op(A)*op(B) + beta*C` over matrix views. This is
//! the kernel behind [`ReferenceBlas`](super::ReferenceBlas) and the
//! simulated device, so the host slice and the device slices of a hybrid run
//! are computed with identical arithmetic.

use crate::dtype::GemmScalar;
use crate::matrix::{MatMut, MatRef, Transpose};

/// Element `(row, col)` of `op(X)`
#[inline]
fn op_elem<T: GemmScalar>(x: &MatRef<'_, T>, op: Transpose, row: usize, col: usize) -> T {
    match op {
        Transpose::NoTrans => x.get(row, col),
        Transpose::Trans => x.get(col, row),
        Transpose::ConjTrans => x.get(col, row).conj(),
    }
}

/// Serial GEMM over views.
///
/// `m = c.rows()`, `n = c.cols()`, and `k` is the inner dimension of
/// `op(A)`. BLAS conventions apply:
/// - `m == 0 || n == 0`: nothing is touched
/// - `beta == 0`: the prior content of `C` is ignored (NaNs are not propagated)
/// - `k == 0 || alpha == 0`: `C = beta*C`
pub fn gemm<T: GemmScalar>(
    op_a: Transpose,
    op_b: Transpose,
    alpha: T,
    a: MatRef<'_, T>,
    b: MatRef<'_, T>,
    beta: T,
    mut c: MatMut<'_, T>,
) {
    let (m, n) = (c.rows(), c.cols());
    let k = if op_a.is_transposed() {
        a.rows()
    } else {
        a.cols()
    };
    if m == 0 || n == 0 {
        return;
    }
    debug_assert_eq!(op_a.stored_shape(m, k), (a.rows(), a.cols()));
    debug_assert_eq!(op_b.stored_shape(k, n), (b.rows(), b.cols()));

    let skip_product = k == 0 || alpha.is_zero();
    let mut b_col = Vec::with_capacity(k);

    for j in 0..n {
        let cj = c.col_mut(j);
        scale_col(cj, beta);
        if skip_product {
            continue;
        }

        b_col.clear();
        b_col.extend((0..k).map(|l| op_elem(&b, op_b, l, j)));

        match op_a {
            Transpose::NoTrans => {
                // axpy form: C[:, j] += (alpha * B[l, j]) * A[:, l]
                for (l, &blj) in b_col.iter().enumerate() {
                    let t = alpha * blj;
                    if t.is_zero() {
                        continue;
                    }
                    for (cij, &ail) in cj.iter_mut().zip(a.col(l)) {
                        *cij = *cij + t * ail;
                    }
                }
            }
            Transpose::Trans | Transpose::ConjTrans => {
                // dot form: column i of the stored A is row i of op(A)
                let conj = op_a == Transpose::ConjTrans;
                for (i, cij) in cj.iter_mut().enumerate() {
                    let mut sum = T::zero();
                    for (&ali, &blj) in a.col(i).iter().zip(&b_col) {
                        let ali = if conj { ali.conj() } else { ali };
                        sum = sum + ali * blj;
                    }
                    *cij = *cij + alpha * sum;
                }
            }
        }
    }
}

/// `x = beta*x`; a zero `beta` clears without reading
#[inline]
pub(crate) fn scale_col<T: GemmScalar>(x: &mut [T], beta: T) {
    if beta.is_zero() {
        x.fill(T::zero());
    } else if beta != T::one() {
        for v in x.iter_mut() {
            *v = beta * *v;
        }
    }
}

/// Columns `[j0, j0 + width)` of `op(B)` as a view of the stored operand
pub(crate) fn op_cols<'a, T>(
    b: MatRef<'a, T>,
    op_b: Transpose,
    j0: usize,
    width: usize,
) -> MatRef<'a, T> {
    if op_b.is_transposed() {
        b.submatrix(j0, 0, width, b.cols())
    } else {
        b.submatrix(0, j0, b.rows(), width)
    }
}

/// Rows `[i0, i0 + height)` of `op(A)` as a view of the stored operand
pub(crate) fn op_rows<'a, T>(
    a: MatRef<'a, T>,
    op_a: Transpose,
    i0: usize,
    height: usize,
) -> MatRef<'a, T> {
    if op_a.is_transposed() {
        a.submatrix(0, i0, a.rows(), height)
    } else {
        a.submatrix(i0, 0, height, a.cols())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::Complex128;

    /// Naive triple loop over explicit op() for cross-checking
    fn naive<T: GemmScalar>(
        op_a: Transpose,
        op_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: T,
        a: MatRef<'_, T>,
        b: MatRef<'_, T>,
        beta: T,
        c: &mut [T],
        ldc: usize,
    ) {
        for j in 0..n {
            for i in 0..m {
                let mut sum = T::zero();
                for l in 0..k {
                    sum = sum + op_elem(&a, op_a, i, l) * op_elem(&b, op_b, l, j);
                }
                c[j * ldc + i] = alpha * sum + beta * c[j * ldc + i];
            }
        }
    }

    fn fill(len: usize, seed: u64) -> Vec<f64> {
        (0..len)
            .map(|i| (((i as u64 * 2654435761 + seed) % 1000) as f64) / 250.0 - 2.0)
            .collect()
    }

    #[test]
    fn test_all_transpose_combinations_real() {
        let (m, n, k) = (5, 4, 3);
        let ops = [Transpose::NoTrans, Transpose::Trans, Transpose::ConjTrans];
        for &op_a in &ops {
            for &op_b in &ops {
                let (ar, ac) = op_a.stored_shape(m, k);
                let (br, bc) = op_b.stored_shape(k, n);
                let a_data = fill(ar * ac, 1);
                let b_data = fill(br * bc, 2);
                let a = MatRef::from_slice(&a_data, ar, ac, ar).unwrap();
                let b = MatRef::from_slice(&b_data, br, bc, br).unwrap();

                let mut expected = fill(m * n, 3);
                let mut got = expected.clone();
                naive(op_a, op_b, m, n, k, 1.5, a, b, -0.5, &mut expected, m);
                gemm(
                    op_a,
                    op_b,
                    1.5,
                    a,
                    b,
                    -0.5,
                    MatMut::from_slice_mut(&mut got, m, n, m).unwrap(),
                );
                for (x, y) in got.iter().zip(&expected) {
                    assert!((x - y).abs() < 1e-12, "{op_a:?}/{op_b:?}: {x} vs {y}");
                }
            }
        }
    }

    #[test]
    fn test_conj_trans_complex() {
        let (m, n, k) = (2, 2, 2);
        let a_data = vec![
            Complex128::new(1.0, 1.0),
            Complex128::new(0.0, 2.0),
            Complex128::new(3.0, -1.0),
            Complex128::new(1.0, 0.0),
        ];
        let b_data = vec![
            Complex128::new(1.0, 0.0),
            Complex128::new(0.0, 1.0),
            Complex128::new(2.0, 0.0),
            Complex128::new(1.0, -1.0),
        ];
        let a = MatRef::from_slice(&a_data, k, m, k).unwrap();
        let b = MatRef::from_slice(&b_data, k, n, k).unwrap();
        let mut expected = vec![Complex128::ZERO; 4];
        let mut got = expected.clone();
        naive(
            Transpose::ConjTrans,
            Transpose::NoTrans,
            m,
            n,
            k,
            Complex128::ONE,
            a,
            b,
            Complex128::ZERO,
            &mut expected,
            m,
        );
        gemm(
            Transpose::ConjTrans,
            Transpose::NoTrans,
            Complex128::ONE,
            a,
            b,
            Complex128::ZERO,
            MatMut::from_slice_mut(&mut got, m, n, m).unwrap(),
        );
        assert_eq!(got, expected);
        // conj(1+i)*1 + conj(2i)*i = (1-i) + 2 = 3 - i
        assert_eq!(got[0], Complex128::new(3.0, -1.0));
    }

    #[test]
    fn test_beta_zero_ignores_nan() {
        let a = [1.0f32; 4];
        let b = [1.0f32; 4];
        let mut c = [f32::NAN; 4];
        gemm(
            Transpose::NoTrans,
            Transpose::NoTrans,
            1.0,
            MatRef::from_slice(&a, 2, 2, 2).unwrap(),
            MatRef::from_slice(&b, 2, 2, 2).unwrap(),
            0.0,
            MatMut::from_slice_mut(&mut c, 2, 2, 2).unwrap(),
        );
        assert_eq!(c, [2.0; 4]);
    }

    #[test]
    fn test_k_zero_scales_by_beta() {
        let a: [f64; 0] = [];
        let mut c = [1.0, 2.0, 3.0, 4.0];
        gemm(
            Transpose::NoTrans,
            Transpose::NoTrans,
            1.0,
            MatRef::from_slice(&a, 2, 0, 2).unwrap(),
            MatRef::from_slice(&a, 0, 2, 1).unwrap(),
            3.0,
            MatMut::from_slice_mut(&mut c, 2, 2, 2).unwrap(),
        );
        assert_eq!(c, [3.0, 6.0, 9.0, 12.0]);
    }

    #[test]
    fn test_op_views() {
        let data: Vec<f64> = (0..12).map(|x| x as f64).collect();
        // stored 3x4, op = Trans gives a 4x3 operand
        let x = MatRef::from_slice(&data, 3, 4, 3).unwrap();
        let rows = op_rows(x, Transpose::Trans, 1, 2);
        assert_eq!((rows.rows(), rows.cols()), (3, 2));
        assert_eq!(rows.get(0, 0), x.get(0, 1));
        let cols = op_cols(x, Transpose::NoTrans, 2, 2);
        assert_eq!(cols.get(2, 1), x.get(2, 3));
    }
}
