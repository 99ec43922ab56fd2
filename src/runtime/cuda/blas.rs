//! cuBLAS GEMM dispatch by element kind

use cudarc::cublas::sys::{
    cuComplex, cuDoubleComplex, cublasCgemm_v2, cublasDgemm_v2, cublasHandle_t,
    cublasOperation_t, cublasSgemm_v2, cublasStatus_t, cublasZgemm_v2,
};

use crate::dtype::{GemmKind, GemmScalar};
use crate::error::{Error, Result};
use crate::matrix::Transpose;
use crate::runtime::DevicePtr;

fn operation(op: Transpose) -> cublasOperation_t {
    match op {
        Transpose::NoTrans => cublasOperation_t::CUBLAS_OP_N,
        Transpose::Trans => cublasOperation_t::CUBLAS_OP_T,
        Transpose::ConjTrans => cublasOperation_t::CUBLAS_OP_C,
    }
}

fn dim(device: usize, name: &'static str, value: usize) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::device(device, "device gemm", format!("{name}={value} exceeds i32")))
}

/// Issue `{S,D,C,Z}gemm` on the stream bound to `handle`.
///
/// # Safety
///
/// `handle` must be a live cuBLAS handle whose context is current, and the
/// device pointers must address matrices of the implied shapes.
pub(super) unsafe fn gemm<T: GemmScalar>(
    handle: cublasHandle_t,
    device: usize,
    op_a: Transpose,
    op_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: T,
    a: DevicePtr,
    lda: usize,
    b: DevicePtr,
    ldb: usize,
    beta: T,
    c: DevicePtr,
    ldc: usize,
) -> Result<()> {
    let (ta, tb) = (operation(op_a), operation(op_b));
    let (m, n, k) = (dim(device, "m", m)?, dim(device, "n", n)?, dim(device, "k", k)?);
    let (lda, ldb, ldc) = (
        dim(device, "lda", lda)?,
        dim(device, "ldb", ldb)?,
        dim(device, "ldc", ldc)?,
    );
    let alpha = &alpha as *const T;
    let beta = &beta as *const T;

    // SAFETY: T::KIND fixes the layout of T, so the pointer casts below
    // reinterpret values of identical size and representation.
    let status = unsafe {
        match T::KIND {
            GemmKind::Single => cublasSgemm_v2(
                handle,
                ta,
                tb,
                m,
                n,
                k,
                alpha.cast::<f32>(),
                a as *const f32,
                lda,
                b as *const f32,
                ldb,
                beta.cast::<f32>(),
                c as *mut f32,
                ldc,
            ),
            GemmKind::Double => cublasDgemm_v2(
                handle,
                ta,
                tb,
                m,
                n,
                k,
                alpha.cast::<f64>(),
                a as *const f64,
                lda,
                b as *const f64,
                ldb,
                beta.cast::<f64>(),
                c as *mut f64,
                ldc,
            ),
            GemmKind::ComplexSingle => cublasCgemm_v2(
                handle,
                ta,
                tb,
                m,
                n,
                k,
                alpha.cast::<cuComplex>(),
                a as *const cuComplex,
                lda,
                b as *const cuComplex,
                ldb,
                beta.cast::<cuComplex>(),
                c as *mut cuComplex,
                ldc,
            ),
            GemmKind::ComplexDouble => cublasZgemm_v2(
                handle,
                ta,
                tb,
                m,
                n,
                k,
                alpha.cast::<cuDoubleComplex>(),
                a as *const cuDoubleComplex,
                lda,
                b as *const cuDoubleComplex,
                ldb,
                beta.cast::<cuDoubleComplex>(),
                c as *mut cuDoubleComplex,
                ldc,
            ),
        }
    };

    if status != cublasStatus_t::CUBLAS_STATUS_SUCCESS {
        return Err(Error::device(
            device,
            "device gemm",
            format!("cuBLAS {}gemm failed: {status:?}", T::KIND.letter()),
        ));
    }
    Ok(())
}
