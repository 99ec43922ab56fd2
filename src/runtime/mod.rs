//! Runtime backends for hybrid GEMM execution
//!
//! This module defines the two narrow interfaces the dispatcher consumes:
//!
//! ```text
//! DeviceRuntime (accelerator side)
//! ├── device discovery and memory info
//! ├── scratch allocation
//! ├── streams (one per slot) and timing events
//! ├── async 2D host<->device copies
//! └── async device GEMM
//!
//! HostBlas (host side)
//! └── synchronous GEMM on the calling thread
//! ```
//!
//! Backends:
//!
//! - [`sim::SimRuntime`]: host-memory simulated devices with deferred streams
//! - `cuda::CudaRuntime` (feature `cuda`): cudarc driver + cuBLAS
//! - [`host::ReferenceBlas`]: column-parallel reference host kernel

pub mod host;
pub mod sim;

#[cfg(feature = "cuda")]
pub mod cuda;

use crate::dtype::GemmScalar;
use crate::error::Result;
use crate::matrix::{MatMut, MatRef, Transpose};

pub use host::{HostBlas, ReferenceBlas};

/// Device address. Offsets are applied in bytes.
pub type DevicePtr = u64;

/// Accelerator runtime consumed by the registry and the hybrid pipeline
///
/// A runtime value owns whatever driver state it needs; the dispatcher only
/// passes device indices, device addresses and stream/event handles back to
/// it. All `*_async` operations are ordered on the given stream and may
/// complete at any point before [`DeviceRuntime::synchronize`] returns for
/// that stream.
pub trait DeviceRuntime: Send + Sync + 'static {
    /// Ordered work queue on one device
    type Stream: Send + Sync;

    /// Timestamp recorded on a stream
    type Event: Send;

    /// Human-readable name of this runtime
    fn name(&self) -> &'static str;

    /// Number of devices visible to this process
    fn device_count(&self) -> Result<usize>;

    /// `(free_bytes, total_bytes)` of a device
    fn memory_info(&self, device: usize) -> Result<(usize, usize)>;

    /// Make `device` current for the calling thread
    fn bind_device(&self, device: usize) -> Result<()>;

    /// Allocate `size_bytes` of device memory
    fn allocate(&self, device: usize, size_bytes: usize) -> Result<DevicePtr>;

    /// Release memory returned by [`DeviceRuntime::allocate`]
    fn deallocate(&self, device: usize, ptr: DevicePtr, size_bytes: usize);

    /// Create a stream on `device`
    fn create_stream(&self, device: usize) -> Result<Self::Stream>;

    /// Destroy a stream
    fn destroy_stream(&self, stream: Self::Stream);

    /// Device a stream belongs to
    fn stream_device(&self, stream: &Self::Stream) -> usize;

    /// Queue a copy of the host matrix `src` into device memory at `dst`
    /// (column-major, leading dimension `ld_dst` in elements).
    ///
    /// # Safety
    ///
    /// The memory behind `src` must stay valid and unmodified until `stream`
    /// has been synchronized. `dst` must address at least
    /// `required_len(src.rows(), src.cols(), ld_dst)` elements of device memory.
    unsafe fn copy_to_device_async<T: GemmScalar>(
        &self,
        stream: &Self::Stream,
        src: MatRef<'_, T>,
        dst: DevicePtr,
        ld_dst: usize,
    ) -> Result<()>;

    /// Queue a copy of device memory at `src` into the host matrix `dst`.
    ///
    /// # Safety
    ///
    /// The memory behind `dst` must stay valid, and must not be read or
    /// written by the host, until `stream` has been synchronized.
    unsafe fn copy_from_device_async<T: GemmScalar>(
        &self,
        stream: &Self::Stream,
        src: DevicePtr,
        ld_src: usize,
        dst: MatMut<'_, T>,
    ) -> Result<()>;

    /// Queue `C = alpha*op(A)*op(B) + beta*C` on device-resident operands.
    ///
    /// # Safety
    ///
    /// `a`, `b` and `c` must address device matrices of the implied shapes
    /// with the given leading dimensions.
    unsafe fn gemm_async<T: GemmScalar>(
        &self,
        stream: &Self::Stream,
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
    ) -> Result<()>;

    /// Record a timing event on `stream`
    fn record_event(&self, stream: &Self::Stream) -> Result<Self::Event>;

    /// Seconds between two completed events
    fn elapsed_seconds(&self, start: &Self::Event, end: &Self::Event) -> Result<f64>;

    /// Block until all work queued on `stream` has completed
    fn synchronize(&self, stream: &Self::Stream) -> Result<()>;
}
