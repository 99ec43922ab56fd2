//! CUDA runtime implementation
//!
//! Drives NVIDIA devices through cudarc: one driver context per device,
//! created on first use and cached by the runtime, plus one stream and one
//! cuBLAS handle per dispatcher slot.
//!
//! # Thread Safety
//!
//! Driver calls that depend on the current context (memory info,
//! allocation, stream creation) bind the device's context to the calling
//! thread first, so a `CudaRuntime` can be driven from any thread.

mod blas;

use cudarc::cublas::CudaBlas;
use cudarc::driver::safe::{CudaContext, CudaStream};
use cudarc::driver::{result, sys};
use parking_lot::Mutex;
use std::sync::Arc;

use super::{DevicePtr, DeviceRuntime};
use crate::dtype::GemmScalar;
use crate::error::{Error, Result};
use crate::matrix::{MatMut, MatRef, Transpose};

// ============================================================================
// Internal Helpers
// ============================================================================

#[inline]
fn check(device: usize, operation: &'static str, result: sys::CUresult) -> Result<()> {
    if result == sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(Error::device(device, operation, format!("{result:?}")))
    }
}

#[inline]
fn driver_err(device: usize, operation: &'static str) -> impl Fn(result::DriverError) -> Error {
    move |e| Error::device(device, operation, format!("{e:?}"))
}

// ============================================================================
// Stream / Event
// ============================================================================

/// Stream of one slot, with the cuBLAS handle bound to it
pub struct CudaSlotStream {
    device: usize,
    stream: Arc<CudaStream>,
    blas: CudaBlas,
}

impl std::fmt::Debug for CudaSlotStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaSlotStream")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Driver event recorded on a slot stream
#[derive(Debug)]
pub struct CudaEvent {
    device: usize,
    event: sys::CUevent,
}

// SAFETY: CUevent handles may be used from any thread once created.
unsafe impl Send for CudaEvent {}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        // SAFETY: the event was created by event::create and is destroyed once.
        if let Err(e) = unsafe { result::event::destroy(self.event) } {
            tracing::warn!(device = self.device, "failed to destroy CUDA event: {e:?}");
        }
    }
}

// ============================================================================
// CudaRuntime
// ============================================================================

/// CUDA runtime backed by cudarc and cuBLAS
pub struct CudaRuntime {
    contexts: Mutex<Vec<Option<Arc<CudaContext>>>>,
}

impl std::fmt::Debug for CudaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaRuntime")
            .field("contexts", &self.contexts.lock().iter().flatten().count())
            .finish()
    }
}

impl CudaRuntime {
    /// Initialize the driver and size the context cache
    pub fn new() -> Result<Self> {
        result::init().map_err(driver_err(0, "device count"))?;
        let count = result::device::get_count().map_err(driver_err(0, "device count"))?;
        Ok(Self {
            contexts: Mutex::new(vec![None; count.max(0) as usize]),
        })
    }

    /// Context of `device`, created on first use and bound to this thread
    fn context(&self, device: usize) -> Result<Arc<CudaContext>> {
        let mut contexts = self.contexts.lock();
        let available = contexts.len();
        let slot = contexts.get_mut(device).ok_or(Error::InvalidDevice {
            index: device,
            available,
        })?;
        let ctx = match slot {
            Some(ctx) => ctx.clone(),
            None => {
                let ctx = CudaContext::new(device).map_err(driver_err(device, "bind device"))?;
                *slot = Some(ctx.clone());
                ctx
            }
        };
        ctx.bind_to_thread()
            .map_err(driver_err(device, "bind device"))?;
        Ok(ctx)
    }
}

impl DeviceRuntime for CudaRuntime {
    type Stream = CudaSlotStream;
    type Event = CudaEvent;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.contexts.lock().len())
    }

    fn memory_info(&self, device: usize) -> Result<(usize, usize)> {
        self.context(device)?;
        result::mem_get_info().map_err(driver_err(device, "memory info"))
    }

    fn bind_device(&self, device: usize) -> Result<()> {
        self.context(device).map(|_| ())
    }

    fn allocate(&self, device: usize, size_bytes: usize) -> Result<DevicePtr> {
        if size_bytes == 0 {
            return Ok(0);
        }
        self.context(device)?;
        // SAFETY: a context for `device` is current on this thread.
        unsafe { result::malloc_sync(size_bytes) }.map_err(|e| {
            tracing::debug!(device, size_bytes, "cuMemAlloc failed: {e:?}");
            Error::OutOfMemory {
                device,
                size: size_bytes,
            }
        })
    }

    fn deallocate(&self, device: usize, ptr: DevicePtr, _size_bytes: usize) {
        if ptr == 0 {
            return;
        }
        let freed = self.context(device).and_then(|_| {
            // SAFETY: ptr came from malloc_sync on this device.
            unsafe { result::free_sync(ptr) }.map_err(driver_err(device, "free"))
        });
        if let Err(e) = freed {
            tracing::warn!(device, "failed to free 0x{ptr:x}: {e}");
        }
    }

    fn create_stream(&self, device: usize) -> Result<CudaSlotStream> {
        let ctx = self.context(device)?;
        let stream = ctx
            .new_stream()
            .map_err(driver_err(device, "stream create"))?;
        let blas = CudaBlas::new(stream.clone())
            .map_err(|e| Error::device(device, "stream create", format!("cuBLAS: {e:?}")))?;
        Ok(CudaSlotStream {
            device,
            stream,
            blas,
        })
    }

    fn destroy_stream(&self, stream: CudaSlotStream) {
        if let Err(e) = stream.stream.synchronize() {
            tracing::warn!(device = stream.device, "stream sync on destroy failed: {e:?}");
        }
    }

    fn stream_device(&self, stream: &CudaSlotStream) -> usize {
        stream.device
    }

    unsafe fn copy_to_device_async<T: GemmScalar>(
        &self,
        stream: &CudaSlotStream,
        src: MatRef<'_, T>,
        dst: DevicePtr,
        ld_dst: usize,
    ) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let elem = std::mem::size_of::<T>();
        // SAFETY: CUDA_MEMCPY2D is a plain C struct; zero is a valid default.
        let mut params: sys::CUDA_MEMCPY2D = unsafe { std::mem::zeroed() };
        params.srcMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_HOST;
        params.srcHost = src.as_ptr().cast();
        params.srcPitch = src.ld() * elem;
        params.dstMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_DEVICE;
        params.dstDevice = dst;
        params.dstPitch = ld_dst * elem;
        params.WidthInBytes = src.rows() * elem;
        params.Height = src.cols();
        // SAFETY: the caller guarantees both regions stay valid until sync.
        let status = unsafe { sys::cuMemcpy2DAsync_v2(&params, stream.stream.cu_stream()) };
        check(stream.device, "H2D copy", status)
    }

    unsafe fn copy_from_device_async<T: GemmScalar>(
        &self,
        stream: &CudaSlotStream,
        src: DevicePtr,
        ld_src: usize,
        mut dst: MatMut<'_, T>,
    ) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let elem = std::mem::size_of::<T>();
        // SAFETY: CUDA_MEMCPY2D is a plain C struct; zero is a valid default.
        let mut params: sys::CUDA_MEMCPY2D = unsafe { std::mem::zeroed() };
        params.srcMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_DEVICE;
        params.srcDevice = src;
        params.srcPitch = ld_src * elem;
        params.dstMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_HOST;
        params.dstHost = dst.as_mut_ptr().cast();
        params.dstPitch = dst.ld() * elem;
        params.WidthInBytes = dst.rows() * elem;
        params.Height = dst.cols();
        // SAFETY: the caller reserves the host region until sync.
        let status = unsafe { sys::cuMemcpy2DAsync_v2(&params, stream.stream.cu_stream()) };
        check(stream.device, "D2H copy", status)
    }

    unsafe fn gemm_async<T: GemmScalar>(
        &self,
        stream: &CudaSlotStream,
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
        // SAFETY: the handle is bound to this slot's stream; the caller
        // guarantees the device operands.
        unsafe {
            blas::gemm(
                *stream.blas.handle(),
                stream.device,
                op_a,
                op_b,
                m,
                n,
                k,
                alpha,
                a,
                lda,
                b,
                ldb,
                beta,
                c,
                ldc,
            )
        }
    }

    fn record_event(&self, stream: &CudaSlotStream) -> Result<CudaEvent> {
        let device = stream.device;
        let event = result::event::create(sys::CUevent_flags::CU_EVENT_DEFAULT)
            .map_err(driver_err(device, "event record"))?;
        let event = CudaEvent { device, event };
        // SAFETY: both handles are live.
        unsafe { result::event::record(event.event, stream.stream.cu_stream()) }
            .map_err(driver_err(device, "event record"))?;
        Ok(event)
    }

    fn elapsed_seconds(&self, start: &CudaEvent, end: &CudaEvent) -> Result<f64> {
        // SAFETY: both events were recorded and the stream synchronized.
        let ms = unsafe { result::event::elapsed(start.event, end.event) }
            .map_err(driver_err(start.device, "event elapsed"))?;
        Ok(f64::from(ms) / 1000.0)
    }

    fn synchronize(&self, stream: &CudaSlotStream) -> Result<()> {
        stream
            .stream
            .synchronize()
            .map_err(driver_err(stream.device, "synchronize"))
    }
}
