//! Simulated accelerator runtime
//!
//! `SimRuntime` stands in for a GPU driver: each simulated device has a fixed
//! memory capacity backed by host allocations, streams are deferred queues
//! that execute on synchronization, and the device GEMM is the reference
//! kernel. It exists so the whole dispatch path (registry, partitioning,
//! multi-slot pipeline, self-tuning) can run and be tested on any machine.
//!
//! Faults can be injected per device and call site to exercise the error
//! paths of initialization and of the hybrid pipeline.

mod memory;
mod stream;

pub use stream::{SimEvent, SimStream};

use self::memory::DeviceMemory;
use super::host::kernel;
use super::{DevicePtr, DeviceRuntime};
use crate::dtype::GemmScalar;
use crate::error::{Error, Result};
use crate::matrix::{MatMut, MatRef, Transpose, required_len};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Runtime call that an injected fault makes fail
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FaultSite {
    /// `bind_device`
    Bind,
    /// `memory_info`
    MemoryInfo,
    /// `allocate`
    Allocate,
    /// `create_stream`
    CreateStream,
    /// `copy_to_device_async`
    HostToDevice,
    /// `gemm_async`
    Kernel,
    /// `copy_from_device_async`
    DeviceToHost,
    /// `synchronize`
    Synchronize,
}

impl FaultSite {
    fn operation(self) -> &'static str {
        match self {
            Self::Bind => "bind device",
            Self::MemoryInfo => "memory info",
            Self::Allocate => "allocate",
            Self::CreateStream => "stream create",
            Self::HostToDevice => "H2D copy",
            Self::Kernel => "device gemm",
            Self::DeviceToHost => "D2H copy",
            Self::Synchronize => "synchronize",
        }
    }
}

/// Counters of simulated device activity
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Host-to-device copies issued
    pub h2d_copies: usize,
    /// Bytes moved host-to-device
    pub h2d_bytes: usize,
    /// Device-to-host copies issued
    pub d2h_copies: usize,
    /// Bytes moved device-to-host
    pub d2h_bytes: usize,
    /// Device GEMMs issued
    pub kernels: usize,
    /// Streams created
    pub streams_created: usize,
    /// Streams destroyed
    pub streams_destroyed: usize,
    /// Stream synchronizations
    pub synchronizations: usize,
}

struct SimInner {
    memory: Vec<Mutex<DeviceMemory>>,
    current: AtomicUsize,
    next_stream: AtomicUsize,
    faults: Mutex<Vec<(usize, FaultSite)>>,
    stats: Mutex<SimStats>,
}

/// Host-memory simulated accelerator runtime
///
/// Cloning is cheap and clones share state, so a test can keep a handle for
/// fault injection and statistics after moving the runtime into a context.
#[derive(Clone)]
pub struct SimRuntime {
    inner: Arc<SimInner>,
}

impl std::fmt::Debug for SimRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRuntime")
            .field("devices", &self.inner.memory.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SimRuntime {
    /// `devices` identical devices with `memory_per_device` bytes each
    pub fn new(devices: usize, memory_per_device: usize) -> Self {
        Self::with_memory(&vec![memory_per_device; devices])
    }

    /// One device per entry of `capacities` (bytes)
    pub fn with_memory(capacities: &[usize]) -> Self {
        let memory = capacities
            .iter()
            .enumerate()
            .map(|(device, &capacity)| Mutex::new(DeviceMemory::new(device, capacity)))
            .collect();
        Self {
            inner: Arc::new(SimInner {
                memory,
                current: AtomicUsize::new(0),
                next_stream: AtomicUsize::new(0),
                faults: Mutex::new(Vec::new()),
                stats: Mutex::new(SimStats::default()),
            }),
        }
    }

    /// Make every later call of `site` on `device` fail
    pub fn inject_fault(&self, device: usize, site: FaultSite) {
        self.inner.faults.lock().push((device, site));
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    /// Snapshot of the activity counters
    pub fn stats(&self) -> SimStats {
        *self.inner.stats.lock()
    }

    /// Device most recently bound with `bind_device`
    pub fn current_device(&self) -> usize {
        self.inner.current.load(Ordering::SeqCst)
    }

    /// Number of live allocations on `device`
    pub fn live_allocations(&self, device: usize) -> usize {
        self.inner
            .memory
            .get(device)
            .map_or(0, |m| m.lock().live_allocations())
    }

    fn memory(&self, device: usize) -> Result<&Mutex<DeviceMemory>> {
        self.inner.memory.get(device).ok_or(Error::InvalidDevice {
            index: device,
            available: self.inner.memory.len(),
        })
    }

    fn check_fault(&self, device: usize, site: FaultSite) -> Result<()> {
        if self.inner.faults.lock().contains(&(device, site)) {
            return Err(Error::device(device, site.operation(), "injected fault"));
        }
        Ok(())
    }

    fn check_matrix<T>(
        &self,
        device: usize,
        operation: &'static str,
        ptr: DevicePtr,
        rows: usize,
        cols: usize,
        ld: usize,
    ) -> Result<()> {
        let bytes = required_len(rows, cols, ld)
            .unwrap_or(usize::MAX)
            .saturating_mul(std::mem::size_of::<T>());
        self.memory(device)?.lock().check_range(operation, ptr, bytes)
    }
}

impl DeviceRuntime for SimRuntime {
    type Stream = SimStream;
    type Event = SimEvent;

    fn name(&self) -> &'static str {
        "sim"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.inner.memory.len())
    }

    fn memory_info(&self, device: usize) -> Result<(usize, usize)> {
        self.check_fault(device, FaultSite::MemoryInfo)?;
        Ok(self.memory(device)?.lock().info())
    }

    fn bind_device(&self, device: usize) -> Result<()> {
        self.memory(device)?;
        self.check_fault(device, FaultSite::Bind)?;
        self.inner.current.store(device, Ordering::SeqCst);
        Ok(())
    }

    fn allocate(&self, device: usize, size_bytes: usize) -> Result<DevicePtr> {
        self.check_fault(device, FaultSite::Allocate)?;
        self.memory(device)?.lock().allocate(size_bytes)
    }

    fn deallocate(&self, device: usize, ptr: DevicePtr, _size_bytes: usize) {
        let result = self
            .memory(device)
            .and_then(|memory| memory.lock().deallocate(ptr));
        if let Err(e) = result {
            tracing::warn!(device, "deallocation failed: {e}");
        }
    }

    fn create_stream(&self, device: usize) -> Result<SimStream> {
        self.memory(device)?;
        self.check_fault(device, FaultSite::CreateStream)?;
        self.inner.stats.lock().streams_created += 1;
        let id = self.inner.next_stream.fetch_add(1, Ordering::SeqCst);
        Ok(SimStream::new(device, id))
    }

    fn destroy_stream(&self, stream: SimStream) {
        let pending = stream.pending();
        if pending > 0 {
            tracing::warn!(
                device = stream.device,
                stream = stream.id,
                pending,
                "destroying stream with unsynchronized work; dropping it"
            );
        }
        self.inner.stats.lock().streams_destroyed += 1;
    }

    fn stream_device(&self, stream: &SimStream) -> usize {
        stream.device
    }

    unsafe fn copy_to_device_async<T: GemmScalar>(
        &self,
        stream: &SimStream,
        src: MatRef<'_, T>,
        dst: DevicePtr,
        ld_dst: usize,
    ) -> Result<()> {
        let device = stream.device;
        self.check_fault(device, FaultSite::HostToDevice)?;
        let (rows, cols, ld_src) = (src.rows(), src.cols(), src.ld());
        if rows == 0 || cols == 0 {
            return Ok(());
        }
        self.check_matrix::<T>(device, "H2D copy", dst, rows, cols, ld_dst)?;
        {
            let mut stats = self.inner.stats.lock();
            stats.h2d_copies += 1;
            stats.h2d_bytes += rows * cols * std::mem::size_of::<T>();
        }

        let src_addr = src.as_ptr() as usize;
        stream.push(move || {
            let src = src_addr as *const T;
            let dst = dst as *mut T;
            for j in 0..cols {
                // SAFETY: the caller keeps the host buffer alive until the
                // stream is synchronized; the device range was validated.
                unsafe {
                    std::ptr::copy_nonoverlapping(src.add(j * ld_src), dst.add(j * ld_dst), rows)
                };
            }
            Ok(())
        });
        Ok(())
    }

    unsafe fn copy_from_device_async<T: GemmScalar>(
        &self,
        stream: &SimStream,
        src: DevicePtr,
        ld_src: usize,
        mut dst: MatMut<'_, T>,
    ) -> Result<()> {
        let device = stream.device;
        self.check_fault(device, FaultSite::DeviceToHost)?;
        let (rows, cols, ld_dst) = (dst.rows(), dst.cols(), dst.ld());
        if rows == 0 || cols == 0 {
            return Ok(());
        }
        self.check_matrix::<T>(device, "D2H copy", src, rows, cols, ld_src)?;
        {
            let mut stats = self.inner.stats.lock();
            stats.d2h_copies += 1;
            stats.d2h_bytes += rows * cols * std::mem::size_of::<T>();
        }

        let dst_addr = dst.as_mut_ptr() as usize;
        stream.push(move || {
            let src = src as *const T;
            let dst = dst_addr as *mut T;
            for j in 0..cols {
                // SAFETY: the caller keeps the host region exclusively
                // reserved until the stream is synchronized.
                unsafe {
                    std::ptr::copy_nonoverlapping(src.add(j * ld_src), dst.add(j * ld_dst), rows)
                };
            }
            Ok(())
        });
        Ok(())
    }

    unsafe fn gemm_async<T: GemmScalar>(
        &self,
        stream: &SimStream,
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
        let device = stream.device;
        self.check_fault(device, FaultSite::Kernel)?;
        let (a_rows, a_cols) = op_a.stored_shape(m, k);
        let (b_rows, b_cols) = op_b.stored_shape(k, n);
        if lda < a_rows.max(1) || ldb < b_rows.max(1) || ldc < m.max(1) {
            return Err(Error::device(
                device,
                "device gemm",
                format!("invalid leading dimensions lda={lda} ldb={ldb} ldc={ldc}"),
            ));
        }
        self.check_matrix::<T>(device, "device gemm", a, a_rows, a_cols, lda)?;
        self.check_matrix::<T>(device, "device gemm", b, b_rows, b_cols, ldb)?;
        self.check_matrix::<T>(device, "device gemm", c, m, n, ldc)?;
        self.inner.stats.lock().kernels += 1;

        stream.push(move || {
            // SAFETY: all three ranges were validated against live device
            // allocations, which outlive the stream's queued work.
            let (a, b, c) = unsafe {
                (
                    MatRef::from_raw_parts(a as *const T, a_rows, a_cols, lda),
                    MatRef::from_raw_parts(b as *const T, b_rows, b_cols, ldb),
                    MatMut::from_raw_parts_mut(c as *mut T, m, n, ldc),
                )
            };
            kernel::gemm(op_a, op_b, alpha, a, b, beta, c);
            Ok(())
        });
        Ok(())
    }

    fn record_event(&self, stream: &SimStream) -> Result<SimEvent> {
        let event = SimEvent::new(stream.device);
        let marker = event.clone();
        stream.push(move || {
            marker.mark();
            Ok(())
        });
        Ok(event)
    }

    fn elapsed_seconds(&self, start: &SimEvent, end: &SimEvent) -> Result<f64> {
        start.elapsed_to(end)
    }

    fn synchronize(&self, stream: &SimStream) -> Result<()> {
        self.inner.stats.lock().synchronizations += 1;
        let drained = stream.drain();
        self.check_fault(stream.device, FaultSite::Synchronize)?;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_info_and_allocation() {
        let rt = SimRuntime::new(2, 4096);
        assert_eq!(rt.device_count().unwrap(), 2);
        let p = rt.allocate(1, 1024).unwrap();
        assert_eq!(rt.memory_info(1).unwrap(), (3072, 4096));
        assert_eq!(rt.memory_info(0).unwrap(), (4096, 4096));
        rt.deallocate(1, p, 1024);
        assert_eq!(rt.live_allocations(1), 0);
        assert!(matches!(
            rt.allocate(5, 8),
            Err(Error::InvalidDevice { index: 5, .. })
        ));
    }

    #[test]
    fn test_round_trip_through_device_is_deferred() {
        let rt = SimRuntime::new(1, 1 << 16);
        let stream = rt.create_stream(0).unwrap();
        let dev = rt.allocate(0, 6 * 8).unwrap();

        // 2x3 block out of a 3-row host matrix
        let host: Vec<f64> = (0..9).map(|x| x as f64).collect();
        let src = MatRef::from_slice(&host, 3, 3, 3).unwrap().submatrix(1, 0, 2, 3);
        let mut out = vec![0.0; 6];
        unsafe {
            rt.copy_to_device_async(&stream, src, dev, 2).unwrap();
            let dst = MatMut::from_slice_mut(&mut out, 2, 3, 2).unwrap();
            rt.copy_from_device_async(&stream, dev, 2, dst).unwrap();
        }
        assert_eq!(stream.pending(), 2);
        rt.synchronize(&stream).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 4.0, 5.0, 7.0, 8.0]);

        let stats = rt.stats();
        assert_eq!(stats.h2d_copies, 1);
        assert_eq!(stats.d2h_bytes, 48);
        rt.destroy_stream(stream);
        rt.deallocate(0, dev, 48);
    }

    #[test]
    fn test_out_of_range_copy_is_rejected() {
        let rt = SimRuntime::new(1, 1 << 12);
        let stream = rt.create_stream(0).unwrap();
        let dev = rt.allocate(0, 16).unwrap();
        let host = [1.0f64; 4];
        let src = MatRef::from_slice(&host, 2, 2, 2).unwrap();
        let err = unsafe { rt.copy_to_device_async(&stream, src, dev, 2) }.unwrap_err();
        assert!(err.to_string().contains("illegal address"));
        rt.destroy_stream(stream);
    }

    #[test]
    fn test_injected_faults() {
        let rt = SimRuntime::new(2, 1 << 12);
        rt.inject_fault(1, FaultSite::CreateStream);
        assert!(rt.create_stream(0).is_ok());
        let err = rt.create_stream(1).unwrap_err();
        assert!(err.is_fatal());
        rt.clear_faults();
        assert!(rt.create_stream(1).is_ok());
    }

    #[test]
    fn test_device_gemm_and_events() {
        let rt = SimRuntime::new(1, 1 << 16);
        let stream = rt.create_stream(0).unwrap();
        let base = rt.allocate(0, 12 * 4).unwrap();
        let (a, b, c) = (base, base + 16, base + 32);

        let ones = [1.0f32; 4];
        let mut out = [0.0f32; 4];
        unsafe {
            rt.copy_to_device_async(&stream, MatRef::from_slice(&ones, 2, 2, 2).unwrap(), a, 2)
                .unwrap();
            rt.copy_to_device_async(&stream, MatRef::from_slice(&ones, 2, 2, 2).unwrap(), b, 2)
                .unwrap();
            let start = rt.record_event(&stream).unwrap();
            rt.gemm_async(
                &stream,
                Transpose::NoTrans,
                Transpose::NoTrans,
                2,
                2,
                2,
                3.0f32,
                a,
                2,
                b,
                2,
                0.0,
                c,
                2,
            )
            .unwrap();
            let end = rt.record_event(&stream).unwrap();
            rt.copy_from_device_async(&stream, c, 2, MatMut::from_slice_mut(&mut out, 2, 2, 2).unwrap())
                .unwrap();
            assert!(rt.elapsed_seconds(&start, &end).is_err());
            rt.synchronize(&stream).unwrap();
            assert!(rt.elapsed_seconds(&start, &end).unwrap() >= 0.0);
        }
        assert_eq!(out, [6.0; 4]);
        assert_eq!(rt.stats().kernels, 1);
        rt.destroy_stream(stream);
    }
}
