//! K-split execution for long inner dimensions
//!
//! When `k` dwarfs the output, splitting M or N leaves both sides with thin
//! products that are dominated by staging the huge operands. Instead K is
//! cut into tiles; each tile product `op(A)[:, k0..k1] * op(B)[k0..k1, :]`
//! runs on the device and is accumulated on the host.
//!
//! Two streams and two device regions alternate, so staging tile `t + 1`
//! overlaps the computation of tile `t`:
//!
//! ```text
//! stream 0:  [H2D t0 | gemm t0 | D2H t0]            [H2D t2 | ...
//! stream 1:            [H2D t1 | gemm t1 | D2H t1]
//! host:      C *= beta              acc t0           acc t1
//! ```

use crate::dtype::GemmScalar;
use crate::error::{Error, Result};
use crate::matrix::MatMut;
use crate::partition::even;
use crate::registry::DeviceRegistry;
use crate::request::GemmRequest;
use crate::runtime::host::kernel::{op_cols, op_rows, scale_col};
use crate::runtime::{DevicePtr, DeviceRuntime};

/// Number of alternating buffers
const BUFFERS: usize = 2;

/// Summary of a K-split run
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpecialKOutcome {
    /// Device used
    pub device: usize,
    /// Number of K tiles
    pub tiles: usize,
    /// Tile length along K (the last tile may be shorter)
    pub tile_k: usize,
}

/// Elements of one buffer region for a tile of length `tile_k`
fn region_elements(m: usize, n: usize, tile_k: usize) -> usize {
    even(m.saturating_mul(tile_k))
        .saturating_add(even(tile_k.saturating_mul(n)))
        .saturating_add(even(m.saturating_mul(n)))
}

/// Largest tile length `<= block` whose double buffer fits `capacity` bytes.
///
/// Halves `block` until it fits; `None` if even a single K column does not.
pub fn fit_tile(
    m: usize,
    n: usize,
    k: usize,
    block: usize,
    capacity: usize,
    elem: usize,
) -> Option<usize> {
    let mut tile_k = block.min(k).max(1);
    loop {
        let needed = BUFFERS
            .saturating_mul(region_elements(m, n, tile_k))
            .saturating_mul(elem);
        if needed <= capacity {
            return Some(tile_k);
        }
        if tile_k == 1 {
            return None;
        }
        tile_k /= 2;
    }
}

/// Temporary streams, synchronized and destroyed on every exit path
struct TileStreams<'r, R: DeviceRuntime> {
    runtime: &'r R,
    streams: Vec<R::Stream>,
}

impl<R: DeviceRuntime> Drop for TileStreams<'_, R> {
    fn drop(&mut self) {
        for stream in self.streams.drain(..) {
            if let Err(e) = self.runtime.synchronize(&stream) {
                tracing::warn!("special-k stream teardown: {e}");
            }
            self.runtime.destroy_stream(stream);
        }
    }
}

/// Run `req` by tiling K through the first device of `registry`.
///
/// `k` must be non-zero. Any device error aborts the call; C is then
/// unspecified.
pub fn run_special_k<R: DeviceRuntime, T: GemmScalar>(
    runtime: &R,
    registry: &DeviceRegistry<R>,
    req: GemmRequest<'_, T>,
    block: usize,
) -> Result<SpecialKOutcome> {
    let binding = registry.bindings().first().ok_or(Error::NotInitialized)?;
    let device = binding.device();
    let elem = std::mem::size_of::<T>();
    let (m, n, k) = (req.m(), req.n(), req.k());
    let capacity = binding.scratch_bytes();

    let tile_k = fit_tile(m, n, k, block, capacity, elem).ok_or(Error::ScratchOverflow {
        slot: 0,
        needed: BUFFERS
            .saturating_mul(region_elements(m, n, 1))
            .saturating_mul(elem),
        available: capacity,
    })?;
    let tiles = k.div_ceil(tile_k);

    let GemmRequest {
        op_a,
        op_b,
        alpha,
        beta,
        a,
        b,
        mut c,
    } = req;

    for j in 0..n {
        scale_col(c.col_mut(j), beta);
    }

    // declared before the streams so they outlive every queued copy
    let mut partials: [Vec<T>; BUFFERS] = std::array::from_fn(|_| vec![T::zero(); m.saturating_mul(n)]);

    runtime.bind_device(device)?;
    let mut guard = TileStreams {
        runtime,
        streams: Vec::with_capacity(BUFFERS),
    };
    for _ in 0..BUFFERS {
        guard.streams.push(runtime.create_stream(device)?);
    }

    let region_bytes = region_elements(m, n, tile_k).saturating_mul(elem);
    let ldc = m.max(1);
    tracing::debug!(m, n, k, tiles, tile_k, device, "special-k run");

    for t in 0..tiles {
        let buf = t % BUFFERS;
        let k0 = t * tile_k;
        let kt = tile_k.min(k - k0);
        let a_tile = op_cols(a, op_a, k0, kt);
        let b_tile = op_rows(b, op_b, k0, kt);
        let (lda, ldb) = (a_tile.rows().max(1), b_tile.rows().max(1));

        let a_dev = binding.scratch_base() + (buf * region_bytes) as DevicePtr;
        let b_dev = a_dev + (even(m * kt) * elem) as DevicePtr;
        let c_dev = b_dev + (even(kt * n) * elem) as DevicePtr;
        let stream = &guard.streams[buf];

        let partial = MatMut::from_slice_mut(&mut partials[buf], m, n, ldc)?;
        // SAFETY: the tile views borrow `req` operands that outlive this
        // call, and `partials[buf]` is only read after `stream` has been
        // synchronized below (or by the guard when unwinding).
        unsafe {
            runtime.copy_to_device_async(stream, a_tile, a_dev, lda)?;
            runtime.copy_to_device_async(stream, b_tile, b_dev, ldb)?;
            runtime.gemm_async(
                stream,
                op_a,
                op_b,
                m,
                n,
                kt,
                alpha,
                a_dev,
                lda,
                b_dev,
                ldb,
                T::zero(),
                c_dev,
                ldc,
            )?;
            runtime.copy_from_device_async(stream, c_dev, ldc, partial)?;
        }

        if t > 0 {
            let prev = (t - 1) % BUFFERS;
            runtime.synchronize(&guard.streams[prev])?;
            accumulate(&mut c, &partials[prev]);
        }
    }

    let last = (tiles - 1) % BUFFERS;
    runtime.synchronize(&guard.streams[last])?;
    accumulate(&mut c, &partials[last]);

    Ok(SpecialKOutcome {
        device,
        tiles,
        tile_k,
    })
}

/// `C += partial`, `partial` packed with leading dimension `c.rows()`
fn accumulate<T: GemmScalar>(c: &mut MatMut<'_, T>, partial: &[T]) {
    let m = c.rows();
    if m == 0 {
        return;
    }
    for (j, src) in partial.chunks_exact(m).enumerate().take(c.cols()) {
        for (x, &p) in c.col_mut(j).iter_mut().zip(src) {
            *x = *x + p;
        }
    }
}
