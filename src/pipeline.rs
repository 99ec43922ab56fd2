//! Hybrid execution pipeline
//!
//! Runs one GPU-assisted piece that is known to fit:
//!
//! ```text
//! long axis:  [ slot 0 | slot 1 | ... | slot N-1 |      host      ]
//!             \_______ floor(dim * split) ______/ \_ dim - device _/
//!
//! per slot, on its stream:
//!   e0  H2D A  e1  H2D B  e2  [H2D C if beta != 0]  e3  gemm  e4  D2H C  e5
//!
//! host:       gemm on the complementary slice, overlapping the device work
//! barrier:    synchronize every issued stream, one after another
//! ```
//!
//! Events are only recorded when timings are wanted (profiling or
//! self-tuning). Device failures do not abort the fan-out: the failing slot
//! stops issuing, the others proceed, and every failure is returned in the
//! [`HybridOutcome`]. The C region of a failed slot is left unspecified.

use std::fmt;
use std::time::Instant;

use crate::dtype::GemmScalar;
use crate::error::{Error, Result};
use crate::partition::{busiest_slot_share, device_share, even};
use crate::registry::{DeviceRegistry, Slot};
use crate::request::GemmRequest;
use crate::runtime::{DevicePtr, DeviceRuntime, HostBlas};
use crate::strategy::SplitAxis;
use crate::tuning::SlotTiming;

/// Pipeline stage a slot failure happened in
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Binding the slot's device
    Bind,
    /// Slot blocks do not fit the slot scratch
    Capacity,
    /// Recording a timing event
    Event,
    /// Staging A
    StageA,
    /// Staging B
    StageB,
    /// Staging C
    StageC,
    /// Device GEMM
    Kernel,
    /// Copying C back
    Retrieve,
    /// Stream barrier
    Synchronize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bind => "bind",
            Self::Capacity => "capacity",
            Self::Event => "event",
            Self::StageA => "H2D A",
            Self::StageB => "H2D B",
            Self::StageC => "H2D C",
            Self::Kernel => "device gemm",
            Self::Retrieve => "D2H C",
            Self::Synchronize => "synchronize",
        };
        f.write_str(name)
    }
}

/// A device failure on one slot of a hybrid run
#[derive(Debug)]
pub struct SlotFailure {
    /// Slot index
    pub slot: usize,
    /// Device of the slot
    pub device: usize,
    /// Stage that failed
    pub stage: Stage,
    /// Runtime error
    pub error: Error,
}

impl fmt::Display for SlotFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot {} (device {}) failed at {}: {}",
            self.slot, self.device, self.stage, self.error
        )
    }
}

/// Result of one hybrid run
#[derive(Debug, Default)]
pub struct HybridOutcome {
    /// Elements of the long axis computed on devices
    pub device_share: usize,
    /// Elements of the long axis computed on the host
    pub host_share: usize,
    /// Slots that received work
    pub slots_used: usize,
    /// Timing per slot index (only with timing enabled and for slots
    /// that completed)
    pub timings: Vec<Option<SlotTiming>>,
    /// Host GEMM wall time in seconds
    pub host_seconds: f64,
    /// Per-slot device failures
    pub failures: Vec<SlotFailure>,
}

impl HybridOutcome {
    /// Timing of slot 0, the input of the self-tuner
    pub fn slot0_timing(&self) -> Option<SlotTiming> {
        self.timings.first().copied().flatten()
    }
}

/// Synchronizes every issued stream, also when unwinding, so no queued copy
/// outlives the host buffers it targets.
struct Barrier<'r, R: DeviceRuntime> {
    runtime: &'r R,
    pending: Vec<(usize, usize, &'r R::Stream)>,
}

impl<'r, R: DeviceRuntime> Barrier<'r, R> {
    fn new(runtime: &'r R, slots: usize) -> Self {
        Self {
            runtime,
            pending: Vec::with_capacity(slots),
        }
    }

    fn push(&mut self, slot: usize, device: usize, stream: &'r R::Stream) {
        self.pending.push((slot, device, stream));
    }

    /// Synchronize in issue order; returns the failures
    fn wait(mut self) -> Vec<SlotFailure> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .filter_map(|(slot, device, stream)| {
                self.runtime.synchronize(stream).err().map(|error| SlotFailure {
                    slot,
                    device,
                    stage: Stage::Synchronize,
                    error,
                })
            })
            .collect()
    }
}

impl<R: DeviceRuntime> Drop for Barrier<'_, R> {
    fn drop(&mut self) {
        for (_, _, stream) in self.pending.drain(..) {
            let _ = self.runtime.synchronize(stream);
        }
    }
}

struct Issued<E> {
    slot: usize,
    device: usize,
    events: Vec<E>,
    failure: Option<SlotFailure>,
}

/// Issue the device work of one slot. Stops at the first failing operation.
fn issue_slot<R: DeviceRuntime, T: GemmScalar>(
    runtime: &R,
    slot: &Slot<'_, R::Stream>,
    req: GemmRequest<'_, T>,
    timed: bool,
) -> Issued<R::Event> {
    let mut issued = Issued {
        slot: slot.index,
        device: slot.device,
        events: Vec::with_capacity(if timed { 6 } else { 0 }),
        failure: None,
    };
    if let Err((stage, error)) = stage_and_run(runtime, slot, req, timed, &mut issued.events) {
        tracing::error!(
            slot = slot.index,
            device = slot.device,
            %stage,
            "hybrid slot failed: {error}"
        );
        issued.failure = Some(SlotFailure {
            slot: slot.index,
            device: slot.device,
            stage,
            error,
        });
    }
    issued
}

fn stage_and_run<R: DeviceRuntime, T: GemmScalar>(
    runtime: &R,
    slot: &Slot<'_, R::Stream>,
    req: GemmRequest<'_, T>,
    timed: bool,
    events: &mut Vec<R::Event>,
) -> std::result::Result<(), (Stage, Error)> {
    let stream = slot.stream;
    let elem = std::mem::size_of::<T>();
    let (m, n, k) = (req.m(), req.n(), req.k());
    let GemmRequest {
        op_a,
        op_b,
        alpha,
        beta,
        a,
        b,
        c,
    } = req;

    let a_len = even(a.rows() * a.cols());
    let b_len = even(b.rows() * b.cols());
    let c_len = even(m * n);
    let needed = (a_len + b_len + c_len) * elem;
    if needed > slot.capacity {
        return Err((
            Stage::Capacity,
            Error::ScratchOverflow {
                slot: slot.index,
                needed,
                available: slot.capacity,
            },
        ));
    }

    let a_dev = slot.scratch;
    let b_dev = a_dev + (a_len * elem) as DevicePtr;
    let c_dev = b_dev + (b_len * elem) as DevicePtr;
    let (lda, ldb, ldc) = (a.rows().max(1), b.rows().max(1), m.max(1));

    let mark = |events: &mut Vec<R::Event>| -> std::result::Result<(), (Stage, Error)> {
        if timed {
            events.push(runtime.record_event(stream).map_err(|e| (Stage::Event, e))?);
        }
        Ok(())
    };

    runtime
        .bind_device(slot.device)
        .map_err(|e| (Stage::Bind, e))?;

    // SAFETY: every host view borrowed here outlives the Barrier that
    // synchronizes this stream before `run_hybrid` returns, and the C view
    // is consumed by the D2H copy so no host code touches it until then.
    unsafe {
        mark(events)?;
        runtime
            .copy_to_device_async(stream, a, a_dev, lda)
            .map_err(|e| (Stage::StageA, e))?;
        mark(events)?;
        runtime
            .copy_to_device_async(stream, b, b_dev, ldb)
            .map_err(|e| (Stage::StageB, e))?;
        mark(events)?;
        if !beta.is_zero() {
            runtime
                .copy_to_device_async(stream, c.view(), c_dev, ldc)
                .map_err(|e| (Stage::StageC, e))?;
        }
        mark(events)?;
        runtime
            .gemm_async(
                stream, op_a, op_b, m, n, k, alpha, a_dev, lda, b_dev, ldb, beta, c_dev, ldc,
            )
            .map_err(|e| (Stage::Kernel, e))?;
        mark(events)?;
        runtime
            .copy_from_device_async(stream, c_dev, ldc, c)
            .map_err(|e| (Stage::Retrieve, e))?;
        mark(events)?;
    }
    Ok(())
}

fn slot_timing<R: DeviceRuntime>(
    runtime: &R,
    events: &[R::Event],
    host: f64,
) -> Result<SlotTiming> {
    Ok(SlotTiming {
        h2d: runtime.elapsed_seconds(&events[0], &events[3])?,
        device: runtime.elapsed_seconds(&events[3], &events[4])?,
        d2h: runtime.elapsed_seconds(&events[4], &events[5])?,
        host,
    })
}

/// Run one hybrid step of `req` split along `axis` with ratio `split`.
///
/// The registry must be initialized and the busiest slot's blocks must fit
/// its scratch region.
pub fn run_hybrid<R: DeviceRuntime, H: HostBlas, T: GemmScalar>(
    runtime: &R,
    host: &H,
    registry: &DeviceRegistry<R>,
    req: GemmRequest<'_, T>,
    axis: SplitAxis,
    split: f32,
    timed: bool,
) -> HybridOutcome {
    let (m, n, k) = (req.m(), req.n(), req.k());
    let dim = axis.extent(m, n);
    let slots = registry.slot_count();
    let device = if slots == 0 {
        0
    } else {
        device_share(dim, split)
    };

    let (mut rest, host_req) = req.split(axis, device);
    let step = if slots == 0 { 0 } else { device / slots };

    let mut barrier = Barrier::new(runtime, slots);
    let mut issued = Vec::with_capacity(slots);
    for slot in registry.slots() {
        let share = if slot.index == 0 {
            busiest_slot_share(device, slots)
        } else {
            step
        };
        if share == 0 {
            continue;
        }
        let (mine, tail) = rest.split(axis, share);
        rest = tail;
        barrier.push(slot.index, slot.device, slot.stream);
        issued.push(issue_slot(runtime, &slot, mine, timed));
    }

    let host_start = Instant::now();
    host.gemm(
        host_req.op_a,
        host_req.op_b,
        host_req.alpha,
        host_req.a,
        host_req.b,
        host_req.beta,
        host_req.c,
    );
    let host_seconds = host_start.elapsed().as_secs_f64();

    let slots_used = issued.len();
    let mut failures = barrier.wait();
    let mut timings = vec![None; slots];
    for slot in issued {
        if let Some(failure) = slot.failure {
            failures.push(failure);
            continue;
        }
        if failures.iter().any(|f| f.slot == slot.slot) || !timed {
            continue;
        }
        match slot_timing(runtime, &slot.events, host_seconds) {
            Ok(t) => {
                tracing::debug!(
                    slot = slot.slot,
                    device = slot.device,
                    m,
                    n,
                    k,
                    split,
                    h2d = t.h2d,
                    device_time = t.device,
                    d2h = t.d2h,
                    host = t.host,
                    balance = t.imbalance(),
                    "hybrid slot timing"
                );
                timings[slot.slot] = Some(t);
            }
            Err(e) => tracing::warn!(slot = slot.slot, "could not read slot timing: {e}"),
        }
    }
    failures.sort_by_key(|f| f.slot);

    HybridOutcome {
        device_share: device,
        host_share: dim - device,
        slots_used,
        timings,
        host_seconds,
        failures,
    }
}
