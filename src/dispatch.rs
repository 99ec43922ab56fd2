//! Dispatch entry point
//!
//! [`HybridGemm`] is the context object every call goes through. It owns the
//! device runtime, the host BLAS, the configuration, and (behind one lock)
//! the device registry, the tuning state and the profile sink.
//!
//! A call is classified once at the top and again for every piece the
//! capacity partitioner produces:
//!
//! ```text
//! gemm(m, n, k)
//!   ├─ CpuOnly     -> host BLAS
//!   ├─ SpecialK    -> tile K through the first device
//!   └─ GpuAssisted -> fits?  ── yes -> hybrid pipeline
//!                            └─ no  -> halve the long axis, recurse on both
//! ```

use std::panic::Location;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::{Config, ExecutionMode};
use crate::dtype::{Complex64, Complex128, GemmKind, GemmScalar};
use crate::error::Result;
use crate::matrix::{MatMut, MatRef, Transpose, check_operand};
use crate::partition::{Plan, plan};
use crate::pipeline::{SlotFailure, run_hybrid};
use crate::profile::{ProfileRecord, ProfileSink};
use crate::registry::{DeviceRegistry, InitOptions, MemoryMode};
use crate::request::GemmRequest;
use crate::runtime::{DeviceRuntime, HostBlas, ReferenceBlas};
use crate::special_k::run_special_k;
use crate::strategy::{Strategy, effective_split, select_for_mode};
use crate::tuning::{SlotTiming, TuningState};

/// What a GEMM call did
#[derive(Debug)]
pub struct GemmReport {
    /// Strategy of the outermost call
    pub strategy: Strategy,
    /// Split ratio used by GPU-assisted pieces
    pub split: Option<f32>,
    /// Bisections performed by the capacity partitioner
    pub splitting_steps: usize,
    /// Deepest recursion level reached
    pub max_depth: usize,
    /// Pieces run through the hybrid pipeline
    pub hybrid_runs: usize,
    /// Pieces run through the K-split path
    pub special_k_runs: usize,
    /// Pieces run on the host only
    pub host_runs: usize,
    /// Wall time in seconds
    pub elapsed: f64,
    /// Device failures of hybrid runs; the affected C regions are unspecified
    pub failures: Vec<SlotFailure>,
}

impl GemmReport {
    fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            split: None,
            splitting_steps: 0,
            max_depth: 0,
            hybrid_runs: 0,
            special_k_runs: 0,
            host_runs: 0,
            elapsed: 0.0,
            failures: Vec::new(),
        }
    }

    /// Returns true if any slot failed
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

struct DispatchState<R: DeviceRuntime> {
    registry: DeviceRegistry<R>,
    tuning: TuningState,
    sink: Option<Box<dyn ProfileSink>>,
}

/// Per-call values shared by all pieces of one dispatch
struct CallContext {
    split: f32,
    timed: bool,
    last_timing: Option<SlotTiming>,
}

/// Hybrid GEMM context
///
/// # Example
///
/// ```
/// use hybridgemm::prelude::*;
/// use hybridgemm::runtime::sim::SimRuntime;
///
/// let ctx = HybridGemm::with_config(
///     SimRuntime::new(1, 64 << 20),
///     Config::default().with_thresholds(8, 2048),
/// )?;
/// let (m, n, k) = (32, 16, 8);
/// let a = vec![1.0f64; m * k];
/// let b = vec![2.0f64; k * n];
/// let mut c = vec![0.0f64; m * n];
/// let report = ctx.dgemm(
///     Transpose::NoTrans, Transpose::NoTrans, m, n, k,
///     1.0, &a, m, &b, k, 0.0, &mut c, m,
/// )?;
/// assert!(c.iter().all(|&x| x == 16.0));
/// assert_eq!(report.hybrid_runs, 1);
/// # Ok::<(), hybridgemm::error::Error>(())
/// ```
pub struct HybridGemm<R: DeviceRuntime, H: HostBlas = ReferenceBlas> {
    runtime: R,
    host: H,
    config: Config,
    state: Mutex<DispatchState<R>>,
}

impl<R: DeviceRuntime> HybridGemm<R, ReferenceBlas> {
    /// Context with the default configuration
    pub fn new(runtime: R) -> Self {
        Self::assemble(runtime, ReferenceBlas::new(), Config::default())
    }

    /// Context with an explicit configuration
    pub fn with_config(runtime: R, config: Config) -> Result<Self> {
        config.validate()?;
        let host = match config.host_threads {
            Some(threads) => ReferenceBlas::with_threads(threads)?,
            None => ReferenceBlas::new(),
        };
        Ok(Self::assemble(runtime, host, config))
    }

    /// Context configured from `HYBRIDGEMM_*` environment variables
    pub fn from_env(runtime: R) -> Result<Self> {
        Self::with_config(runtime, Config::from_env()?)
    }
}

impl<R: DeviceRuntime, H: HostBlas> HybridGemm<R, H> {
    /// Context with a custom host BLAS
    pub fn with_host(runtime: R, host: H, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(runtime, host, config))
    }

    fn assemble(runtime: R, host: H, config: Config) -> Self {
        let state = DispatchState {
            registry: DeviceRegistry::new(),
            tuning: TuningState::from_config(&config),
            sink: None,
        };
        Self {
            runtime,
            host,
            config,
            state: Mutex::new(state),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bind devices and set up scratch memory; a no-op when already
    /// initialized.
    pub fn initialize(&self, options: &InitOptions) -> Result<()> {
        self.state
            .lock()
            .registry
            .initialize(&self.runtime, options, &self.config)
    }

    /// Release every device resource; a no-op when not initialized
    pub fn shutdown(&self) {
        self.state.lock().registry.shutdown(&self.runtime);
    }

    /// Returns true if devices are bound
    pub fn is_initialized(&self) -> bool {
        self.state.lock().registry.is_initialized()
    }

    /// Returns true if scratch memory was allocated by the context
    pub fn is_internally_allocated(&self) -> bool {
        self.state.lock().registry.is_internally_allocated()
    }

    /// Returns true if scratch memory was supplied by the caller
    pub fn is_externally_allocated(&self) -> bool {
        self.state.lock().registry.is_externally_allocated()
    }

    /// Memory mode of the current initialization
    pub fn memory_mode(&self) -> Option<MemoryMode> {
        self.state.lock().registry.memory_mode()
    }

    /// Number of bound devices
    pub fn device_count(&self) -> usize {
        self.state.lock().registry.device_count()
    }

    /// Shrink the usable scratch of bound device `device` to `bytes`
    pub fn set_scratch_capacity(&self, device: usize, bytes: usize) -> Result<()> {
        self.state
            .lock()
            .registry
            .set_scratch_capacity(device, bytes)
    }

    // ------------------------------------------------------------------
    // Tuning and profiling
    // ------------------------------------------------------------------

    /// Replace the split ratios of all kinds (s, d, c, z order)
    pub fn set_split_factors(&self, splits: [f32; 4]) -> Result<()> {
        self.state.lock().tuning.set_split_factors(splits)
    }

    /// Current split ratio of `kind`
    pub fn split_factor(&self, kind: GemmKind) -> f32 {
        self.state.lock().tuning.split(kind)
    }

    /// Snapshot of the tuning state
    pub fn tuning(&self) -> TuningState {
        self.state.lock().tuning.clone()
    }

    /// Send profile records to `sink`
    pub fn set_profile_sink(&self, sink: impl ProfileSink + 'static) {
        self.state.lock().sink = Some(Box::new(sink));
    }

    /// Drop the profile sink; records are logged instead
    pub fn clear_profile_sink(&self) {
        self.state.lock().sink = None;
    }

    /// Device runtime
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Host BLAS
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // GEMM
    // ------------------------------------------------------------------

    /// `C = alpha*op(A)*op(B) + beta*C` on column-major slices.
    ///
    /// `op(A)` is `m x k`, `op(B)` is `k x n` and `C` is `m x n`, each stored
    /// with the given leading dimension.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for bad leading dimensions or short slices, and
    /// fatal device errors (no devices, failed self-initialization, K-split
    /// failures). Hybrid slot failures do not fail the call; they are listed
    /// in [`GemmReport::failures`].
    #[track_caller]
    pub fn gemm<T: GemmScalar>(
        &self,
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
    ) -> Result<GemmReport> {
        let site = Location::caller();
        let (a_rows, a_cols) = op_a.stored_shape(m, k);
        let (b_rows, b_cols) = op_b.stored_shape(k, n);
        check_operand("lda", a.len(), a_rows, a_cols, lda)?;
        check_operand("ldb", b.len(), b_rows, b_cols, ldb)?;
        check_operand("ldc", c.len(), m, n, ldc)?;
        if m == 0 || n == 0 {
            return Ok(GemmReport::new(Strategy::CpuOnly));
        }

        let req = GemmRequest::new(
            op_a,
            op_b,
            alpha,
            MatRef::from_slice(a, a_rows, a_cols, lda)?,
            MatRef::from_slice(b, b_rows, b_cols, ldb)?,
            beta,
            MatMut::from_slice_mut(c, m, n, ldc)?,
        )?;
        self.dispatch(req, site)
    }

    /// [`gemm`](Self::gemm) on prepared views
    #[track_caller]
    pub fn gemm_view<T: GemmScalar>(&self, req: GemmRequest<'_, T>) -> Result<GemmReport> {
        let site = Location::caller();
        if req.m() == 0 || req.n() == 0 {
            return Ok(GemmReport::new(Strategy::CpuOnly));
        }
        self.dispatch(req, site)
    }

    /// Single precision [`gemm`](Self::gemm)
    #[track_caller]
    pub fn sgemm(
        &self,
        op_a: Transpose,
        op_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[f32],
        lda: usize,
        b: &[f32],
        ldb: usize,
        beta: f32,
        c: &mut [f32],
        ldc: usize,
    ) -> Result<GemmReport> {
        self.gemm(op_a, op_b, m, n, k, alpha, a, lda, b, ldb, beta, c, ldc)
    }

    /// Double precision [`gemm`](Self::gemm)
    #[track_caller]
    pub fn dgemm(
        &self,
        op_a: Transpose,
        op_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: f64,
        a: &[f64],
        lda: usize,
        b: &[f64],
        ldb: usize,
        beta: f64,
        c: &mut [f64],
        ldc: usize,
    ) -> Result<GemmReport> {
        self.gemm(op_a, op_b, m, n, k, alpha, a, lda, b, ldb, beta, c, ldc)
    }

    /// Single precision complex [`gemm`](Self::gemm)
    #[track_caller]
    pub fn cgemm(
        &self,
        op_a: Transpose,
        op_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: Complex64,
        a: &[Complex64],
        lda: usize,
        b: &[Complex64],
        ldb: usize,
        beta: Complex64,
        c: &mut [Complex64],
        ldc: usize,
    ) -> Result<GemmReport> {
        self.gemm(op_a, op_b, m, n, k, alpha, a, lda, b, ldb, beta, c, ldc)
    }

    /// Double precision complex [`gemm`](Self::gemm)
    #[track_caller]
    pub fn zgemm(
        &self,
        op_a: Transpose,
        op_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: Complex128,
        a: &[Complex128],
        lda: usize,
        b: &[Complex128],
        ldb: usize,
        beta: Complex128,
        c: &mut [Complex128],
        ldc: usize,
    ) -> Result<GemmReport> {
        self.gemm(op_a, op_b, m, n, k, alpha, a, lda, b, ldb, beta, c, ldc)
    }

    fn dispatch<T: GemmScalar>(
        &self,
        req: GemmRequest<'_, T>,
        site: &'static Location<'static>,
    ) -> Result<GemmReport> {
        let start = Instant::now();
        let kind = T::KIND;
        let (op_a, op_b) = (req.op_a, req.op_b);
        let (m, n, k) = (req.m(), req.n(), req.k());
        let mode = self.config.mode;

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut strategy = if k == 0 {
            Strategy::CpuOnly
        } else {
            select_for_mode(mode, m, n, k, &state.tuning, self.config.special_k.into())
        };

        let mut self_initialized = false;
        if strategy.needs_devices() && !state.registry.is_initialized() {
            if self.config.self_init {
                state.registry.self_initialize(&self.runtime, &self.config)?;
                self_initialized = true;
            } else {
                tracing::warn!(
                    %kind,
                    m,
                    n,
                    k,
                    "devices not initialized and self-init is off; computing on the host"
                );
                strategy = Strategy::CpuOnly;
            }
        }

        let mut report = GemmReport::new(strategy);
        let mut call = CallContext {
            split: effective_split(mode, state.tuning.split(kind)),
            timed: self.config.profile || (self.config.self_tune && mode == ExecutionMode::Hybrid),
            last_timing: None,
        };
        if matches!(strategy, Strategy::GpuAssisted { .. }) {
            report.split = Some(call.split);
        }
        let devices = state.registry.device_count();

        let outcome = if strategy.needs_devices() {
            self.dispatch_piece(state, req, 0, &mut call, &mut report)
        } else {
            self.run_host(req, &mut report);
            Ok(())
        };

        if self_initialized {
            state.registry.shutdown(&self.runtime);
        }
        outcome?;

        if self.config.self_tune && mode == ExecutionMode::Hybrid {
            if let Some(timing) = call.last_timing {
                state.tuning.self_tune(kind, &timing);
            }
        }

        report.elapsed = start.elapsed().as_secs_f64();
        tracing::debug!(
            %kind,
            m,
            n,
            k,
            strategy = %report.strategy,
            steps = report.splitting_steps,
            failures = report.failures.len(),
            elapsed = report.elapsed,
            "gemm done"
        );

        if self.config.profile {
            let record = ProfileRecord {
                site,
                kind,
                devices: if strategy.needs_devices() { devices } else { 0 },
                host_threads: self.host.threads(),
                op_a,
                op_b,
                m,
                n,
                k,
                splitting_steps: report.splitting_steps,
                indicator: ProfileRecord::indicator_for(strategy, call.split),
                elapsed: report.elapsed,
                gflops: ProfileRecord::rate(kind, m, n, k, report.elapsed),
            };
            match state.sink.as_mut() {
                Some(sink) => {
                    if let Err(e) = sink.record(&record) {
                        tracing::warn!("profile sink: {e}");
                    }
                }
                None => tracing::debug!(row = %record.to_csv_row(), "profile"),
            }
        }

        Ok(report)
    }

    /// Classify one piece and run it; recurses on bisected halves
    fn dispatch_piece<T: GemmScalar>(
        &self,
        state: &DispatchState<R>,
        req: GemmRequest<'_, T>,
        depth: usize,
        call: &mut CallContext,
        report: &mut GemmReport,
    ) -> Result<()> {
        report.max_depth = report.max_depth.max(depth);
        let (m, n, k) = (req.m(), req.n(), req.k());
        let strategy = select_for_mode(
            self.config.mode,
            m,
            n,
            k,
            &state.tuning,
            self.config.special_k.into(),
        );

        let axis = match strategy {
            Strategy::CpuOnly => {
                self.run_host(req, report);
                return Ok(());
            }
            Strategy::SpecialK => {
                let block = state.tuning.special_k_block();
                run_special_k(&self.runtime, &state.registry, req, block)?;
                report.special_k_runs += 1;
                return Ok(());
            }
            Strategy::GpuAssisted { axis } => axis,
        };

        let registry = &state.registry;
        let piece = plan(
            axis,
            call.split,
            (m, n, k),
            registry.slot_count(),
            registry.min_slot_capacity(),
            std::mem::size_of::<T>(),
        );
        match piece {
            Plan::Hybrid => {
                let outcome = run_hybrid(
                    &self.runtime,
                    &self.host,
                    registry,
                    req,
                    axis,
                    call.split,
                    call.timed,
                );
                report.hybrid_runs += 1;
                if let Some(timing) = outcome.slot0_timing() {
                    call.last_timing = Some(timing);
                }
                report.failures.extend(outcome.failures);
            }
            Plan::Bisect { first, .. } => {
                report.splitting_steps += 1;
                let (head, tail) = req.split(axis, first);
                self.dispatch_piece(state, head, depth + 1, call, report)?;
                self.dispatch_piece(state, tail, depth + 1, call, report)?;
            }
            Plan::Host => self.run_host(req, report),
        }
        Ok(())
    }

    fn run_host<T: GemmScalar>(&self, req: GemmRequest<'_, T>, report: &mut GemmReport) {
        self.host
            .gemm(req.op_a, req.op_b, req.alpha, req.a, req.b, req.beta, req.c);
        report.host_runs += 1;
    }
}

impl<R: DeviceRuntime, H: HostBlas> std::fmt::Debug for HybridGemm<R, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridGemm")
            .field("runtime", &self.runtime.name())
            .field("host_threads", &self.host.threads())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: DeviceRuntime, H: HostBlas> Drop for HybridGemm<R, H> {
    fn drop(&mut self) {
        self.state.get_mut().registry.shutdown(&self.runtime);
    }
}
