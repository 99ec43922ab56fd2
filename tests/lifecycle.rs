//! Device lifecycle, capacity partitioning and failure handling

mod common;

use common::*;
use hybridgemm::prelude::*;
use hybridgemm::registry::MemoryMode;
use hybridgemm::runtime::sim::FaultSite;

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_initialize_and_shutdown_are_idempotent() {
    let (ctx, rt) = sim_context(2, small_problem_config());
    let options = InitOptions::new([0, 1]);
    ctx.initialize(&options).unwrap();
    ctx.initialize(&options).unwrap();
    assert!(ctx.is_initialized());
    assert!(ctx.is_internally_allocated());
    assert_eq!(ctx.memory_mode(), Some(MemoryMode::Internal));
    assert_eq!(ctx.device_count(), 2);
    assert_eq!(rt.live_allocations(0), 1);
    assert_eq!(rt.stats().streams_created, 2);

    // calls reuse the explicit initialization
    let p = Problem::<f32>::new(Transpose::NoTrans, Transpose::NoTrans, (40, 40, 40), 0, 1);
    p.check(&ctx, "initialized");
    assert!(ctx.is_initialized());

    ctx.shutdown();
    ctx.shutdown();
    assert!(!ctx.is_initialized());
    assert_eq!(ctx.memory_mode(), None);
    assert_eq!(rt.live_allocations(0), 0);
    assert_eq!(rt.live_allocations(1), 0);
    assert_eq!(rt.stats().streams_destroyed, 2);

    // self-initializes again after a shutdown
    p.check(&ctx, "after shutdown");
    assert!(!ctx.is_initialized());
}

#[test]
fn test_external_scratch_is_not_freed() {
    let (ctx, rt) = sim_context(1, small_problem_config());
    let bytes = 4 * MIB;
    let ptr = rt.allocate(0, bytes).unwrap();
    let options = InitOptions::new([0]).with_external([ExternalScratch { ptr, bytes }]);
    ctx.initialize(&options).unwrap();
    assert!(ctx.is_externally_allocated());
    assert!(!ctx.is_internally_allocated());

    Problem::<f64>::new(Transpose::Trans, Transpose::Trans, (50, 30, 20), 1, 2)
        .check(&ctx, "external scratch");

    ctx.shutdown();
    assert_eq!(rt.live_allocations(0), 1);
    rt.deallocate(0, ptr, bytes);
}

#[test]
fn test_dropping_the_context_releases_devices() {
    let rt = sim(1, 16 * MIB);
    {
        let ctx = HybridGemm::new(rt.clone());
        ctx.initialize(&InitOptions::new([0])).unwrap();
        assert_eq!(rt.live_allocations(0), 1);
    }
    assert_eq!(rt.live_allocations(0), 0);
    assert_eq!(rt.stats().streams_destroyed, 1);
}

#[test]
fn test_fatal_initialization_errors() {
    let config = small_problem_config();
    let p = Problem::<f64>::new(Transpose::NoTrans, Transpose::NoTrans, (32, 32, 32), 0, 3);

    let ctx = HybridGemm::with_config(sim(0, MIB), config.clone()).unwrap();
    let mut c = p.c.clone();
    let err = ctx
        .dgemm(
            p.op_a, p.op_b, p.m, p.n, p.k, p.alpha, &p.a, p.lda, &p.b, p.ldb, p.beta, &mut c, p.ldc,
        )
        .unwrap_err();
    assert!(matches!(err, Error::NoDevices));
    assert!(err.is_fatal());

    let (ctx, rt) = sim_context(2, config);
    assert!(matches!(
        ctx.initialize(&InitOptions::new([0, 1, 1])),
        Err(Error::TooManyDevices {
            requested: 3,
            available: 2
        })
    ));
    assert!(matches!(
        ctx.initialize(&InitOptions::new([4])),
        Err(Error::InvalidDevice { index: 4, .. })
    ));
    rt.inject_fault(1, FaultSite::CreateStream);
    let err = ctx.initialize(&InitOptions::new([0, 1])).unwrap_err();
    assert!(err.is_fatal());
    assert!(!ctx.is_initialized());
    assert_eq!(rt.live_allocations(0), 0);
    assert_eq!(rt.live_allocations(1), 0);
}

#[test]
fn test_without_self_init_calls_stay_on_host() {
    let (ctx, rt) = sim_context(1, small_problem_config().with_self_init(false));
    let p = Problem::<Complex64>::new(Transpose::ConjTrans, Transpose::NoTrans, (48, 48, 48), 0, 4);
    let report = p.check(&ctx, "no self init");
    assert_eq!(report.strategy, Strategy::CpuOnly);
    assert_eq!(rt.stats().streams_created, 0);

    ctx.initialize(&InitOptions::new([0])).unwrap();
    let report = p.check(&ctx, "explicit init");
    assert!(report.strategy.needs_devices());
}

// ============================================================================
// Capacity partitioning
// ============================================================================

#[test]
fn test_small_scratch_bisects_the_long_axis() {
    let config = small_problem_config().with_split(GemmKind::Double, 0.5);
    let (ctx, rt) = sim_context(1, config);
    ctx.initialize(&InitOptions::new([0])).unwrap();
    // 64x64x64 split along A at 0.5 needs 64 KiB. Each 32x64 half is then
    // split along B and needs exactly 40 KiB.
    ctx.set_scratch_capacity(0, 40 * 1024).unwrap();

    let p = Problem::<f64>::new(Transpose::NoTrans, Transpose::NoTrans, (64, 64, 64), 2, 5);
    let report = p.check(&ctx, "bisected");
    assert_eq!(report.splitting_steps, 1);
    assert_eq!(report.hybrid_runs, 2);
    assert_eq!(report.max_depth, 1);
    assert_eq!(rt.stats().kernels, 2);

    // one byte less and the halves are halved again along B
    ctx.set_scratch_capacity(0, 40 * 1024 - 1).unwrap();
    let report = p.check(&ctx, "bisected twice");
    assert_eq!(report.splitting_steps, 3);
    assert_eq!(report.hybrid_runs, 4);
    assert_eq!(report.max_depth, 2);
}

#[test]
fn test_unsplittable_piece_falls_back_to_host() {
    let config = Config::default().with_thresholds(1, 4096);
    let (ctx, rt) = sim_context(1, config);
    ctx.initialize(&InitOptions::new([0])).unwrap();
    ctx.set_scratch_capacity(0, 256).unwrap();

    // every piece of a 1-row problem with a long K overflows 256 bytes
    let p = Problem::<f64>::new(Transpose::NoTrans, Transpose::NoTrans, (1, 1, 512), 0, 6);
    let report = p.check(&ctx, "host fallback");
    assert_eq!(report.host_runs, 1);
    assert_eq!(report.hybrid_runs, 0);
    assert_eq!(rt.stats().kernels, 0);
}

#[test]
fn test_scratch_capacity_requires_initialization() {
    let (ctx, _rt) = sim_context(1, Config::default());
    assert!(matches!(
        ctx.set_scratch_capacity(0, 1024),
        Err(Error::NotInitialized)
    ));
}

// ============================================================================
// Device failures
// ============================================================================

#[test]
fn test_slot_failures_are_reported_not_raised() {
    let config = small_problem_config()
        .with_multi_device(true)
        .with_split(GemmKind::Double, 0.5);
    let (ctx, rt) = sim_context(2, config);
    ctx.initialize(&InitOptions::new([0, 1])).unwrap();
    rt.inject_fault(1, FaultSite::Kernel);

    let p = Problem::<f64>::new(Transpose::NoTrans, Transpose::NoTrans, (64, 32, 32), 0, 7);
    let (report, c) = p.run(&ctx);
    assert!(report.is_degraded());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].device, 1);
    assert_eq!(report.failures[0].slot, 1);
    assert!(report.failures[0].to_string().contains("device gemm"));

    // device share 32 rows: slot 0 owns rows 0..16, slot 1 rows 16..32
    let expected = p.expected();
    let (m, n) = (p.m, p.n);
    let (rtol, atol) = tolerance::<f64>();
    for j in 0..n {
        for i in (0..16).chain(32..m) {
            let (x, y) = (c[j * m + i], expected[j * m + i]);
            assert!((x - y).abs() <= atol + rtol * y.abs(), "({i}, {j})");
        }
    }

    rt.clear_faults();
    let report = p.check(&ctx, "recovered");
    assert!(!report.is_degraded());
}

#[test]
fn test_special_k_failure_is_an_error() {
    let config = Config::default()
        .with_thresholds(8, 32)
        .with_special_k(true);
    let (ctx, rt) = sim_context(1, config);
    ctx.initialize(&InitOptions::new([0])).unwrap();
    rt.inject_fault(0, FaultSite::HostToDevice);
    let p = Problem::<f32>::new(Transpose::NoTrans, Transpose::NoTrans, (16, 16, 128), 0, 8);
    let mut c = p.c.clone();
    let err = ctx
        .sgemm(
            p.op_a, p.op_b, p.m, p.n, p.k, p.alpha, &p.a, p.lda, &p.b, p.ldb, p.beta, &mut c, p.ldc,
        )
        .unwrap_err();
    assert!(matches!(err, Error::DeviceOperation { device: 0, .. }));
    assert!(!err.is_fatal());
}
