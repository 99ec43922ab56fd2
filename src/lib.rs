//! # hybridgemm
//!
//! **CPU/GPU hybrid GEMM with memory-bounded partitioning and stream overlap.**
//!
//! hybridgemm computes `C = alpha*op(A)*op(B) + beta*C` by sharing the work
//! between the host and one or more accelerators. The long output axis is
//! split by a per-kind ratio: devices compute their share on dedicated
//! streams while the host BLAS computes the rest, and the ratio can tune
//! itself from measured timings.
//!
//! ## Features
//!
//! - **Four kinds**: `f32`, `f64`, `Complex64`, `Complex128` through one
//!   generic [`GemmScalar`](dtype::GemmScalar) path
//! - **Multi-device, multi-stream**: one slot per (device, stream) pair
//! - **Capacity partitioning**: problems larger than device scratch are
//!   halved recursively
//! - **K-split**: long inner dimensions are tiled through double buffers
//! - **Self-tuning**: split ratios follow the host/device balance
//! - **Profiling**: per-call records to CSV or memory
//!
//! ## Quick Start
//!
//! ```rust
//! use hybridgemm::prelude::*;
//! use hybridgemm::runtime::sim::SimRuntime;
//!
//! let ctx = HybridGemm::new(SimRuntime::new(1, 256 << 20));
//! ctx.initialize(&InitOptions::new([0]))?;
//!
//! let a = vec![1.0f32; 4];
//! let b = vec![1.0f32; 4];
//! let mut c = vec![0.0f32; 4];
//! ctx.sgemm(Transpose::NoTrans, Transpose::NoTrans, 2, 2, 2,
//!           1.0, &a, 2, &b, 2, 0.0, &mut c, 2)?;
//! assert_eq!(c, [2.0; 4]);
//! # Ok::<(), Error>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `rayon` (default): Multi-threaded host kernel
//! - `cuda`: NVIDIA devices through the CUDA driver and cuBLAS

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dispatch;
pub mod dtype;
pub mod error;
pub mod matrix;
pub mod partition;
pub mod pipeline;
pub mod profile;
pub mod registry;
pub mod request;
pub mod runtime;
pub mod special_k;
pub mod strategy;
pub mod tuning;

pub use dispatch::{GemmReport, HybridGemm};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, ExecutionMode};
    pub use crate::dispatch::{GemmReport, HybridGemm};
    pub use crate::dtype::{Complex64, Complex128, GemmKind, GemmScalar};
    pub use crate::error::{Error, Result};
    pub use crate::matrix::{MatMut, MatRef, Transpose};
    pub use crate::profile::{CsvProfileSink, MemoryProfileSink, ProfileRecord, ProfileSink};
    pub use crate::registry::{ExternalScratch, InitOptions};
    pub use crate::runtime::{DeviceRuntime, HostBlas, ReferenceBlas};
    pub use crate::strategy::{SplitAxis, Strategy};

    #[cfg(feature = "cuda")]
    pub use crate::runtime::cuda::CudaRuntime;
}
