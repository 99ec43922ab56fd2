//! Strategy selection
//!
//! Classifies a GEMM by its dimensions alone. Small problems never amortize
//! the transfer latency and stay on the host; everything else is split along
//! its longer output axis. An optional third strategy tiles along K for
//! problems whose inner dimension dwarfs the output.

use crate::config::ExecutionMode;
use crate::tuning::TuningState;
use std::fmt;

/// Output axis whose device share is cut out by the split ratio
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SplitAxis {
    /// Rows of `op(A)` and of `C` (the M axis)
    A,
    /// Columns of `op(B)` and of `C` (the N axis)
    B,
}

impl SplitAxis {
    /// Larger output dimension; ties pick `A`
    #[inline]
    pub fn for_dims(m: usize, n: usize) -> Self {
        if m >= n { Self::A } else { Self::B }
    }

    /// Length of this axis for an `m x n` output
    #[inline]
    pub fn extent(self, m: usize, n: usize) -> usize {
        match self {
            Self::A => m,
            Self::B => n,
        }
    }
}

/// Routing decision for one GEMM
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Whole problem on the host
    CpuOnly,
    /// Long axis shared between devices and host
    GpuAssisted {
        /// Axis being split
        axis: SplitAxis,
    },
    /// K tiled through a double-buffered device region, accumulated on the host
    SpecialK,
}

impl Strategy {
    /// Returns true if the strategy needs an initialized device registry
    #[inline]
    pub fn needs_devices(self) -> bool {
        !matches!(self, Self::CpuOnly)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CpuOnly => f.write_str("cpu"),
            Self::GpuAssisted { axis: SplitAxis::A } => f.write_str("split-a"),
            Self::GpuAssisted { axis: SplitAxis::B } => f.write_str("split-b"),
            Self::SpecialK => f.write_str("special-k"),
        }
    }
}

/// Whether the K-split strategy may be selected
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum SpecialKPolicy {
    /// Never select `SpecialK`
    #[default]
    Disabled,
    /// Select `SpecialK` for long-K problems
    Enabled,
}

impl From<bool> for SpecialKPolicy {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

/// Pick a strategy for an `m x n x k` GEMM
pub fn select_strategy(
    m: usize,
    n: usize,
    k: usize,
    tuning: &TuningState,
    special_k: SpecialKPolicy,
) -> Strategy {
    let lower = tuning.lower_threshold();
    if m < lower || n < lower || k < lower {
        return Strategy::CpuOnly;
    }

    let upper = tuning.upper_threshold();
    if special_k == SpecialKPolicy::Enabled && k >= upper && m.max(n) < upper {
        return Strategy::SpecialK;
    }

    Strategy::GpuAssisted {
        axis: SplitAxis::for_dims(m, n),
    }
}

/// Apply an execution mode on top of [`select_strategy`]
pub fn select_for_mode(
    mode: ExecutionMode,
    m: usize,
    n: usize,
    k: usize,
    tuning: &TuningState,
    special_k: SpecialKPolicy,
) -> Strategy {
    match mode {
        ExecutionMode::CpuOnly => Strategy::CpuOnly,
        ExecutionMode::Hybrid | ExecutionMode::GpuOnly => {
            select_strategy(m, n, k, tuning, special_k)
        }
    }
}

/// Split ratio a GPU-assisted call uses under `mode`
#[inline]
pub fn effective_split(mode: ExecutionMode, tuned: f32) -> f32 {
    match mode {
        ExecutionMode::GpuOnly => 1.0,
        ExecutionMode::Hybrid | ExecutionMode::CpuOnly => tuned,
    }
}
