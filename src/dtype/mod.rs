//! Numeric kinds handled by the dispatcher
//!
//! Every GEMM entry point is instantiated for one of four element kinds:
//! real single, real double, complex single and complex double. The
//! [`GemmKind`] enum identifies the kind at runtime (tuning tables, profiling
//! rows, cuBLAS routine selection) and [`GemmScalar`] ties a Rust type to it.

pub mod complex;
mod element;

pub use complex::{Complex64, Complex128};
pub use element::GemmScalar;

use std::fmt;

/// Element kind of a GEMM call
///
/// The discriminant doubles as the index into per-kind tables such as the
/// split ratios held by [`TuningState`](crate::tuning::TuningState).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GemmKind {
    /// `f32`
    Single = 0,
    /// `f64`
    Double = 1,
    /// [`Complex64`] (two `f32`)
    ComplexSingle = 2,
    /// [`Complex128`] (two `f64`)
    ComplexDouble = 3,
}

impl GemmKind {
    /// All kinds in table order
    pub const ALL: [GemmKind; 4] = [
        Self::Single,
        Self::Double,
        Self::ComplexSingle,
        Self::ComplexDouble,
    ];

    /// Index into per-kind tables
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Size of one element in bytes
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::Single => 4,
            Self::Double | Self::ComplexSingle => 8,
            Self::ComplexDouble => 16,
        }
    }

    /// Returns true for the complex kinds
    #[inline]
    pub const fn is_complex(self) -> bool {
        matches!(self, Self::ComplexSingle | Self::ComplexDouble)
    }

    /// BLAS prefix letter (`s`, `d`, `c`, `z`)
    pub const fn letter(self) -> char {
        match self {
            Self::Single => 's',
            Self::Double => 'd',
            Self::ComplexSingle => 'c',
            Self::ComplexDouble => 'z',
        }
    }

    /// Floating point operations performed by an `m x n x k` GEMM.
    ///
    /// A GEMM issues `m*n*k` multiplications and `m*n*k` additions. A complex
    /// multiplication costs six real flops and a complex addition two.
    pub fn flops(self, m: usize, n: usize, k: usize) -> f64 {
        let muls = m as f64 * n as f64 * k as f64;
        let adds = muls;
        if self.is_complex() {
            6.0 * muls + 2.0 * adds
        } else {
            muls + adds
        }
    }

    /// Default host/device split ratio for this kind
    pub const fn default_split(self) -> f32 {
        match self {
            Self::Single => 0.85,
            Self::Double => 0.875,
            Self::ComplexSingle => 0.9,
            Self::ComplexDouble => 0.925,
        }
    }
}

impl fmt::Display for GemmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}gemm", self.letter())
    }
}
