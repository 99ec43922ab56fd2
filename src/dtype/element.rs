//! GemmScalar trait for mapping Rust types to GemmKind

use super::{Complex64, Complex128, GemmKind};
use bytemuck::{Pod, Zeroable};
use std::fmt::Debug;
use std::ops::{Add, Mul, Sub};

/// Trait for element types a GEMM can be dispatched on
///
/// One generic algorithm (strategy, partitioning, pipeline) is instantiated
/// per implementor; everything type-specific lives here.
///
/// # Bounds
/// - `Pod + Zeroable` - device copies move raw bytes (bytemuck)
/// - `Add + Sub + Mul` - host kernel arithmetic (Output = Self)
/// - `PartialEq` - detects `beta == 0` and `alpha == 0`
pub trait GemmScalar:
    Copy
    + Clone
    + Send
    + Sync
    + Pod
    + Zeroable
    + Debug
    + PartialEq
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
{
    /// The kind tag for this type
    const KIND: GemmKind;

    /// Zero value
    fn zero() -> Self;

    /// One value
    fn one() -> Self;

    /// Complex conjugate (identity for real types)
    fn conj(self) -> Self;

    /// Build a value from real and imaginary parts.
    ///
    /// Real types ignore `im`.
    fn from_parts(re: f64, im: f64) -> Self;

    /// Absolute value as f64 (magnitude for complex types)
    fn magnitude(self) -> f64;

    /// Returns true if this value equals zero
    #[inline]
    fn is_zero(self) -> bool {
        self == Self::zero()
    }
}

impl GemmScalar for f32 {
    const KIND: GemmKind = GemmKind::Single;

    #[inline]
    fn zero() -> Self {
        0.0
    }

    #[inline]
    fn one() -> Self {
        1.0
    }

    #[inline]
    fn conj(self) -> Self {
        self
    }

    #[inline]
    fn from_parts(re: f64, _im: f64) -> Self {
        re as f32
    }

    #[inline]
    fn magnitude(self) -> f64 {
        self.abs() as f64
    }
}

impl GemmScalar for f64 {
    const KIND: GemmKind = GemmKind::Double;

    #[inline]
    fn zero() -> Self {
        0.0
    }

    #[inline]
    fn one() -> Self {
        1.0
    }

    #[inline]
    fn conj(self) -> Self {
        self
    }

    #[inline]
    fn from_parts(re: f64, _im: f64) -> Self {
        re
    }

    #[inline]
    fn magnitude(self) -> f64 {
        self.abs()
    }
}

impl GemmScalar for Complex64 {
    const KIND: GemmKind = GemmKind::ComplexSingle;

    #[inline]
    fn zero() -> Self {
        Self::ZERO
    }

    #[inline]
    fn one() -> Self {
        Self::ONE
    }

    #[inline]
    fn conj(self) -> Self {
        Complex64::conj(self)
    }

    #[inline]
    fn from_parts(re: f64, im: f64) -> Self {
        Self::new(re as f32, im as f32)
    }

    #[inline]
    fn magnitude(self) -> f64 {
        Complex64::magnitude(self) as f64
    }
}

impl GemmScalar for Complex128 {
    const KIND: GemmKind = GemmKind::ComplexDouble;

    #[inline]
    fn zero() -> Self {
        Self::ZERO
    }

    #[inline]
    fn one() -> Self {
        Self::ONE
    }

    #[inline]
    fn conj(self) -> Self {
        Complex128::conj(self)
    }

    #[inline]
    fn from_parts(re: f64, im: f64) -> Self {
        Self::new(re, im)
    }

    #[inline]
    fn magnitude(self) -> f64 {
        Complex128::magnitude(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(<f32 as GemmScalar>::KIND, GemmKind::Single);
        assert_eq!(<f64 as GemmScalar>::KIND, GemmKind::Double);
        assert_eq!(Complex64::KIND, GemmKind::ComplexSingle);
        assert_eq!(Complex128::KIND, GemmKind::ComplexDouble);
    }

    #[test]
    fn test_conj_is_identity_for_reals() {
        assert_eq!(GemmScalar::conj(-2.5f64), -2.5);
        let z = <Complex128 as GemmScalar>::from_parts(1.0, 2.0);
        assert_eq!(GemmScalar::conj(z), Complex128::new(1.0, -2.0));
    }

    #[test]
    fn test_is_zero() {
        assert!(<f32 as GemmScalar>::zero().is_zero());
        assert!(!Complex64::new(0.0, 1.0).is_zero());
    }
}
