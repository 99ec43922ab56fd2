//! Split ratios, size thresholds and the self-tuning rule
//!
//! The split ratio of a kind is the fraction of the long GEMM axis sent to
//! the devices; the host computes the rest. After a profiled hybrid run the
//! slot-0 timings can move the ratio toward the point where device work
//! (copies in, kernel, copy out) takes as long as the host share:
//!
//! ```text
//! imbalance = h2d + device + d2h - host
//!
//! imbalance >  +pos_tol   device overloaded: shrink split by a tiered step
//! imbalance <  -neg_tol   device underused:  split = (last_positive + 2*split) / 3
//! otherwise               unchanged
//! ```
//!
//! The growth step is damped toward the last split that overloaded the
//! device, so the ratio approaches the balance point from both sides without
//! oscillating past it.

use crate::config::Config;
use crate::dtype::GemmKind;
use crate::error::{Error, Result};

/// Smallest split the tuner will produce
pub const MIN_SPLIT: f32 = 0.001;

/// Measured durations of one hybrid slot, in seconds
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SlotTiming {
    /// Host-to-device staging of A, B and (optionally) C
    pub h2d: f64,
    /// Device GEMM
    pub device: f64,
    /// Device-to-host copy of C
    pub d2h: f64,
    /// Host GEMM on the complementary slice
    pub host: f64,
}

impl SlotTiming {
    /// Device path time minus host time
    #[inline]
    pub fn imbalance(&self) -> f64 {
        self.device_path() - self.host
    }

    /// Total device path time
    #[inline]
    pub fn device_path(&self) -> f64 {
        self.h2d + self.device + self.d2h
    }
}

/// Per-kind split ratio and tuner bookkeeping
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct KindTuning {
    /// Current device share of the long axis
    pub split: f32,
    /// Split before the last adjustment
    pub previous: f32,
    /// Last split at which the device was overloaded
    pub last_positive: f32,
}

impl KindTuning {
    fn new(split: f32) -> Self {
        Self {
            split,
            previous: split,
            last_positive: 1.0,
        }
    }
}

/// Tuning state of one dispatch context
#[derive(Clone, Debug, PartialEq)]
pub struct TuningState {
    kinds: [KindTuning; 4],
    lower_threshold: usize,
    upper_threshold: usize,
    special_k_block: usize,
    positive_tol: f64,
    negative_tol: f64,
}

impl Default for TuningState {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl TuningState {
    /// Initial state from a validated configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            kinds: config.splits.map(KindTuning::new),
            lower_threshold: config.lower_threshold,
            upper_threshold: config.upper_threshold,
            special_k_block: config.special_k_block,
            positive_tol: config.tune_positive_tol,
            negative_tol: config.tune_negative_tol,
        }
    }

    /// Current split of `kind`
    #[inline]
    pub fn split(&self, kind: GemmKind) -> f32 {
        self.kinds[kind.index()].split
    }

    /// Split and tuner bookkeeping of `kind`
    #[inline]
    pub fn kind(&self, kind: GemmKind) -> KindTuning {
        self.kinds[kind.index()]
    }

    /// Replace every split ratio, indexed by [`GemmKind::index`].
    ///
    /// All values must lie in `(0, 1]`; nothing changes otherwise. Tuner
    /// bookkeeping restarts from the new values.
    pub fn set_split_factors(&mut self, splits: [f32; 4]) -> Result<()> {
        if let Some(&value) = splits.iter().find(|&&s| !(s > 0.0 && s <= 1.0)) {
            return Err(Error::InvalidSplit { value });
        }
        self.kinds = splits.map(KindTuning::new);
        Ok(())
    }

    /// Dimensions below this run on the host
    #[inline]
    pub fn lower_threshold(&self) -> usize {
        self.lower_threshold
    }

    /// K-split gate
    #[inline]
    pub fn upper_threshold(&self) -> usize {
        self.upper_threshold
    }

    /// K tile length of the K-split strategy
    #[inline]
    pub fn special_k_block(&self) -> usize {
        self.special_k_block
    }

    /// Feed one slot timing into the tuner of `kind`; returns the new split
    pub fn self_tune(&mut self, kind: GemmKind, timing: &SlotTiming) -> f32 {
        let imbalance = timing.imbalance();
        let state = &mut self.kinds[kind.index()];
        let split = state.split;

        let next = if imbalance > self.positive_tol {
            let magnitude = imbalance.abs();
            let step = if magnitude > 0.1 {
                0.005
            } else if magnitude > 0.03 {
                0.002
            } else {
                0.001
            };
            state.last_positive = split;
            state.previous = split;
            split - step
        } else if imbalance < -self.negative_tol {
            state.previous = split;
            (state.last_positive + 2.0 * split) / 3.0
        } else {
            return split;
        };

        state.split = next.clamp(MIN_SPLIT, 1.0);
        tracing::trace!(
            %kind,
            imbalance,
            previous = split,
            split = state.split,
            "adjusting split factor"
        );
        state.split
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(device: f64, host: f64) -> SlotTiming {
        SlotTiming {
            h2d: 0.0,
            device,
            d2h: 0.0,
            host,
        }
    }

    #[test]
    fn test_imbalance_compares_device_path_with_host() {
        let t = SlotTiming {
            h2d: 0.25,
            device: 1.0,
            d2h: 0.25,
            host: 2.0,
        };
        assert_eq!(t.device_path(), 1.5);
        assert_eq!(t.imbalance(), -0.5);
    }

    #[test]
    fn test_overloaded_device_shrinks_split_in_tiers() {
        let mut t = TuningState::default();
        let kind = GemmKind::Double;
        let s0 = t.split(kind);

        let s1 = t.self_tune(kind, &timing(0.5, 0.1));
        assert!((s0 - s1 - 0.005).abs() < 1e-6);
        assert_eq!(t.kind(kind).last_positive, s0);

        let s2 = t.self_tune(kind, &timing(0.15, 0.1));
        assert!((s1 - s2 - 0.002).abs() < 1e-6);

        let s3 = t.self_tune(kind, &timing(0.11, 0.1));
        assert!((s2 - s3 - 0.001).abs() < 1e-6);
        assert_eq!(t.kind(kind).previous, s2);
    }

    #[test]
    fn test_underused_device_grows_toward_last_positive() {
        let mut t = TuningState::default();
        let kind = GemmKind::Single;
        t.set_split_factors([0.4, 0.5, 0.5, 0.5]).unwrap();
        // last_positive starts at 1.0
        let s = t.self_tune(kind, &timing(0.1, 0.5));
        assert!((s - (1.0 + 0.8) / 3.0).abs() < 1e-6);
        assert_eq!(t.kind(kind).previous, 0.4);
    }

    #[test]
    fn test_within_tolerance_is_unchanged() {
        let mut t = TuningState::default();
        let kind = GemmKind::ComplexSingle;
        let s0 = t.split(kind);
        assert_eq!(t.self_tune(kind, &timing(0.1003, 0.1)), s0);
        assert_eq!(t.self_tune(kind, &timing(0.1, 0.1008)), s0);
        // other kinds are untouched by tuning this one
        assert_eq!(t.split(GemmKind::Double), 0.875);
    }

    #[test]
    fn test_split_is_clamped() {
        let mut t = TuningState::default();
        t.set_split_factors([0.001, 1.0, 1.0, 1.0]).unwrap();
        assert_eq!(t.self_tune(GemmKind::Single, &timing(1.0, 0.0)), MIN_SPLIT);
        assert!(t.self_tune(GemmKind::Double, &timing(0.0, 1.0)) <= 1.0);
    }

    #[test]
    fn test_set_split_factors_validates() {
        let mut t = TuningState::default();
        let before = t.clone();
        assert!(matches!(
            t.set_split_factors([0.5, 0.0, 0.5, 0.5]),
            Err(Error::InvalidSplit { value }) if value == 0.0
        ));
        assert!(t.set_split_factors([0.5, f32::NAN, 0.5, 0.5]).is_err());
        assert_eq!(t, before);
        t.set_split_factors([1.0, 0.25, 0.5, 0.75]).unwrap();
        assert_eq!(t.split(GemmKind::ComplexDouble), 0.75);
    }

    #[test]
    fn test_converges_to_balance_point() {
        // device time 2s per unit of split, host time 1s per unit of
        // remaining work: balanced at split = 1/3
        let mut t = TuningState::default();
        let kind = GemmKind::Double;
        for _ in 0..1000 {
            let s = t.split(kind) as f64;
            t.self_tune(kind, &timing(2.0 * s, 1.0 - s));
        }
        let s = t.split(kind) as f64;
        assert!((s - 1.0 / 3.0).abs() < 0.01, "split {s}");

        // and stays there
        for _ in 0..100 {
            let s = t.split(kind) as f64;
            t.self_tune(kind, &timing(2.0 * s, 1.0 - s));
            assert!((t.split(kind) as f64 - 1.0 / 3.0).abs() < 0.01);
        }
    }
}
