//! Capacity partitioning
//!
//! A GPU-assisted GEMM is run as one hybrid step only if the operand blocks
//! of the busiest slot fit in the smallest slot scratch region. Otherwise
//! the long axis is halved and each half is dispatched again, which bounds
//! the recursion depth by `⌈log2(dim)⌉`.
//!
//! Footprints are counted in elements, each operand padded to an even count
//! so that consecutive device blocks stay 2-element aligned.

use crate::strategy::SplitAxis;

/// Round an element count up to an even number
#[inline]
pub const fn even(elements: usize) -> usize {
    elements.saturating_add(elements & 1)
}

/// Device share of the long axis for `split`
#[inline]
pub fn device_share(dim: usize, split: f32) -> usize {
    ((dim as f64 * split as f64).floor() as usize).min(dim)
}

/// Share of the busiest slot: slot 0 receives the division remainder
#[inline]
pub fn busiest_slot_share(device_share: usize, slots: usize) -> usize {
    let slots = slots.max(1);
    device_share / slots + device_share % slots
}

/// Elements one slot must hold for an `m x n x k` GEMM split along `axis`.
///
/// `split < 1` counts the blocks of the busiest of `slots` slots;
/// `split >= 1` counts the full operands.
pub fn estimate_footprint(
    axis: SplitAxis,
    split: f32,
    m: usize,
    n: usize,
    k: usize,
    slots: usize,
) -> usize {
    let sum = |a: usize, b: usize, c: usize| even(a).saturating_add(even(b)).saturating_add(even(c));
    if split >= 1.0 {
        return sum(m.saturating_mul(k), k.saturating_mul(n), m.saturating_mul(n));
    }
    let share = busiest_slot_share(device_share(axis.extent(m, n), split), slots);
    match axis {
        SplitAxis::A => sum(share.saturating_mul(k), k.saturating_mul(n), share.saturating_mul(n)),
        SplitAxis::B => sum(m.saturating_mul(k), k.saturating_mul(share), m.saturating_mul(share)),
    }
}

/// Footprint in bytes for elements of `element_size` bytes
#[inline]
pub fn footprint_bytes(elements: usize, element_size: usize) -> usize {
    elements.saturating_mul(element_size)
}

/// Halve a dimension: `(dim / 2, dim - dim / 2)`
#[inline]
pub fn bisect(dim: usize) -> (usize, usize) {
    let p1 = dim / 2;
    (p1, dim - p1)
}

/// What to do with a GPU-assisted piece
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Operands fit: run the hybrid pipeline
    Hybrid,
    /// Too big: dispatch the two halves of the long axis separately
    Bisect {
        /// Length of the first half
        first: usize,
        /// Length of the second half
        second: usize,
    },
    /// Too big and the long axis cannot be halved: run on the host
    Host,
}

/// Decide how to run a GPU-assisted piece against a slot capacity in bytes
pub fn plan(
    axis: SplitAxis,
    split: f32,
    (m, n, k): (usize, usize, usize),
    slots: usize,
    capacity: usize,
    element_size: usize,
) -> Plan {
    let needed = footprint_bytes(estimate_footprint(axis, split, m, n, k, slots), element_size);
    if needed <= capacity {
        return Plan::Hybrid;
    }
    let dim = axis.extent(m, n);
    if dim < 2 {
        tracing::warn!(
            m,
            n,
            k,
            needed,
            capacity,
            "piece cannot be split further and does not fit; running on host"
        );
        return Plan::Host;
    }
    let (first, second) = bisect(dim);
    tracing::debug!(
        m,
        n,
        k,
        ?axis,
        needed,
        capacity,
        first,
        second,
        "too big to fit, bisecting"
    );
    Plan::Bisect { first, second }
}
