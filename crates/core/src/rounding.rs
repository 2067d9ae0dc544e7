//! Channel rounding.
//!
//! Channel counts are kept at multiples of `divisor` (8 by default) so the
//! convolution kernels map cleanly onto vector lanes.

/// Round `v` to the nearest multiple of `divisor`, never dropping more than
/// 10% below `v` and never below `min_value` (defaults to `divisor`).
///
/// Ties round up: `v + divisor / 2` is truncated before snapping.
pub fn make_divisible(v: f64, divisor: usize, min_value: Option<usize>) -> usize {
    let min_value = min_value.unwrap_or(divisor);
    let half = divisor as f64 / 2.0;
    let snapped = ((v + half) as usize / divisor) * divisor;
    let mut new_v = snapped.max(min_value);
    if (new_v as f64) < 0.9 * v {
        new_v += divisor;
    }
    new_v
}
