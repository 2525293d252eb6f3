//! Virtual-time arithmetic.
//!
//! Virtual time is a 64-bit unsigned counter that wraps. All comparisons go
//! through [`ts_gt`], which compares by signed difference so that ordering
//! survives wraparound. Raw `<` / `>` on timestamps is never correct here.

/// A point on a service tree's virtual clock, or an entity timestamp.
pub type Timestamp = u64;

/// Shift for timestamp calculations. This limits the maximum service
/// chargeable in one timestamp delta (small values increase it), the maximum
/// total weight usable in the system (big values increase it), and the period
/// of virtual-time wraparounds.
pub const SERVICE_SHIFT: u32 = 22;

/// Compare two timestamps, dealing with wrapping correctly.
///
/// Returns `a > b` in the wrap-safe sense.
#[inline]
pub fn ts_gt(a: Timestamp, b: Timestamp) -> bool {
    (a.wrapping_sub(b) as i64) > 0
}

/// Wrap-safe maximum of two timestamps.
#[inline]
pub fn ts_max(a: Timestamp, b: Timestamp) -> Timestamp {
    if ts_gt(a, b) { a } else { b }
}

/// Map an amount of service into the virtual-time domain.
///
/// `weight` is the scale factor: the weight of an entity, or the weight sum
/// of a service tree. The intermediate product is computed in 128 bits so the
/// shift cannot overflow.
#[inline]
pub fn service_delta(service: u64, weight: u64) -> Timestamp {
    debug_assert!(weight != 0, "service_delta with zero weight");
    (((service as u128) << SERVICE_SHIFT) / weight as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gt_is_wrap_safe() {
        assert!(ts_gt(2, 1));
        assert!(!ts_gt(1, 2));
        assert!(!ts_gt(5, 5));
        // 1 is "after" u64::MAX - 1 once the counter wraps
        assert!(ts_gt(1, u64::MAX - 1));
        assert!(!ts_gt(u64::MAX - 1, 1));
    }

    #[test]
    fn max_follows_wrap_order() {
        assert_eq!(ts_max(10, 20), 20);
        assert_eq!(ts_max(3, u64::MAX - 3), 3);
    }

    #[test]
    fn delta_scales_inversely_with_weight() {
        let d1 = service_delta(512, 100);
        let d2 = service_delta(512, 300);
        assert_eq!(d1, (512u64 << SERVICE_SHIFT) / 100);
        // triple the weight, a third of the vtime charge
        assert!(d1 / d2 >= 2 && d1 / d2 <= 3);
    }

    #[test]
    fn delta_survives_large_service() {
        // service << SERVICE_SHIFT would overflow u64 for services past 2^42
        let d = service_delta(1 << 50, 1 << 20);
        assert_eq!(d, 1 << 52);
    }
}
