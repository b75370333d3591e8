//! Overflow compensation for monotonically-wrapping hardware counters.
//!
//! Grounded on `KNLPlatformImp::read_signal`'s `msr_overflow(offset_idx,
//! width, raw)` calls: each counter has a bit width `w ∈ {32, 48, 64}`;
//! when a new raw read is smaller than the last one seen, the counter
//! wrapped, and `2^w` is folded into an accumulator so the reported value
//! stays monotonically non-decreasing.

/// Per-counter overflow bookkeeping (spec section 3: `{last_value,
/// accumulated_overflow}`).
#[derive(Debug, Clone, Copy, Default)]
struct OverflowEntry {
    last_raw: u64,
    accumulated: u64,
    seen: bool,
}

/// Table of overflow entries indexed by signal offset, mutated only from
/// the single control thread that owns the owning `PlatformImp`.
#[derive(Debug, Clone)]
pub struct OverflowTable {
    entries: Vec<OverflowEntry>,
}

impl OverflowTable {
    pub fn new(num_signal: usize) -> Self {
        OverflowTable {
            entries: vec![OverflowEntry::default(); num_signal],
        }
    }

    /// Returns the overflow-compensated value for `index`, given the raw
    /// counter reading `raw` over a counter of bit width `width`.
    ///
    /// Idempotent only when called at a rate higher than the counter's
    /// wrap period, per spec section 4.1 — callers must sample often
    /// enough that at most one wrap occurs between reads.
    pub fn compensate(&mut self, index: usize, width: u8, raw: u64) -> f64 {
        let entry = &mut self.entries[index];
        let span = 1u128 << width;

        if entry.seen && (raw as u128) < (entry.last_raw as u128) {
            entry.accumulated = entry
                .accumulated
                .wrapping_add(span as u64);
        }
        entry.last_raw = raw;
        entry.seen = true;

        (entry.accumulated as f64) + (raw as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_s3_single_wrap_at_width_32() {
        let mut table = OverflowTable::new(1);
        assert_eq!(table.compensate(0, 32, 0xFFFF_FFF0), 0xFFFF_FFF0 as f64);
        assert_eq!(table.compensate(0, 32, 0x0000_0010), 0x1_0000_0010u64 as f64);
        assert_eq!(table.compensate(0, 32, 0x0000_0020), 0x1_0000_0020u64 as f64);
    }

    #[test]
    fn monotonic_non_decreasing_across_many_wraps_all_widths() {
        for width in [32u8, 48, 64] {
            let mut table = OverflowTable::new(1);
            let mut prev = f64::MIN;
            let mut raw: u64 = 0;
            let span: u128 = 1u128 << width.min(63);
            let step: u64 = if width == 64 { u64::MAX / 8 } else { (span / 8) as u64 };
            for i in 0..40u64 {
                raw = raw.wrapping_add(step);
                if width < 64 {
                    raw %= span as u64;
                }
                let value = table.compensate(0, width, raw);
                assert!(value >= prev, "value decreased at iteration {i}");
                prev = value;
            }
        }
    }

    #[test]
    fn equals_true_count_modulo_width_for_single_wrap() {
        let mut table = OverflowTable::new(1);
        let width = 48u8;
        let span = 1u64 << width;
        let true_count = span + 1000;
        table.compensate(0, width, span - 1);
        let observed = table.compensate(0, width, 999);
        assert_eq!(observed as u64 % span, true_count % span);
    }
}
