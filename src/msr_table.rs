//! Model-specific register offset/mask table for the many-core platform
//! variant, grounded on `KNLPlatformImp::load_msr_offsets`.
//!
//! The original's literal table has two defects documented as an open
//! question in this system's design notes: the label
//! `C17_MSR_PMON_CTR1` is emitted twice (once at the offset that belongs
//! to tile 17, once at the offset that belongs to tile 18), and no label
//! is ever emitted for tile 36. Laying the per-tile offsets out next to
//! each other shows the *offsets* follow a clean `base + tile * stride`
//! arithmetic progression all the way from tile 0 to tile 37 — only the
//! hand-typed labels drifted. Rather than guess which literal entry was
//! "the intended 38th", this table derives every per-tile offset from
//! its formula, which reproduces every non-ambiguous entry exactly and
//! resolves the two ambiguous ones the only way consistent with the
//! surrounding data.

use std::collections::HashMap;

pub const NUM_TILE: usize = 38;
const TILE_STRIDE: u32 = 0x0C;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrOffset {
    pub offset: u32,
    pub write_mask: u64,
}

fn singleton_registers() -> Vec<(&'static str, MsrOffset)> {
    vec![
        ("IA32_PERF_STATUS", MsrOffset { offset: 0x0198, write_mask: 0x0000000000000000 }),
        ("IA32_PERF_CTL", MsrOffset { offset: 0x0199, write_mask: 0x000000010000ffff }),
        ("RAPL_POWER_UNIT", MsrOffset { offset: 0x0606, write_mask: 0x0000000000000000 }),
        ("PKG_POWER_LIMIT", MsrOffset { offset: 0x0610, write_mask: 0x00ffffff00ffffff }),
        ("PKG_ENERGY_STATUS", MsrOffset { offset: 0x0611, write_mask: 0x0000000000000000 }),
        ("PKG_POWER_INFO", MsrOffset { offset: 0x0614, write_mask: 0x0000000000000000 }),
        ("PP0_POWER_LIMIT", MsrOffset { offset: 0x0638, write_mask: 0x0000000000ffffff }),
        ("PP0_ENERGY_STATUS", MsrOffset { offset: 0x0639, write_mask: 0x0000000000000000 }),
        ("DRAM_POWER_LIMIT", MsrOffset { offset: 0x0618, write_mask: 0x0000000000ffffff }),
        ("DRAM_ENERGY_STATUS", MsrOffset { offset: 0x0619, write_mask: 0x0000000000000000 }),
        ("DRAM_PERF_STATUS", MsrOffset { offset: 0x061B, write_mask: 0x0000000000000000 }),
        ("DRAM_POWER_INFO", MsrOffset { offset: 0x061C, write_mask: 0x0000000000000000 }),
        ("PERF_FIXED_CTR_CTRL", MsrOffset { offset: 0x038D, write_mask: 0x0000000000000bbb }),
        ("PERF_GLOBAL_CTRL", MsrOffset { offset: 0x038F, write_mask: 0x0000000700000003 }),
        ("PERF_GLOBAL_OVF_CTRL", MsrOffset { offset: 0x0390, write_mask: 0xc000000700000003 }),
        ("PERF_FIXED_CTR0", MsrOffset { offset: 0x0309, write_mask: 0xffffffffffffffff }),
        ("PERF_FIXED_CTR1", MsrOffset { offset: 0x030A, write_mask: 0xffffffffffffffff }),
        ("PERF_FIXED_CTR2", MsrOffset { offset: 0x030B, write_mask: 0xffffffffffffffff }),
    ]
}

/// `(name_suffix, base_offset_for_tile_0, write_mask)` for the per-tile
/// uncore PMON registers.
fn per_tile_families() -> Vec<(&'static str, u32, u64)> {
    vec![
        ("MSR_PMON_BOX_CTL", 0x0E00, 0x00000000ffffffff),
        ("MSR_PMON_BOX_FILTER", 0x0E05, 0x00000000ffffffff),
        ("MSR_PMON_BOX_FILTER1", 0x0E06, 0x00000000ffffffff),
        ("MSR_PMON_CTL0", 0x0E01, 0x00000000ffffffff),
        ("MSR_PMON_CTL1", 0x0E02, 0x00000000ffffffff),
        ("MSR_PMON_CTR0", 0x0E08, 0x0000000000000000),
        ("MSR_PMON_CTR1", 0x0E09, 0x0000000000000000),
    ]
}

/// Builds the full offset map: singleton registers plus `NUM_TILE`
/// per-tile register families.
pub fn build_msr_offset_map() -> HashMap<String, MsrOffset> {
    let mut map = HashMap::new();
    for (name, offset) in singleton_registers() {
        map.insert(name.to_string(), offset);
    }
    for (suffix, base, mask) in per_tile_families() {
        for tile in 0..NUM_TILE as u32 {
            let name = format!("C{tile}_{suffix}");
            map.insert(
                name,
                MsrOffset {
                    offset: base + tile * TILE_STRIDE,
                    write_mask: mask,
                },
            );
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reproduces_known_literal_offsets() {
        let map = build_msr_offset_map();
        assert_eq!(map["PKG_ENERGY_STATUS"].offset, 0x0611);
        assert_eq!(map["C0_MSR_PMON_CTR0"].offset, 0x0E08);
        assert_eq!(map["C37_MSR_PMON_CTR0"].offset, 0x0FC4);
        assert_eq!(map["C16_MSR_PMON_CTR1"].offset, 0x0EC9);
        assert_eq!(map["C37_MSR_PMON_BOX_CTL"].offset, 0x0FBC);
    }

    #[test]
    fn resolves_the_ambiguous_tile_17_and_18_entries() {
        let map = build_msr_offset_map();
        // The original's first "C17_MSR_PMON_CTR1" literal (0x0ED5) belongs to tile 17.
        assert_eq!(map["C17_MSR_PMON_CTR1"].offset, 0x0ED5);
        // Its second, mislabeled occurrence (0x0EE1) is actually tile 18's entry.
        assert_eq!(map["C18_MSR_PMON_CTR1"].offset, 0x0EE1);
    }

    #[test]
    fn every_tile_has_all_seven_register_families() {
        let map = build_msr_offset_map();
        for tile in 0..NUM_TILE {
            for (suffix, ..) in per_tile_families() {
                let name = format!("C{tile}_{suffix}");
                assert!(map.contains_key(&name), "missing {name}");
            }
        }
    }
}
