//! Model-independent facade over a [`PlatformImp`], grounded on
//! `Platform.hpp`/`Platform.cpp`'s `tdp_limit`, `manual_frequency`, and
//! `sample` operations (spec section 4.2).

use crate::error::Result;
use crate::platform_imp::{
    ControlKind, Domain, FileMsrBackend, ManyCorePlatformImp, PlatformImp, SignalKind, Topology,
};
use crate::policy::Affinity;

/// One control-domain's worth of telemetry for a single control period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainSample {
    pub pkg_energy_j: f64,
    pub pp0_energy_j: f64,
    pub dram_energy_j: f64,
    pub frequency_mhz: f64,
    pub instructions_retired: f64,
    pub unhalted_core_cycles: f64,
    pub unhalted_ref_cycles: f64,
    pub read_bandwidth_bytes: f64,
}

/// Which control-domain granularity a request targets (spec section 4.2:
/// `num_domain(control_type)` returns 1 for package power, `num_tile` for
/// performance counters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    PackagePower,
    PerformanceCounter,
}

pub struct Platform<I: PlatformImp> {
    imp: I,
}

impl<I: PlatformImp> Platform<I> {
    pub fn new(imp: I) -> Self {
        Platform { imp }
    }

    pub fn imp_mut(&mut self) -> &mut I {
        &mut self.imp
    }

    pub fn num_domain(&self, control_type: ControlType) -> u32 {
        match control_type {
            ControlType::PackagePower => 1,
            ControlType::PerformanceCounter => self.imp.topology().num_tile,
        }
    }

    /// Sets PKG and DRAM power limits on every package to `percent / 100
    /// * tdp`, where `tdp` is the package's discovered thermal design
    /// power (its maximum RAPL bound).
    pub fn tdp_limit(&mut self, percent: u32) -> Result<()> {
        let num_package = self.imp.topology().num_package;
        let (_, pkg_tdp) = self.imp.pkg_power_bounds();
        let (_, dram_tdp) = self.imp.dram_power_bounds();
        let fraction = percent as f64 / 100.0;
        for pkg in 0..num_package {
            self.imp.write_control(Domain::Package, pkg, ControlKind::PkgPowerLimit, fraction * pkg_tdp)?;
            self.imp.write_control(Domain::Package, pkg, ControlKind::DramPowerLimit, fraction * dram_tdp)?;
        }
        Ok(())
    }

    /// The first `num_max_perf` logical CPUs, ordered by `affinity`,
    /// receive the platform's maximum P-state; the remainder receive
    /// `mhz` (spec section 4.2).
    pub fn manual_frequency(&mut self, mhz: u32, num_max_perf: u32, affinity: Affinity) -> Result<()> {
        let num_tile = self.imp.topology().num_tile;
        let order = affinity_order(num_tile, affinity);
        let (_, pkg_max) = self.imp.pkg_power_bounds();
        let _ = pkg_max; // max P-state is model-specific; reuse mhz scaling path below.
        for (rank, tile) in order.into_iter().enumerate() {
            let target_mhz = if (rank as u32) < num_max_perf {
                max_turbo_mhz()
            } else {
                mhz
            };
            self.imp.write_control(Domain::Tile, tile, ControlKind::Frequency, target_mhz as f64)?;
        }
        Ok(())
    }

    /// Reads one sample per logical tile and projects it into a
    /// per-domain vector (spec section 4.2).
    pub fn sample(&mut self) -> Result<Vec<DomainSample>> {
        let num_tile = self.imp.topology().num_tile;
        let mut out = Vec::with_capacity(num_tile as usize);
        for tile in 0..num_tile {
            out.push(DomainSample {
                pkg_energy_j: self.imp.read_signal(Domain::Package, tile.min(self.imp.topology().num_package - 1), SignalKind::PkgEnergy)?,
                pp0_energy_j: self.imp.read_signal(Domain::Package, tile.min(self.imp.topology().num_package - 1), SignalKind::Pp0Energy)?,
                dram_energy_j: self.imp.read_signal(Domain::Package, tile.min(self.imp.topology().num_package - 1), SignalKind::DramEnergy)?,
                frequency_mhz: self.imp.read_signal(Domain::Tile, tile, SignalKind::Frequency)?,
                instructions_retired: self.imp.read_signal(Domain::Tile, tile, SignalKind::InstructionsRetired)?,
                unhalted_core_cycles: self.imp.read_signal(Domain::Tile, tile, SignalKind::UnhaltedCoreCycles)?,
                unhalted_ref_cycles: self.imp.read_signal(Domain::Tile, tile, SignalKind::UnhaltedRefCycles)?,
                read_bandwidth_bytes: self.imp.read_signal(Domain::Tile, tile, SignalKind::ReadBandwidth)?,
            });
        }
        Ok(out)
    }
}

/// Maximum P-state in MHz. Model-specific in the original; kept as a
/// constant here since no decider needs to vary it.
fn max_turbo_mhz() -> u32 {
    3000
}

/// Builds the reference many-core `Platform` against the real
/// `/dev/cpu/*/msr` backend, for C ABI entry points that need a live
/// platform but are not handed one by a `Controller`. Topology discovery
/// from the OS is explicitly out of core scope (spec section 1); the
/// shape is instead read from environment variables, defaulting to a
/// single-package, 38-tile many-core topology matching the reference
/// `msr_table`.
pub fn default_platform() -> Result<Platform<ManyCorePlatformImp<FileMsrBackend>>> {
    let topology = Topology {
        num_package: env_u32("PWRCTL_NUM_PACKAGE", 1),
        num_tile: env_u32("PWRCTL_NUM_TILE", crate::msr_table::NUM_TILE as u32),
        num_logical_cpu: env_u32("PWRCTL_NUM_LOGICAL_CPU", crate::msr_table::NUM_TILE as u32 * 4),
        num_cpu_per_core: env_u32("PWRCTL_NUM_CPU_PER_CORE", 4),
    };
    let mut imp = ManyCorePlatformImp::new(FileMsrBackend::new(), topology);
    imp.msr_initialize()?;
    Ok(Platform::new(imp))
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn affinity_order(num_tile: u32, affinity: Affinity) -> Vec<u32> {
    match affinity {
        Affinity::Compact => (0..num_tile).collect(),
        Affinity::Scatter => {
            let mut order: Vec<u32> = Vec::with_capacity(num_tile as usize);
            let mut stride_order: Vec<u32> = (0..num_tile).step_by(2).collect();
            let mut odd_order: Vec<u32> = (1..num_tile).step_by(2).collect();
            order.append(&mut stride_order);
            order.append(&mut odd_order);
            order
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform_imp::{FakeMsrBackend, ManyCorePlatformImp, Topology};
    use crate::msr_table::{build_msr_offset_map, NUM_TILE};

    fn seeded_platform() -> Platform<ManyCorePlatformImp<FakeMsrBackend>> {
        let mut backend = FakeMsrBackend::default();
        let offsets = build_msr_offset_map();
        backend.registers.insert((0, offsets["RAPL_POWER_UNIT"].offset), 0);
        let info = (200u64 << 32) | (50u64 << 16);
        backend.registers.insert((0, offsets["PKG_POWER_INFO"].offset), info);
        backend.registers.insert((0, offsets["DRAM_POWER_INFO"].offset), info);
        let topology = Topology {
            num_package: 1,
            num_tile: NUM_TILE as u32,
            num_logical_cpu: NUM_TILE as u32 * 4,
            num_cpu_per_core: 4,
        };
        let mut imp = ManyCorePlatformImp::new(backend, topology);
        imp.msr_initialize().unwrap();
        Platform::new(imp)
    }

    #[test]
    fn tdp_limit_scales_from_discovered_bounds() {
        let mut platform = seeded_platform();
        platform.tdp_limit(50).unwrap();
        let raw = platform.imp_mut().msr_read_for_test(Domain::Package, 0, "PKG_POWER_LIMIT");
        let expected = 100u64 | (100u64 << 32) | 0x0007800000078000u64;
        assert_eq!(raw, expected);
    }

    #[test]
    fn manual_frequency_assigns_max_perf_then_remainder() {
        let mut platform = seeded_platform();
        platform.manual_frequency(1500, 4, Affinity::Compact).unwrap();
        for tile in 0..4u32 {
            let raw = platform.imp_mut().msr_read_for_test(Domain::Tile, tile, "IA32_PERF_CTL");
            assert_eq!(raw, (3000u64 * 10) << 8);
        }
        let raw = platform.imp_mut().msr_read_for_test(Domain::Tile, 10, "IA32_PERF_CTL");
        assert_eq!(raw, (1500u64 * 10) << 8);
    }

    #[test]
    fn sample_returns_one_entry_per_tile() {
        let mut platform = seeded_platform();
        let samples = platform.sample().unwrap();
        assert_eq!(samples.len(), NUM_TILE);
    }
}
