//! Model-specific platform driver (`PlatformImp`), grounded on
//! `KNLPlatformImp.{hpp,cpp}`. Opens one MSR handle per logical CPU,
//! reads/writes typed signals, and owns the overflow-compensation state.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, ErrorCode};
use crate::msr_table::{build_msr_offset_map, MsrOffset, NUM_TILE};
use crate::overflow::OverflowTable;
use crate::pwrctl_err;

/// Granularity a signal or control applies at (spec glossary: "Domain").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Package,
    Tile,
    LogicalCpu,
}

/// Typed signal kinds sampled once per control period (spec section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    PkgEnergy,
    Pp0Energy,
    DramEnergy,
    Frequency,
    InstructionsRetired,
    UnhaltedCoreCycles,
    UnhaltedRefCycles,
    ReadBandwidth,
}

/// Control kinds the leaf decider actuates through `write_control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    PkgPowerLimit,
    Pp0PowerLimit,
    DramPowerLimit,
    Frequency,
}

/// Abstraction over the raw MSR read/write syscalls, so tests can run
/// against an in-memory register file instead of `/dev/cpu/*/msr`.
pub trait MsrBackend: Send {
    fn open(&mut self, cpu_index: u32) -> Result<(), Error>;
    fn read(&self, cpu_index: u32, offset: u32) -> Result<u64, Error>;
    fn write(&mut self, cpu_index: u32, offset: u32, value: u64) -> Result<(), Error>;
}

/// Real backend: one `/dev/cpu/{n}/msr` file handle per logical CPU,
/// released automatically when the handle is dropped.
pub struct FileMsrBackend {
    handles: HashMap<u32, std::fs::File>,
}

impl FileMsrBackend {
    pub fn new() -> Self {
        FileMsrBackend { handles: HashMap::new() }
    }
}

impl Default for FileMsrBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MsrBackend for FileMsrBackend {
    fn open(&mut self, cpu_index: u32) -> Result<(), Error> {
        let path = format!("/dev/cpu/{cpu_index}/msr");
        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
        self.handles.insert(cpu_index, file);
        Ok(())
    }

    fn read(&self, cpu_index: u32, offset: u32) -> Result<u64, Error> {
        let mut file = self
            .handles
            .get(&cpu_index)
            .ok_or_else(|| pwrctl_err!(ErrorCode::Runtime, "msr handle not open for cpu {cpu_index}"))?;
        let mut buf = [0u8; 8];
        (&mut file).seek(SeekFrom::Start(offset as u64))?;
        (&mut file).read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write(&mut self, cpu_index: u32, offset: u32, value: u64) -> Result<(), Error> {
        let file = self
            .handles
            .get_mut(&cpu_index)
            .ok_or_else(|| pwrctl_err!(ErrorCode::Runtime, "msr handle not open for cpu {cpu_index}"))?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(&value.to_le_bytes())?;
        Ok(())
    }
}

/// In-memory backend for unit tests: simulates the register file with a
/// plain map, including the RAPL/perf registers `msr_initialize` expects
/// to be pre-seeded with plausible reset values.
#[derive(Default)]
pub struct FakeMsrBackend {
    pub registers: HashMap<(u32, u32), u64>,
    opened: std::collections::HashSet<u32>,
}

impl MsrBackend for FakeMsrBackend {
    fn open(&mut self, cpu_index: u32) -> Result<(), Error> {
        self.opened.insert(cpu_index);
        Ok(())
    }

    fn read(&self, cpu_index: u32, offset: u32) -> Result<u64, Error> {
        Ok(*self.registers.get(&(cpu_index, offset)).unwrap_or(&0))
    }

    fn write(&mut self, cpu_index: u32, offset: u32, value: u64) -> Result<(), Error> {
        self.registers.insert((cpu_index, offset), value);
        Ok(())
    }
}

/// Fixed-topology description. On real hardware this is discovered from
/// the OS; tests and the platform facade inject it directly.
#[derive(Debug, Clone, Copy)]
pub struct Topology {
    pub num_package: u32,
    pub num_tile: u32,
    pub num_logical_cpu: u32,
    pub num_cpu_per_core: u32,
}

/// Platform-model identification contract, plus the read/write/init/reset
/// operations spec section 4.1 requires. One type implements this per
/// supported CPU model; the many-core variant below is the reference.
pub trait PlatformImp {
    fn model_supported(&self, platform_id: u32) -> bool;
    fn topology(&self) -> Topology;
    fn msr_initialize(&mut self) -> Result<(), Error>;
    fn msr_reset(&mut self) -> Result<(), Error>;
    fn read_signal(&mut self, domain: Domain, index: u32, signal: SignalKind) -> Result<f64, Error>;
    fn write_control(&mut self, domain: Domain, index: u32, control: ControlKind, value: f64) -> Result<(), Error>;
    fn pkg_power_bounds(&self) -> (f64, f64);
    fn dram_power_bounds(&self) -> (f64, f64);
}

const PKG_POWER_LIMIT_MASK: u64 = 0x0007800000078000;
const DRAM_POWER_LIMIT_MASK: u64 = 0xfefffful & PKG_POWER_LIMIT_MASK;
const PP0_POWER_LIMIT_MASK: u64 = 0xfffffful & PKG_POWER_LIMIT_MASK;
const DRAM_ENERGY_UNITS: f64 = 1.5258789063e-5;
const M_KNL_MODEL_ID: u32 = 0x657;

/// Many-core (KNL-style) platform driver: the reference `PlatformImp`.
pub struct ManyCorePlatformImp<B: MsrBackend> {
    backend: B,
    topology: Topology,
    offsets: HashMap<String, MsrOffset>,
    overflow: OverflowTable,
    energy_units: f64,
    power_units: f64,
    min_pkg_watts: f64,
    max_pkg_watts: f64,
    min_pp0_watts: f64,
    max_pp0_watts: f64,
    min_dram_watts: f64,
    max_dram_watts: f64,
}

/// Signal index layout inside the overflow table: 3 energy counters per
/// package, then 5 per-tile counters (inst retired, core cycles, ref
/// cycles, and the two read-bandwidth halves), mirroring
/// `KNLPlatformImp::msr_initialize`'s `m_num_energy_signal` /
/// `m_num_counter_signal` bookkeeping.
const NUM_ENERGY_SIGNAL: usize = 3;
const NUM_COUNTER_SIGNAL: usize = 5;

impl<B: MsrBackend> ManyCorePlatformImp<B> {
    pub fn new(backend: B, topology: Topology) -> Self {
        let num_signal =
            NUM_ENERGY_SIGNAL * topology.num_package as usize + NUM_COUNTER_SIGNAL * topology.num_tile as usize;
        ManyCorePlatformImp {
            backend,
            topology,
            offsets: HashMap::new(),
            overflow: OverflowTable::new(num_signal),
            energy_units: 1.0,
            power_units: 1.0,
            min_pkg_watts: 1.0,
            max_pkg_watts: 100.0,
            min_pp0_watts: 1.0,
            max_pp0_watts: 100.0,
            min_dram_watts: 1.0,
            max_dram_watts: 100.0,
        }
    }

    fn offset(&self, name: &str) -> Result<u32, Error> {
        self.offsets
            .get(name)
            .map(|o| o.offset)
            .ok_or_else(|| pwrctl_err!(ErrorCode::Logic, "unknown MSR register {name}"))
    }

    fn msr_read(&self, domain: Domain, index: u32, name: &str) -> Result<u64, Error> {
        let offset = self.offset(name)?;
        let cpu = self.domain_to_cpu(domain, index);
        self.backend.read(cpu, offset)
    }

    fn msr_write(&mut self, domain: Domain, index: u32, name: &str, value: u64) -> Result<(), Error> {
        let offset = self.offset(name)?;
        let cpu = self.domain_to_cpu(domain, index);
        self.backend.write(cpu, offset, value)
    }

    /// Resolves a `(domain, index)` pair to the logical CPU whose MSR
    /// handle backs that domain's registers. Package and tile indices are
    /// always smaller than `num_logical_cpu`, so the lowest-numbered CPU
    /// in the domain is used as its representative, mirroring the
    /// original's single fd-per-domain-index table lookup.
    fn domain_to_cpu(&self, _domain: Domain, index: u32) -> u32 {
        index
    }

    fn rapl_init(&mut self) -> Result<(), Error> {
        let raw = self.msr_read(Domain::Package, 0, "RAPL_POWER_UNIT")?;
        self.energy_units = 0.5f64.powi(((raw >> 8) & 0x1F) as i32);
        self.power_units = 2f64.powi((raw & 0xF) as i32);

        for pkg in 1..self.topology.num_package {
            let raw = self.msr_read(Domain::Package, pkg, "RAPL_POWER_UNIT")?;
            let energy = 0.5f64.powi(((raw >> 8) & 0x1F) as i32);
            let power = 2f64.powi((raw & 0xF) as i32);
            if (energy - self.energy_units).abs() > f64::EPSILON || (power - self.power_units).abs() > f64::EPSILON {
                return Err(pwrctl_err!(
                    ErrorCode::Runtime,
                    "detected inconsistent power units among packages"
                ));
            }
        }

        let raw = self.msr_read(Domain::Package, 0, "PKG_POWER_INFO")?;
        self.min_pkg_watts = ((raw >> 16) & 0x7fff) as f64 / self.power_units;
        self.max_pkg_watts = ((raw >> 32) & 0x7fff) as f64 / self.power_units;
        let raw = self.msr_read(Domain::Package, 0, "DRAM_POWER_INFO")?;
        self.min_dram_watts = ((raw >> 16) & 0x7fff) as f64 / self.power_units;
        self.max_dram_watts = ((raw >> 32) & 0x7fff) as f64 / self.power_units;

        for pkg in 1..self.topology.num_package {
            let raw = self.msr_read(Domain::Package, pkg, "PKG_POWER_INFO")?;
            let pkg_min = ((raw >> 16) & 0x7fff) as f64 / self.power_units;
            let pkg_max = ((raw >> 32) & 0x7fff) as f64 / self.power_units;
            if (pkg_min - self.min_pkg_watts).abs() > f64::EPSILON || (pkg_max - self.max_pkg_watts).abs() > f64::EPSILON {
                return Err(pwrctl_err!(ErrorCode::Runtime, "detected inconsistent power pkg bounds among packages"));
            }
            let raw = self.msr_read(Domain::Package, pkg, "DRAM_POWER_INFO")?;
            let dram_min = ((raw >> 16) & 0x7fff) as f64 / self.power_units;
            let dram_max = ((raw >> 32) & 0x7fff) as f64 / self.power_units;
            if (dram_min - self.min_dram_watts).abs() > f64::EPSILON || (dram_max - self.max_dram_watts).abs() > f64::EPSILON {
                return Err(pwrctl_err!(ErrorCode::Runtime, "detected inconsistent power dram bounds among packages"));
            }
        }
        self.min_pp0_watts = self.min_pkg_watts;
        self.max_pp0_watts = self.max_pkg_watts;
        Ok(())
    }

    fn uncore_counters_init(&mut self) -> Result<(), Error> {
        const BOX_FRZ_EN: u64 = 0x1 << 16;
        const BOX_FRZ: u64 = 0x1 << 8;
        const CTR_EN: u64 = 0x1 << 22;
        const RST_CTRS: u64 = 0x1 << 1;
        const L2_REQ_MISS_EV_SEL: u64 = 0x2e;
        const L2_REQ_MISS_UMASK: u64 = 0x41 << 8;
        const L2_PREFETCH_EV_SEL: u64 = 0x3e;
        const L2_PREFETCH_UMASK: u64 = 0x04 << 8;

        for tile in 0..self.topology.num_tile {
            let box_name = format!("C{tile}_MSR_PMON_BOX_CTL");
            let ctl0_name = format!("C{tile}_MSR_PMON_CTL0");
            let ctl1_name = format!("C{tile}_MSR_PMON_CTL1");

            let cur = self.msr_read(Domain::Tile, tile, &box_name)?;
            self.msr_write(Domain::Tile, tile, &box_name, cur | BOX_FRZ_EN)?;
            let cur = self.msr_read(Domain::Tile, tile, &box_name)?;
            self.msr_write(Domain::Tile, tile, &box_name, cur | BOX_FRZ)?;

            let cur = self.msr_read(Domain::Tile, tile, &ctl0_name)?;
            self.msr_write(Domain::Tile, tile, &ctl0_name, cur | CTR_EN)?;
            let cur = self.msr_read(Domain::Tile, tile, &ctl1_name)?;
            self.msr_write(Domain::Tile, tile, &ctl1_name, cur | CTR_EN)?;

            let cur = self.msr_read(Domain::Tile, tile, &ctl0_name)?;
            self.msr_write(Domain::Tile, tile, &ctl0_name, cur | L2_REQ_MISS_EV_SEL | L2_REQ_MISS_UMASK)?;
            let cur = self.msr_read(Domain::Tile, tile, &ctl1_name)?;
            self.msr_write(Domain::Tile, tile, &ctl1_name, cur | L2_PREFETCH_EV_SEL | L2_PREFETCH_UMASK)?;

            let cur = self.msr_read(Domain::Tile, tile, &box_name)?;
            self.msr_write(Domain::Tile, tile, &box_name, cur | RST_CTRS)?;
            let cur = self.msr_read(Domain::Tile, tile, &box_name)?;
            self.msr_write(Domain::Tile, tile, &box_name, cur | BOX_FRZ)?;
            let cur = self.msr_read(Domain::Tile, tile, &box_name)?;
            self.msr_write(Domain::Tile, tile, &box_name, cur & !BOX_FRZ_EN)?;
        }
        Ok(())
    }

    fn fixed_counters_init(&mut self) -> Result<(), Error> {
        for tile in 0..self.topology.num_tile {
            self.msr_write(Domain::Tile, tile, "PERF_FIXED_CTR_CTRL", 0x0333)?;
            self.msr_write(Domain::Tile, tile, "PERF_GLOBAL_CTRL", 0x700000003)?;
            self.msr_write(Domain::Tile, tile, "PERF_GLOBAL_OVF_CTRL", 0x0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl<B: MsrBackend> ManyCorePlatformImp<B> {
    /// Test-only accessor for asserting on the raw register a
    /// `write_control` call produced.
    pub fn msr_read_for_test(&self, domain: Domain, index: u32, name: &str) -> u64 {
        self.msr_read(domain, index, name).unwrap()
    }

    /// Test-only accessor for seeding a raw register `read_signal` reads
    /// from directly, independent of any `write_control` encoding.
    pub fn msr_write_for_test(&mut self, domain: Domain, index: u32, name: &str, value: u64) {
        self.msr_write(domain, index, name, value).unwrap()
    }
}

impl<B: MsrBackend> PlatformImp for ManyCorePlatformImp<B> {
    fn model_supported(&self, platform_id: u32) -> bool {
        platform_id == M_KNL_MODEL_ID
    }

    fn topology(&self) -> Topology {
        self.topology
    }

    fn msr_initialize(&mut self) -> Result<(), Error> {
        for cpu in 0..self.topology.num_logical_cpu {
            self.backend.open(cpu)?;
        }
        self.offsets = build_msr_offset_map();
        self.rapl_init()?;
        self.uncore_counters_init()?;
        self.fixed_counters_init()?;
        Ok(())
    }

    fn msr_reset(&mut self) -> Result<(), Error> {
        for pkg in 0..self.topology.num_package {
            self.msr_write(Domain::Package, pkg, "PKG_POWER_LIMIT", 0)?;
            self.msr_write(Domain::Package, pkg, "PP0_POWER_LIMIT", 0)?;
            self.msr_write(Domain::Package, pkg, "DRAM_POWER_LIMIT", 0)?;
        }
        for tile in 0..self.topology.num_tile {
            let box_name = format!("C{tile}_MSR_PMON_BOX_CTL");
            let cur = self.msr_read(Domain::Tile, tile, &box_name)?;
            self.msr_write(Domain::Tile, tile, &box_name, cur | (0x1 << 1))?;
        }
        Ok(())
    }

    fn read_signal(&mut self, domain: Domain, index: u32, signal: SignalKind) -> Result<f64, Error> {
        match signal {
            SignalKind::PkgEnergy => {
                let offset_idx = index as usize * NUM_ENERGY_SIGNAL;
                let raw = self.msr_read(domain, index, "PKG_ENERGY_STATUS")?;
                Ok(self.overflow.compensate(offset_idx, 32, raw) * self.energy_units)
            }
            SignalKind::Pp0Energy => {
                let offset_idx = index as usize * NUM_ENERGY_SIGNAL + 1;
                let raw = self.msr_read(domain, index, "PP0_ENERGY_STATUS")?;
                Ok(self.overflow.compensate(offset_idx, 32, raw) * self.energy_units)
            }
            SignalKind::DramEnergy => {
                let offset_idx = index as usize * NUM_ENERGY_SIGNAL + 2;
                let raw = self.msr_read(domain, index, "DRAM_ENERGY_STATUS")?;
                Ok(self.overflow.compensate(offset_idx, 32, raw) * DRAM_ENERGY_UNITS)
            }
            SignalKind::Frequency => {
                let raw = self.msr_read(Domain::Tile, index, "IA32_PERF_STATUS")?;
                Ok(((raw >> 8) & 0xFF) as f64 * 100.0)
            }
            SignalKind::InstructionsRetired => {
                let base = self.topology.num_package as usize * NUM_ENERGY_SIGNAL;
                let offset_idx = base + index as usize * NUM_COUNTER_SIGNAL + 1;
                let raw = self.msr_read(Domain::Tile, index, "PERF_FIXED_CTR0")?;
                Ok(self.overflow.compensate(offset_idx, 64, raw))
            }
            SignalKind::UnhaltedCoreCycles => {
                let base = self.topology.num_package as usize * NUM_ENERGY_SIGNAL;
                let offset_idx = base + index as usize * NUM_COUNTER_SIGNAL + 2;
                let raw = self.msr_read(Domain::Tile, index, "PERF_FIXED_CTR1")?;
                Ok(self.overflow.compensate(offset_idx, 64, raw))
            }
            SignalKind::UnhaltedRefCycles => {
                let base = self.topology.num_package as usize * NUM_ENERGY_SIGNAL;
                let offset_idx = base + index as usize * NUM_COUNTER_SIGNAL + 3;
                let raw = self.msr_read(Domain::Tile, index, "PERF_FIXED_CTR2")?;
                Ok(self.overflow.compensate(offset_idx, 64, raw))
            }
            SignalKind::ReadBandwidth => {
                let base = self.topology.num_package as usize * NUM_ENERGY_SIGNAL;
                let offset_idx = base + index as usize * NUM_COUNTER_SIGNAL + 4;
                let ctr0_name = format!("C{index}_MSR_PMON_CTR0");
                let ctr1_name = format!("C{index}_MSR_PMON_CTR1");
                let raw0 = self.msr_read(Domain::Tile, index, &ctr0_name)?;
                let raw1 = self.msr_read(Domain::Tile, index, &ctr1_name)?;
                let half0 = self.overflow.compensate(offset_idx, 48, raw0);
                let half1 = self.overflow.compensate(offset_idx + 1, 48, raw1);
                Ok(half0 + half1)
            }
        }
    }

    fn write_control(&mut self, domain: Domain, index: u32, control: ControlKind, value: f64) -> Result<(), Error> {
        match control {
            ControlKind::PkgPowerLimit => {
                let clamped = value.clamp(self.min_pkg_watts, self.max_pkg_watts);
                let raw = (clamped * self.power_units) as u64;
                let msr_val = raw | (raw << 32) | PKG_POWER_LIMIT_MASK;
                self.msr_write(domain, index, "PKG_POWER_LIMIT", msr_val)
            }
            ControlKind::Pp0PowerLimit => {
                let clamped = value.clamp(self.min_pp0_watts, self.max_pp0_watts);
                let raw = (clamped * self.power_units) as u64;
                let msr_val = raw | (raw << 32) | PP0_POWER_LIMIT_MASK;
                self.msr_write(domain, index, "PP0_POWER_LIMIT", msr_val)
            }
            ControlKind::DramPowerLimit => {
                let clamped = value.clamp(self.min_dram_watts, self.max_dram_watts);
                let raw = (clamped * self.power_units) as u64;
                let msr_val = raw | (raw << 32) | DRAM_POWER_LIMIT_MASK;
                self.msr_write(domain, index, "DRAM_POWER_LIMIT", msr_val)
            }
            ControlKind::Frequency => {
                let raw = (value * 10.0) as u64;
                let msr_val = raw << 8;
                self.msr_write(Domain::Tile, index, "IA32_PERF_CTL", msr_val)
            }
        }
    }

    fn pkg_power_bounds(&self) -> (f64, f64) {
        (self.min_pkg_watts, self.max_pkg_watts)
    }

    fn dram_power_bounds(&self) -> (f64, f64) {
        (self.min_dram_watts, self.max_dram_watts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_topology() -> Topology {
        Topology {
            num_package: 1,
            num_tile: NUM_TILE as u32,
            num_logical_cpu: NUM_TILE as u32 * 4,
            num_cpu_per_core: 4,
        }
    }

    fn seeded_platform() -> ManyCorePlatformImp<FakeMsrBackend> {
        let mut backend = FakeMsrBackend::default();
        let offsets = build_msr_offset_map();
        // RAPL_POWER_UNIT: energy_units = 0.5^0 = 1.0, power_units = 2^0 = 1.0
        backend
            .registers
            .insert((0, offsets["RAPL_POWER_UNIT"].offset), 0);
        // PKG_POWER_INFO / DRAM_POWER_INFO: min=50, max=200 watts at power_units=1.0
        let info = (200u64 << 32) | (50u64 << 16);
        backend.registers.insert((0, offsets["PKG_POWER_INFO"].offset), info);
        backend.registers.insert((0, offsets["DRAM_POWER_INFO"].offset), info);

        let mut imp = ManyCorePlatformImp::new(backend, seeded_topology());
        imp.msr_initialize().expect("msr_initialize should succeed");
        imp
    }

    #[test]
    fn scenario_s2_clamp_writes_based_on_discovered_bounds() {
        let mut imp = seeded_platform();
        imp.write_control(Domain::Package, 0, ControlKind::PkgPowerLimit, 10.0).unwrap();
        let raw_low = imp.msr_read(Domain::Package, 0, "PKG_POWER_LIMIT").unwrap();
        assert_eq!(raw_low, 50 | (50 << 32) | PKG_POWER_LIMIT_MASK);

        imp.write_control(Domain::Package, 0, ControlKind::PkgPowerLimit, 500.0).unwrap();
        let raw_high = imp.msr_read(Domain::Package, 0, "PKG_POWER_LIMIT").unwrap();
        assert_eq!(raw_high, 200 | (200 << 32) | PKG_POWER_LIMIT_MASK);
    }

    #[test]
    fn frequency_write_then_read_is_consistent_with_100mhz_scaling() {
        let mut imp = seeded_platform();
        imp.write_control(Domain::Tile, 0, ControlKind::Frequency, 2100.0).unwrap();
        let raw = imp.msr_read(Domain::Tile, 0, "IA32_PERF_CTL").unwrap();
        assert_eq!(raw, (2100u64 * 10) << 8);
    }

    #[test]
    fn read_signal_frequency_scales_raw_field_by_100mhz() {
        let mut imp = seeded_platform();
        // Bits 8-15 carry the raw multiplier; IA32_PERF_STATUS reports
        // frequency as raw_field * 100 MHz (spec section 4.1).
        imp.msr_write_for_test(Domain::Tile, 0, "IA32_PERF_STATUS", 21u64 << 8);
        let mhz = imp.read_signal(Domain::Tile, 0, SignalKind::Frequency).unwrap();
        assert_eq!(mhz, 2100.0);
    }

    #[test]
    fn rejects_inconsistent_units_across_packages() {
        let mut backend = FakeMsrBackend::default();
        let offsets = build_msr_offset_map();
        backend.registers.insert((0, offsets["RAPL_POWER_UNIT"].offset), 0);
        // Second package reports different power units (bits 0-3 = 1 instead of 0).
        backend.registers.insert((1, offsets["RAPL_POWER_UNIT"].offset), 1);
        let info = (200u64 << 32) | (50u64 << 16);
        backend.registers.insert((0, offsets["PKG_POWER_INFO"].offset), info);
        backend.registers.insert((1, offsets["PKG_POWER_INFO"].offset), info);
        backend.registers.insert((0, offsets["DRAM_POWER_INFO"].offset), info);
        backend.registers.insert((1, offsets["DRAM_POWER_INFO"].offset), info);

        let topology = Topology {
            num_package: 2,
            num_tile: NUM_TILE as u32,
            num_logical_cpu: NUM_TILE as u32 * 4,
            num_cpu_per_core: 4,
        };
        let mut imp = ManyCorePlatformImp::new(backend, topology);
        let err = imp.msr_initialize().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Runtime as i32);
    }
}
