//! Operator-authored root policy (spec section 4.6): read from and
//! published to either a JSON file or a shared-memory slot guarded by a
//! process-shared mutex, matching `policy_message_s` plus its embedded
//! `pthread_mutex_t lock`.

use std::fs;
use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::path::{Path, PathBuf};
use std::ptr;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode as StatMode;
use nix::unistd::ftruncate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, Result};
use crate::platform::Platform;
use crate::platform_imp::PlatformImp;
use crate::policy::{Affinity, Flags, Goal, Mode};
use crate::pwrctl_err;

/// Either a filesystem path (JSON backing store) or a shared-memory
/// object name (spec section 4.6: "a string starting with `/` and
/// containing no other `/`").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDescriptor {
    File(PathBuf),
    SharedMemory(String),
}

impl PolicyDescriptor {
    pub fn parse(descriptor: &str) -> Self {
        if descriptor.starts_with('/') && !descriptor[1..].contains('/') {
            PolicyDescriptor::SharedMemory(descriptor.to_string())
        } else {
            PolicyDescriptor::File(PathBuf::from(descriptor))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct OptionsJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    tdp_percent: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu_mhz: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_cpu_max_perf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    affinity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    power_budget: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct PolicyConfigJson {
    mode: String,
    options: OptionsJson,
}

/// In-memory root policy fields, the quantity GlobalPolicy reads from
/// and publishes to its descriptors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalPolicyFields {
    pub mode: Mode,
    pub budget_watts: f64,
    pub flags: Flags,
}

impl Default for GlobalPolicyFields {
    fn default() -> Self {
        GlobalPolicyFields { mode: Mode::Shutdown, budget_watts: 0.0, flags: Flags::default() }
    }
}

/// Cross-field validation per mode (spec section 4.6 table). Parses
/// `options` into [`GlobalPolicyFields`] or fails with `FileParse`.
fn validate(mode: Mode, options: &OptionsJson) -> Result<GlobalPolicyFields> {
    let mut fields = GlobalPolicyFields { mode, ..GlobalPolicyFields::default() };
    let missing = |name: &str| pwrctl_err!(ErrorCode::FileParse, "mode {:?} requires option '{name}'", mode);

    match mode {
        Mode::TdpBalanceStatic => {
            let tdp = options.tdp_percent.ok_or_else(|| missing("tdp_percent"))?;
            if !(0..=100).contains(&tdp) {
                return Err(pwrctl_err!(ErrorCode::FileParse, "tdp_percent {tdp} out of range 0..=100"));
            }
            fields.flags.set_tdp_percent(tdp as u32);
        }
        Mode::FreqUniformStatic => {
            let mhz = options.cpu_mhz.ok_or_else(|| missing("cpu_mhz"))?;
            if mhz < 0 {
                return Err(pwrctl_err!(ErrorCode::FileParse, "cpu_mhz {mhz} must be >= 0"));
            }
            fields.flags.set_frequency_mhz(mhz as u32);
        }
        Mode::FreqHybridStatic => {
            let mhz = options.cpu_mhz.ok_or_else(|| missing("cpu_mhz"))?;
            let num_max_perf = options.num_cpu_max_perf.ok_or_else(|| missing("num_cpu_max_perf"))?;
            let affinity_str = options.affinity.as_deref().ok_or_else(|| missing("affinity"))?;
            if mhz < 0 || num_max_perf < 0 {
                return Err(pwrctl_err!(ErrorCode::FileParse, "freq_hybrid_static options must be >= 0"));
            }
            let affinity = Affinity::from_json_str(affinity_str)
                .ok_or_else(|| pwrctl_err!(ErrorCode::FileParse, "unknown affinity '{affinity_str}'"))?;
            fields.flags.set_frequency_mhz(mhz as u32);
            fields.flags.set_num_max_perf(num_max_perf as u32);
            fields.flags.set_affinity(affinity);
        }
        Mode::PerfBalanceDynamic | Mode::FreqUniformDynamic => {
            let budget = options.power_budget.ok_or_else(|| missing("power_budget"))?;
            if budget < 0 {
                return Err(pwrctl_err!(ErrorCode::FileParse, "power_budget {budget} must be >= 0"));
            }
            fields.budget_watts = budget as f64;
        }
        Mode::FreqHybridDynamic => {
            let budget = options.power_budget.ok_or_else(|| missing("power_budget"))?;
            let num_max_perf = options.num_cpu_max_perf.ok_or_else(|| missing("num_cpu_max_perf"))?;
            let affinity_str = options.affinity.as_deref().ok_or_else(|| missing("affinity"))?;
            if budget < 0 || num_max_perf < 0 {
                return Err(pwrctl_err!(ErrorCode::FileParse, "freq_hybrid_dynamic options must be >= 0"));
            }
            let affinity = Affinity::from_json_str(affinity_str)
                .ok_or_else(|| pwrctl_err!(ErrorCode::FileParse, "unknown affinity '{affinity_str}'"))?;
            fields.budget_watts = budget as f64;
            fields.flags.set_num_max_perf(num_max_perf as u32);
            fields.flags.set_affinity(affinity);
        }
        Mode::Shutdown => {}
    }
    Ok(fields)
}

fn parse_json(text: &str) -> Result<GlobalPolicyFields> {
    let parsed: PolicyConfigJson = serde_json::from_str(text)
        .map_err(|e| pwrctl_err!(ErrorCode::FileParse, "malformed policy config: {e}"))?;
    let mode = Mode::from_json_str(&parsed.mode)
        .ok_or_else(|| pwrctl_err!(ErrorCode::FileParse, "unknown mode '{}'", parsed.mode))?;
    validate(mode, &parsed.options)
}

/// Serializes back to the same shape S1 requires: only the options this
/// mode's table names are present.
fn to_json(fields: &GlobalPolicyFields) -> Value {
    let mut options = OptionsJson::default();
    match fields.mode {
        Mode::TdpBalanceStatic => options.tdp_percent = Some(fields.flags.tdp_percent() as i64),
        Mode::FreqUniformStatic => options.cpu_mhz = Some(fields.flags.frequency_mhz() as i64),
        Mode::FreqHybridStatic => {
            options.cpu_mhz = Some(fields.flags.frequency_mhz() as i64);
            options.num_cpu_max_perf = Some(fields.flags.num_max_perf() as i64);
            options.affinity = fields.flags.affinity().map(|a| a.as_json_str().to_string());
        }
        Mode::PerfBalanceDynamic | Mode::FreqUniformDynamic => {
            options.power_budget = Some(fields.budget_watts as i64);
        }
        Mode::FreqHybridDynamic => {
            options.power_budget = Some(fields.budget_watts as i64);
            options.num_cpu_max_perf = Some(fields.flags.num_max_perf() as i64);
            options.affinity = fields.flags.affinity().map(|a| a.as_json_str().to_string());
        }
        Mode::Shutdown => {}
    }
    let config = PolicyConfigJson { mode: fields.mode.as_json_str().to_string(), options };
    serde_json::to_value(config).expect("policy config always serializes")
}

const MAX_TARGET: usize = 256;

/// Fixed-layout shared-memory record: a process-shared mutex followed by
/// the policy fields, sized identically in every attaching process.
#[repr(C)]
struct SharedPolicyRecord {
    mutex: libc::pthread_mutex_t,
    mode: i32,
    budget_watts: f64,
    flags: u64,
    num_target: u32,
    target: [f64; MAX_TARGET],
    version: u64,
}

struct SharedPolicySlot {
    name: String,
    ptr: *mut SharedPolicyRecord,
    owns: bool,
}

// SAFETY: the embedded mutex is created with PTHREAD_PROCESS_SHARED and
// every access to the mapped region is taken under it.
unsafe impl Send for SharedPolicySlot {}
unsafe impl Sync for SharedPolicySlot {}

impl SharedPolicySlot {
    fn size() -> usize {
        std::mem::size_of::<SharedPolicyRecord>()
    }

    /// Creates a new shared-memory object with `O_CREAT|O_EXCL`, sizes
    /// it exactly, maps it, and initializes the embedded process-shared
    /// mutex. The creating process owns `shm_unlink` on drop.
    fn create(name: &str) -> Result<Self> {
        let oflag = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
        let mode = StatMode::from_bits_truncate(0o770);
        let fd = shm_open(name, oflag, mode)
            .map_err(|e| pwrctl_err!(ErrorCode::Runtime, "shm_open({name}) failed: {e}"))?;
        ftruncate(&fd, Self::size() as i64)
            .map_err(|e| pwrctl_err!(ErrorCode::Runtime, "ftruncate({name}) failed: {e}"))?;
        let ptr = Self::map(&fd)?;

        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            libc::pthread_mutexattr_init(attr.as_mut_ptr());
            libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutex_init(ptr::addr_of_mut!((*ptr).mutex), attr.as_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            (*ptr).mode = Mode::Shutdown as i32;
            (*ptr).budget_watts = 0.0;
            (*ptr).flags = 0;
            (*ptr).num_target = 0;
            (*ptr).version = 0;
        }

        Ok(SharedPolicySlot { name: name.to_string(), ptr, owns: true })
    }

    /// Attaches to an existing shared-memory object without creating or
    /// owning it.
    fn open(name: &str) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, StatMode::empty())
            .map_err(|e| pwrctl_err!(ErrorCode::Runtime, "shm_open({name}) failed: {e}"))?;
        let ptr = Self::map(&fd)?;
        Ok(SharedPolicySlot { name: name.to_string(), ptr, owns: false })
    }

    fn map(fd: &std::os::fd::OwnedFd) -> Result<*mut SharedPolicyRecord> {
        let len = std::num::NonZeroUsize::new(Self::size())
            .ok_or_else(|| pwrctl_err!(ErrorCode::Runtime, "zero-sized shared memory record"))?;
        unsafe {
            mmap(None, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_SHARED, fd, 0)
                .map(|addr| addr.as_ptr() as *mut SharedPolicyRecord)
                .map_err(|e| pwrctl_err!(ErrorCode::Runtime, "mmap failed: {e}"))
        }
    }

    /// Runs `body` with the mutex held, then releases it. The lock
    /// released is always the one just acquired on this slot's own
    /// record.
    fn with_lock<T>(&self, body: impl FnOnce(&mut SharedPolicyRecord) -> T) -> T {
        unsafe {
            libc::pthread_mutex_lock(ptr::addr_of_mut!((*self.ptr).mutex));
            let result = body(&mut *self.ptr);
            libc::pthread_mutex_unlock(ptr::addr_of_mut!((*self.ptr).mutex));
            result
        }
    }

    fn read_fields(&self) -> (GlobalPolicyFields, Vec<f64>, u64) {
        self.with_lock(|record| {
            let mode = mode_from_i32(record.mode);
            let fields = GlobalPolicyFields {
                mode,
                budget_watts: record.budget_watts,
                flags: Flags(record.flags),
            };
            let target = record.target[..record.num_target as usize].to_vec();
            (fields, target, record.version)
        })
    }

    fn write_fields(&self, fields: &GlobalPolicyFields, target: &[f64], version: u64) -> Result<()> {
        if target.len() > MAX_TARGET {
            return Err(pwrctl_err!(ErrorCode::Invalid, "target vector exceeds shared-memory capacity"));
        }
        self.with_lock(|record| {
            record.mode = fields.mode as i32;
            record.budget_watts = fields.budget_watts;
            record.flags = fields.flags.0;
            record.num_target = target.len() as u32;
            record.target[..target.len()].copy_from_slice(target);
            record.version = version;
        });
        Ok(())
    }
}

fn mode_from_i32(raw: i32) -> Mode {
    match raw {
        1 => Mode::TdpBalanceStatic,
        2 => Mode::FreqUniformStatic,
        3 => Mode::FreqHybridStatic,
        4 => Mode::PerfBalanceDynamic,
        5 => Mode::FreqUniformDynamic,
        6 => Mode::FreqHybridDynamic,
        _ => Mode::Shutdown,
    }
}

impl Drop for SharedPolicySlot {
    fn drop(&mut self) {
        unsafe {
            let addr = ptr::NonNull::new_unchecked(self.ptr as *mut std::ffi::c_void);
            let _ = munmap(addr, Self::size());
        }
        if self.owns {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

pub struct GlobalPolicy {
    input: Option<PolicyDescriptor>,
    output: Option<PolicyDescriptor>,
    current: GlobalPolicyFields,
    target: Vec<f64>,
    version: u64,
    in_shm: Option<SharedPolicySlot>,
    out_shm: Option<SharedPolicySlot>,
}

impl GlobalPolicy {
    pub fn new(input: Option<PolicyDescriptor>, output: Option<PolicyDescriptor>) -> Self {
        GlobalPolicy {
            input,
            output,
            current: GlobalPolicyFields::default(),
            target: Vec::new(),
            version: 0,
            in_shm: None,
            out_shm: None,
        }
    }

    pub fn fields(&self) -> GlobalPolicyFields {
        self.current
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Loads fields from the input descriptor: a JSON file is parsed and
    /// validated fresh every call; a shared-memory slot is opened once
    /// and re-read under its mutex thereafter.
    pub fn read(&mut self) -> Result<()> {
        let descriptor = self
            .input
            .clone()
            .ok_or_else(|| pwrctl_err!(ErrorCode::Invalid, "global policy has no input descriptor"))?;
        match descriptor {
            PolicyDescriptor::File(path) => {
                let text = read_config_file(&path)?;
                self.current = parse_json(&text)?;
            }
            PolicyDescriptor::SharedMemory(name) => {
                if self.in_shm.is_none() {
                    self.in_shm = Some(SharedPolicySlot::open(&name)?);
                }
                let slot = self.in_shm.as_ref().unwrap();
                let (fields, target, version) = slot.read_fields();
                self.current = fields;
                self.target = target;
                self.version = version;
            }
        }
        Ok(())
    }

    /// Publishes the current fields to the output descriptor. For a
    /// shared-memory output this creates the slot on first use (the
    /// publishing process is the creator) and releases the lock it just
    /// took on that same slot.
    pub fn write(&mut self) -> Result<()> {
        let descriptor = self
            .output
            .clone()
            .ok_or_else(|| pwrctl_err!(ErrorCode::Invalid, "global policy has no output descriptor"))?;
        self.version += 1;
        match descriptor {
            PolicyDescriptor::File(path) => {
                let value = to_json(&self.current);
                let text = serde_json::to_string_pretty(&value)?;
                fs::write(&path, text)?;
            }
            PolicyDescriptor::SharedMemory(name) => {
                if self.out_shm.is_none() {
                    self.out_shm = Some(match SharedPolicySlot::create(&name) {
                        Ok(slot) => slot,
                        Err(_) => SharedPolicySlot::open(&name)?,
                    });
                }
                let slot = self.out_shm.as_ref().unwrap();
                slot.write_fields(&self.current, &self.target, self.version)?;
            }
        }
        Ok(())
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.current.mode = mode;
    }

    pub fn set_budget_watts(&mut self, watts: f64) {
        self.current.budget_watts = watts;
    }

    pub fn set_frequency_mhz(&mut self, mhz: u32) {
        self.current.flags.set_frequency_mhz(mhz);
    }

    pub fn set_tdp_percent(&mut self, percent: u32) {
        self.current.flags.set_tdp_percent(percent);
    }

    pub fn set_affinity(&mut self, affinity: Affinity) {
        self.current.flags.set_affinity(affinity);
    }

    pub fn set_goal(&mut self, goal: Goal) {
        self.current.flags.set_goal(goal);
    }

    pub fn set_num_max_perf(&mut self, count: u32) {
        self.current.flags.set_num_max_perf(count);
    }

    /// Reads the current policy, then dispatches directly to the
    /// matching `Platform` call for static modes only. Dynamic modes are
    /// not a no-op here: they require the full controller/decider loop
    /// to produce an actuation, so this returns `Invalid` rather than
    /// silently doing nothing.
    pub fn enforce_static_mode<I: PlatformImp>(&mut self, platform: &mut Platform<I>) -> Result<()> {
        self.read()?;
        match self.current.mode {
            Mode::TdpBalanceStatic => platform.tdp_limit(self.current.flags.tdp_percent()),
            Mode::FreqUniformStatic => {
                platform.manual_frequency(self.current.flags.frequency_mhz(), 0, Affinity::Compact)
            }
            Mode::FreqHybridStatic => platform.manual_frequency(
                self.current.flags.frequency_mhz(),
                self.current.flags.num_max_perf(),
                self.current.flags.affinity().unwrap_or(Affinity::Compact),
            ),
            Mode::Shutdown => Ok(()),
            other => Err(pwrctl_err!(ErrorCode::Invalid, "enforce_static_mode called with dynamic mode {other:?}")),
        }
    }
}

fn read_config_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            pwrctl_err!(ErrorCode::FileParse, "policy config {} not found", path.display())
        } else {
            e.into()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_parse_distinguishes_shared_memory_from_file() {
        assert_eq!(PolicyDescriptor::parse("/pwrctl-policy"), PolicyDescriptor::SharedMemory("/pwrctl-policy".to_string()));
        assert_eq!(PolicyDescriptor::parse("/etc/pwrctl/policy.json"), PolicyDescriptor::File(PathBuf::from("/etc/pwrctl/policy.json")));
        assert_eq!(PolicyDescriptor::parse("policy.json"), PolicyDescriptor::File(PathBuf::from("policy.json")));
    }

    #[test]
    fn s1_config_round_trip() {
        let text = r#"{"mode":"freq_hybrid_static","options":{"cpu_mhz":2100,"num_cpu_max_perf":4,"affinity":"scatter"}}"#;
        let fields = parse_json(text).unwrap();
        assert_eq!(fields.mode, Mode::FreqHybridStatic);
        assert_eq!(fields.flags.frequency_mhz(), 2100);
        assert_eq!(fields.flags.num_max_perf(), 4);
        assert_eq!(fields.flags.affinity(), Some(Affinity::Scatter));

        let round_tripped = to_json(&fields);
        let expected: Value = serde_json::from_str(text).unwrap();
        assert_eq!(round_tripped, expected);
    }

    #[test]
    fn s6_invalid_json_missing_required_fields_fails_with_file_parse() {
        let text = r#"{"mode":"freq_hybrid_static","options":{"cpu_mhz":2100}}"#;
        let err = parse_json(text).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileParse as i32);
    }

    #[test]
    fn tdp_balance_static_bounds_are_enforced() {
        let options = OptionsJson { tdp_percent: Some(150), ..Default::default() };
        let err = validate(Mode::TdpBalanceStatic, &options).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileParse as i32);
    }

    #[test]
    fn unknown_mode_string_fails_with_file_parse() {
        let text = r#"{"mode":"warp_speed","options":{}}"#;
        let err = parse_json(text).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileParse as i32);
    }

    #[test]
    fn enforce_static_mode_rejects_dynamic_modes() {
        use crate::platform_imp::{FakeMsrBackend, ManyCorePlatformImp, Topology};

        let path = std::env::temp_dir().join(format!("pwrctl-test-dynamic-{}.json", std::process::id()));
        fs::write(&path, r#"{"mode":"perf_balance_dynamic","options":{"power_budget":500}}"#).unwrap();

        let topology = Topology { num_package: 1, num_tile: 1, num_logical_cpu: 1, num_cpu_per_core: 1 };
        let mut platform = Platform::new(ManyCorePlatformImp::new(FakeMsrBackend::default(), topology));
        let mut policy = GlobalPolicy::new(Some(PolicyDescriptor::File(path.clone())), None);

        let err = policy.enforce_static_mode(&mut platform).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Invalid as i32);

        let _ = fs::remove_file(&path);
    }
}
