//! Orchestrator (spec section 4.7): binds Platform, Region, Decider,
//! TreeCommunicator and GlobalPolicy into the periodic control loop.
//! One `Controller` instance models one rank's vertical slice of the
//! tree, from its leaf region up through however many intermediate
//! levels it participates in.
//!
//! A `Region` exists per `(level, region_id)` pair, created lazily on
//! first observation, matching the original's
//! `std::vector<std::map<long, Region*>> m_region` (spec section 3:
//! "for any region_id, a single Region instance exists per level").

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::decider::{leaf_decider_for_mode, tree_decider_for_mode, LeafDecider, TreeDecider};
use crate::error::Result;
use crate::fabric::{Fabric, FabricStatus};
use crate::global_policy::GlobalPolicy;
use crate::message::SampleMessage;
use crate::platform::Platform;
use crate::platform_imp::PlatformImp;
use crate::policy::{Flags, Mode, PolicyMessage};
use crate::region::{Region, RegionState, RegionTelemetry};
use crate::tree::TreeCommunicator;

/// Read-only snapshot of one region's state at one level, for the
/// operator HTTP status surface (spec section 6 ambient stack).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionStatus {
    pub level: usize,
    pub region_id: u64,
    pub state: RegionState,
    pub telemetry: RegionTelemetry,
    pub policy_mode: Mode,
    pub policy_budget_watts: f64,
}

/// The application-facing profiling/region-marker contract (spec section
/// 1 Non-goals): the core only needs a region id plus this period's
/// runtime and progress fraction for the region currently executing on
/// this rank. Supplying these values is external to this crate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionMarker {
    pub region_id: u64,
    pub runtime: f64,
    pub progress: f64,
}

/// Tick period and task name for the companion-task variant of `run`
/// (spec section 4.7, "the caller provides the thread attributes").
#[derive(Debug, Clone)]
pub struct ControllerTaskConfig {
    pub name: String,
    pub period: Duration,
}

impl Default for ControllerTaskConfig {
    fn default() -> Self {
        ControllerTaskConfig { name: "pwrctl-controller".to_string(), period: Duration::from_millis(100) }
    }
}

/// Content and version of the last root policy this rank observed,
/// tracked independently of any per-region_id `Region` so that freshness
/// can be judged before any region has been created at the top level.
#[derive(Debug, Clone, Default)]
struct RootPolicyState {
    mode: Mode,
    budget_watts: f64,
    flags: Flags,
    version: u64,
}

pub struct Controller<F: Fabric, I: PlatformImp> {
    platform: Platform<I>,
    tree: TreeCommunicator<F>,
    regions: Vec<HashMap<u64, Region>>,
    num_domain: usize,
    leaf_decider: Box<dyn LeafDecider + Send>,
    tree_deciders: Vec<Box<dyn TreeDecider + Send>>,
    global_policy: Option<GlobalPolicy>,
    root_policy_state: RootPolicyState,
    /// The most recent policy message observed at each level, retained
    /// past the fabric edge's own coalescing so a `Region` created by
    /// `walk_up` after the message arrived still catches up on the next
    /// `walk_down` rather than waiting for a new message that may never
    /// come (the watch channel and the root-policy diff check each only
    /// signal "changed" once).
    last_level_policy: Vec<Option<PolicyMessage>>,
    period: Duration,
}

impl<F: Fabric, I: PlatformImp> Controller<F, I> {
    /// `global_policy` is `Some` only for the rank acting as tree root;
    /// every other rank receives its level-(L-1) policy from the fabric
    /// like any other level.
    pub fn new(
        platform: Platform<I>,
        tree: TreeCommunicator<F>,
        mode: Mode,
        global_policy: Option<GlobalPolicy>,
        period: Duration,
    ) -> Self {
        let num_level = tree.num_level();
        let num_domain = platform_num_domain(&platform);
        let regions = (0..num_level).map(|_| HashMap::new()).collect();
        let tree_deciders = (1..num_level).map(|_| tree_decider_for_mode(mode)).collect();
        let last_level_policy = (0..num_level).map(|_| None).collect();
        Controller {
            platform,
            tree,
            regions,
            num_domain,
            leaf_decider: leaf_decider_for_mode(mode),
            tree_deciders,
            global_policy,
            root_policy_state: RootPolicyState::default(),
            last_level_policy,
            period,
        }
    }

    pub fn num_level(&self) -> usize {
        self.tree.num_level()
    }

    /// A read-only snapshot of every level's known regions, for the
    /// operator HTTP status surface. Does not mutate controller state.
    pub fn status(&self) -> Vec<RegionStatus> {
        self.regions
            .iter()
            .enumerate()
            .flat_map(|(level, regions)| {
                regions.values().map(move |region| RegionStatus {
                    level,
                    region_id: region.region_id,
                    state: region.state,
                    telemetry: region.telemetry(),
                    policy_mode: region.current_policy.mode,
                    policy_budget_watts: region.current_policy.budget_watts,
                })
            })
            .collect()
    }

    /// Loops `step()` until a shutdown policy is observed at the leaf
    /// region this `marker` identifies, guaranteeing one final
    /// `walk_down` of that policy before returning (spec Scenario S5).
    pub async fn run(&mut self, marker: RegionMarker) -> Result<()> {
        loop {
            self.step(marker)?;
            let is_shutdown = self.regions[0]
                .get(&marker.region_id)
                .map(|region| region.current_policy.is_shutdown())
                .unwrap_or(false);
            if is_shutdown {
                debug!("controller observed shutdown policy, returning from run()");
                return Ok(());
            }
            tokio::time::sleep(self.period).await;
        }
    }

    /// Spawns `run` as a companion task rather than driving it on the
    /// calling task (spec section 4.7: "the controller may either run on
    /// the calling process or on a dedicated companion thread"). The
    /// thread-attributes parameter of the original becomes `config`,
    /// logged into the span that wraps the whole task.
    pub fn spawn(mut self, marker: RegionMarker, config: ControllerTaskConfig) -> tokio::task::JoinHandle<Result<()>>
    where
        F: Send + 'static,
        I: Send + 'static,
    {
        use tracing::Instrument;
        let span = tracing::info_span!("controller", name = %config.name);
        tokio::spawn(async move { self.run(marker).await }.instrument(span))
    }

    /// `walk_down()` then `walk_up()` then per-region decide at each
    /// level, then enforce at the leaf.
    pub fn step(&mut self, marker: RegionMarker) -> Result<()> {
        self.walk_down()?;
        self.walk_up(marker)?;
        self.enforce_leaf(marker.region_id)?;
        Ok(())
    }

    /// The number of entries every level's `target`/`updated` vectors
    /// must carry: the platform's own domain count at the leaf, the
    /// tree's fanout into every level above it.
    fn domain_count_for_level(&self, level: usize) -> usize {
        if level == 0 {
            self.num_domain
        } else {
            self.tree.fan_out()[level - 1]
        }
    }

    fn region_entry(&mut self, level: usize, region_id: u64) -> &mut Region {
        let domain_count = self.domain_count_for_level(level);
        self.regions[level].entry(region_id).or_insert_with(|| Region::new(region_id, domain_count))
    }

    /// From the highest level to the leaf: poll for a new policy and, if
    /// one arrives, cache it as this level's latest. Then apply the
    /// cached policy (new or previously cached) to every region at that
    /// level whose `last_policy_version` is still behind it — this
    /// includes regions `walk_up` only just created this step, which
    /// never saw the message that was consumed from the fabric edge or
    /// the root-policy diff on an earlier step.
    fn walk_down(&mut self) -> Result<()> {
        let top = self.num_level() - 1;
        for level in (0..self.num_level()).rev() {
            let incoming = if level == top {
                self.poll_root_policy()?
            } else {
                match self.tree.receive_policy(level)? {
                    FabricStatus::Ready(msg) => Some(msg),
                    FabricStatus::WouldBlock => None,
                }
            };

            if incoming.is_some() {
                self.last_level_policy[level] = incoming;
            }

            let Some(msg) = self.last_level_policy[level].clone() else { continue };

            let region_ids: Vec<u64> = self.regions[level]
                .iter()
                .filter(|(_, region)| region.last_policy_version < msg.version)
                .map(|(region_id, _)| *region_id)
                .collect();
            for region_id in region_ids {
                self.apply_policy_to_region(level, region_id, &msg)?;
            }
        }
        Ok(())
    }

    /// Applies one incoming policy message to a single `(level,
    /// region_id)` region: updates its mode/budget/flags if the message
    /// is newer, then (above the leaf) splits the budget across this
    /// region's children and forwards a single policy message carrying
    /// the per-child `target` vector.
    fn apply_policy_to_region(&mut self, level: usize, region_id: u64, msg: &PolicyMessage) -> Result<()> {
        let last_version = self.regions[level][&region_id].last_policy_version;
        if msg.version <= last_version && last_version != 0 {
            warn!(level, region_id, version = msg.version, "dropping out-of-order policy message");
            return Ok(());
        }

        {
            let region = self.regions[level].get_mut(&region_id).unwrap();
            region.current_policy.mode = msg.mode;
            region.current_policy.budget_watts = msg.power_budget_watts;
            region.current_policy.flags = msg.flags;
            region.last_policy_version = msg.version;
        }

        if level == 0 {
            return Ok(());
        }

        let fan_out = self.tree.fan_out()[level - 1];
        let children_telemetry: Vec<RegionTelemetry> = self.regions[level - 1]
            .get(&region_id)
            .map(|child_region| child_region.latest_samples().iter().map(sample_to_telemetry).collect())
            .unwrap_or_default();

        if children_telemetry.len() != fan_out {
            warn!(
                level,
                region_id,
                expected = fan_out,
                observed = children_telemetry.len(),
                "skipping tree decider: child telemetry not yet observed for all children"
            );
            return Ok(());
        }

        let current_policy = self.regions[level][&region_id].current_policy.clone();
        match self.tree_deciders[level - 1].decide(&children_telemetry, &current_policy) {
            Ok(split) => {
                let region = self.regions[level].get_mut(&region_id).unwrap();
                region.current_policy.update_all(&split);
                let child_msg = region.current_policy.to_message(msg.version);
                self.tree.send_policy(level - 1, child_msg)?;
            }
            Err(e) => {
                warn!(level, region_id, error = %e, "tree decider rejected input, reusing previous policy");
            }
        }
        Ok(())
    }

    /// Reads the operator-authored root policy and, if its fields differ
    /// from the last one observed, assigns it the next version number.
    /// Tracked independently of any `Region`, since no region may yet
    /// exist at the top level the first time a root policy arrives. A
    /// file-backed [`GlobalPolicy`] carries no version of its own (every
    /// read is a fresh snapshot), so freshness here is judged by content
    /// rather than by `GlobalPolicy::version()`.
    fn poll_root_policy(&mut self) -> Result<Option<PolicyMessage>> {
        let Some(global_policy) = self.global_policy.as_mut() else { return Ok(None) };
        global_policy.read()?;
        let fields = global_policy.fields();
        let state = &self.root_policy_state;
        let unchanged = state.version != 0
            && state.mode == fields.mode
            && state.budget_watts == fields.budget_watts
            && state.flags == fields.flags;
        if unchanged {
            return Ok(None);
        }
        let next_version = state.version + 1;
        self.root_policy_state =
            RootPolicyState { mode: fields.mode, budget_watts: fields.budget_watts, flags: fields.flags, version: next_version };
        Ok(Some(PolicyMessage {
            mode: fields.mode,
            power_budget_watts: fields.budget_watts,
            flags: fields.flags,
            num_sample: 0,
            target: Vec::new(),
            version: next_version,
        }))
    }

    /// From the leaf upward: sample the platform at level 0, insert into
    /// the region this `marker` identifies, and forward to the parent.
    /// Higher levels group whatever child samples have arrived by their
    /// `region_id`, insert each group into its own region, and forward
    /// their aggregate further up, except at the root.
    fn walk_up(&mut self, marker: RegionMarker) -> Result<()> {
        let domain_samples = self.platform.sample()?;
        let leaf_sample = aggregate_domain_samples(marker, &domain_samples);
        self.region_entry(0, marker.region_id).insert(vec![leaf_sample]);
        if self.num_level() > 1 {
            self.tree.send_sample(0, leaf_sample)?;
        }

        for level in 1..self.num_level() {
            let mut by_region: HashMap<u64, Vec<SampleMessage>> = HashMap::new();
            while let FabricStatus::Ready(sample) = self.tree.receive_sample(level - 1)? {
                by_region.entry(sample.region_id).or_default().push(sample);
            }
            for (region_id, children) in by_region {
                self.region_entry(level, region_id).insert(children.clone());
                if level + 1 < self.num_level() {
                    let aggregate = aggregate_children(region_id, &children);
                    self.tree.send_sample(level, aggregate)?;
                }
            }
        }
        Ok(())
    }

    /// Leaf decider translates the `region_id` region's current policy
    /// into an actuation and applies it through the platform. A decider
    /// or platform failure here is logged and the previous actuation
    /// stays in effect for one more step rather than panicking the task.
    fn enforce_leaf(&mut self, region_id: u64) -> Result<()> {
        let Some(region) = self.regions[0].get(&region_id) else { return Ok(()) };
        let telemetry = region.telemetry();
        let policy = region.current_policy.clone();
        let actuation = match self.leaf_decider.decide(&telemetry, &policy) {
            Ok(actuation) => actuation,
            Err(e) => {
                warn!(error = %e, "leaf decider rejected input, reusing previous actuation");
                return Ok(());
            }
        };

        if policy.is_shutdown() {
            return Ok(());
        }

        if let Err(e) = self.platform.tdp_limit(actuation.tdp_percent) {
            warn!(error = %e, "platform tdp_limit write failed, controller stopping");
            return Err(e);
        }
        let affinity = policy.flags.affinity().unwrap_or(crate::policy::Affinity::Compact);
        if let Err(e) = self.platform.manual_frequency(actuation.frequency_mhz, policy.flags.num_max_perf(), affinity) {
            warn!(error = %e, "platform manual_frequency write failed, controller stopping");
            return Err(e);
        }
        Ok(())
    }
}

fn platform_num_domain<I: PlatformImp>(platform: &Platform<I>) -> usize {
    platform.num_domain(crate::platform::ControlType::PerformanceCounter) as usize
}

fn sample_to_telemetry(sample: &SampleMessage) -> RegionTelemetry {
    RegionTelemetry {
        total_energy: sample.energy,
        max_runtime: sample.runtime,
        mean_frequency: sample.frequency,
        mean_progress: sample.progress,
        num_children: 1,
    }
}

fn aggregate_domain_samples(marker: RegionMarker, samples: &[crate::platform::DomainSample]) -> SampleMessage {
    let n = samples.len().max(1) as f64;
    let energy: f64 = samples.iter().map(|s| s.pkg_energy_j + s.pp0_energy_j + s.dram_energy_j).sum();
    let frequency: f64 = samples.iter().map(|s| s.frequency_mhz).sum::<f64>() / n;
    SampleMessage {
        region_id: marker.region_id,
        runtime: marker.runtime,
        progress: marker.progress,
        energy,
        frequency,
    }
}

fn aggregate_children(region_id: u64, children: &[SampleMessage]) -> SampleMessage {
    let n = children.len().max(1) as f64;
    SampleMessage {
        region_id,
        runtime: children.iter().map(|c| c.runtime).fold(0.0, f64::max),
        progress: children.iter().map(|c| c.progress).sum::<f64>() / n,
        energy: children.iter().map(|c| c.energy).sum(),
        frequency: children.iter().map(|c| c.frequency).sum::<f64>() / n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::ChannelFabric;
    use crate::global_policy::PolicyDescriptor;
    use crate::platform_imp::{FakeMsrBackend, ManyCorePlatformImp, Topology};

    fn single_level_controller() -> Controller<ChannelFabric, ManyCorePlatformImp<FakeMsrBackend>> {
        let topology = Topology { num_package: 1, num_tile: 1, num_logical_cpu: 4, num_cpu_per_core: 4 };
        let mut imp = ManyCorePlatformImp::new(FakeMsrBackend::default(), topology);
        imp.msr_initialize().unwrap();
        let platform = Platform::new(imp);
        let tree = TreeCommunicator::new(vec![1], vec![ChannelFabric::new()]).unwrap();

        let path = std::env::temp_dir().join(format!("pwrctl-test-controller-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"mode":"freq_uniform_static","options":{"cpu_mhz":1800}}"#).unwrap();
        let global_policy = GlobalPolicy::new(Some(PolicyDescriptor::File(path)), None);

        Controller::new(platform, tree, Mode::FreqUniformStatic, Some(global_policy), Duration::from_millis(1))
    }

    fn single_level_controller_no_policy() -> Controller<ChannelFabric, ManyCorePlatformImp<FakeMsrBackend>> {
        let topology = Topology { num_package: 1, num_tile: 1, num_logical_cpu: 4, num_cpu_per_core: 4 };
        let mut imp = ManyCorePlatformImp::new(FakeMsrBackend::default(), topology);
        imp.msr_initialize().unwrap();
        let platform = Platform::new(imp);
        let tree = TreeCommunicator::new(vec![1], vec![ChannelFabric::new()]).unwrap();
        Controller::new(platform, tree, Mode::FreqUniformStatic, None, Duration::from_millis(1))
    }

    #[test]
    fn step_applies_root_policy_and_actuates_leaf() {
        let mut controller = single_level_controller();
        let marker = RegionMarker { region_id: 1, runtime: 1.0, progress: 0.3 };
        // First step: walk_down polls the root policy before the region
        // exists (walk_down runs before walk_up within step()), so the
        // region is created this step with no policy applied yet. The
        // cached policy then catches it up on the very next step.
        controller.step(marker).unwrap();
        controller.step(marker).unwrap();
        let region = &controller.regions[0][&1];
        assert_eq!(region.current_policy.mode, Mode::FreqUniformStatic);
        assert_eq!(region.last_policy_version, 1);
    }

    #[test]
    fn distinct_region_ids_get_distinct_region_instances() {
        let mut controller = single_level_controller();
        controller.step(RegionMarker { region_id: 1, runtime: 1.0, progress: 0.3 }).unwrap();
        controller.step(RegionMarker { region_id: 2, runtime: 2.0, progress: 0.6 }).unwrap();
        assert_eq!(controller.regions[0].len(), 2);
        assert_eq!(controller.regions[0][&1].region_id, 1);
        assert_eq!(controller.regions[0][&2].region_id, 2);
        assert_ne!(controller.regions[0][&1].telemetry().max_runtime, controller.regions[0][&2].telemetry().max_runtime);
    }

    #[tokio::test]
    async fn run_returns_after_shutdown_policy() {
        let mut controller = single_level_controller_no_policy();
        let marker = RegionMarker { region_id: 1, runtime: 1.0, progress: 0.3 };
        controller.region_entry(0, marker.region_id).current_policy.mode = Mode::Shutdown;
        controller.regions[0].get_mut(&marker.region_id).unwrap().last_policy_version = 1;
        let result = controller.run(marker).await;
        assert!(result.is_ok());
    }

    #[test]
    fn status_reports_one_entry_per_level() {
        let mut controller = single_level_controller();
        let marker = RegionMarker { region_id: 1, runtime: 1.0, progress: 0.3 };
        controller.step(marker).unwrap();
        controller.step(marker).unwrap();
        let status = controller.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].level, 0);
        assert_eq!(status[0].region_id, 1);
        assert_eq!(status[0].policy_mode, Mode::FreqUniformStatic);
    }

    #[test]
    fn tree_decider_splits_budget_into_target_vector_for_single_send() {
        // Two tree levels, fanout {4, 4} (Scenario S4): verifies the
        // level-1 region's target vector is populated via update_all and
        // carried on one PolicyMessage, not leaked across a coalescing
        // per-child loop.
        let topology = Topology { num_package: 1, num_tile: 1, num_logical_cpu: 4, num_cpu_per_core: 4 };
        let mut imp = ManyCorePlatformImp::new(FakeMsrBackend::default(), topology);
        imp.msr_initialize().unwrap();
        let platform = Platform::new(imp);
        let tree = TreeCommunicator::new(vec![4, 4], vec![ChannelFabric::new(), ChannelFabric::new()]).unwrap();
        let mut controller = Controller::new(platform, tree, Mode::FreqUniformStatic, None, Duration::from_millis(1));

        // Level 0's region for region_id=7 holds the 4 children level 1
        // aggregates over; level 1's own region just needs to exist.
        let children: Vec<SampleMessage> = (0..4)
            .map(|_| SampleMessage { region_id: 7, runtime: 1.0, progress: 0.5, energy: 10.0, frequency: 2000.0 })
            .collect();
        controller.region_entry(0, 7).insert(children);
        controller.region_entry(1, 7);

        let msg = PolicyMessage {
            mode: Mode::FreqUniformStatic,
            power_budget_watts: 800.0,
            flags: Flags::default(),
            num_sample: 0,
            target: Vec::new(),
            version: 1,
        };
        controller.apply_policy_to_region(1, 7, &msg).unwrap();

        let region = &controller.regions[1][&7];
        assert_eq!(region.current_policy.target.len(), 4);
        let sum: f64 = region.current_policy.target.iter().sum();
        assert!((sum - 800.0).abs() < 1e-9);
    }
}
