//! Scheduling plugins.
//!
//! The pipeline sees every plugin through one of the fixed capability traits
//! below. The set of enabled plugins and their score weights come from
//! configuration; nothing registers after startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::cycle_state::CycleState;
use crate::gang::{SharedGangDirectory, SharedSentinels};
use crate::listers::SharedListers;
use crate::models::{NodeInfo, PodInfo};
use crate::plugins::backfill::Backfill;
use crate::plugins::classifier::WorkloadClassifier;
use crate::plugins::fabric::NetworkFabric;
use crate::plugins::fragmentation::ResourceFragmentation;
use crate::plugins::gang::GangCoordinator;
use crate::plugins::gang_preemption::GangPreemption;
use crate::plugins::node_resources_fit::{Fit, ScoringStrategy};
use crate::plugins::reservation::{ReservationCommand, ReservationManager};
use crate::plugins::taint_toleration::TaintToleration;
use crate::plugins::tenant_affinity::TenantHardwareAffinity;
use crate::plugins::vram::VramFit;
use crate::plugins::workload_spread::WorkloadSpread;
use crate::plugins::zone_spread::{ZoneCountMode, ZoneSpread};
use crate::waiting_room::SharedWaitingRoom;

pub mod backfill;
pub mod classifier;
pub mod fabric;
pub mod fragmentation;
pub mod gang;
pub mod gang_preemption;
pub mod node_resources_fit;
pub mod reservation;
pub mod taint_toleration;
pub mod tenant_affinity;
pub mod vram;
pub mod workload_spread;
pub mod zone_spread;

/// Plugin specifies a plugin name and its weight when applicable. Weight is
/// used only for Score plugins.
#[derive(Clone, Debug)]
pub struct PluginInfo {
    pub name: String,
    pub weight: i64,
}

impl PluginInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            weight: 0,
        }
    }

    pub fn with_weight(name: &str, weight: i64) -> Self {
        Self {
            name: name.to_string(),
            weight,
        }
    }
}

/// List of enabled plugins per extension point.
#[derive(Clone, Debug)]
pub struct Plugins {
    pub pre_filter: Vec<PluginInfo>,
    pub filter: Vec<PluginInfo>,
    pub post_filter: Vec<PluginInfo>,
    pub score: Vec<PluginInfo>,
    pub permit: Vec<PluginInfo>,
    pub post_bind: Vec<PluginInfo>,
}

impl Default for Plugins {
    fn default() -> Self {
        Self {
            pre_filter: vec![
                PluginInfo::new(classifier::NAME),
                PluginInfo::new(reservation::NAME),
                PluginInfo::new(gang::NAME),
            ],
            filter: vec![
                PluginInfo::new(node_resources_fit::NAME),
                PluginInfo::new(taint_toleration::NAME),
                PluginInfo::new(vram::NAME),
                PluginInfo::new(fabric::NAME),
                PluginInfo::new(reservation::NAME),
            ],
            post_filter: vec![PluginInfo::new(gang_preemption::NAME)],
            score: vec![
                PluginInfo::with_weight(workload_spread::NAME, 1),
                PluginInfo::with_weight(backfill::NAME, 1),
                PluginInfo::with_weight(fragmentation::NAME, 2),
                PluginInfo::with_weight(tenant_affinity::NAME, 1),
                PluginInfo::with_weight(fabric::NAME, 2),
                PluginInfo::with_weight(vram::NAME, 1),
                PluginInfo::with_weight(zone_spread::NAME, 1),
            ],
            permit: vec![PluginInfo::new(gang::NAME)],
            post_bind: vec![PluginInfo::new(reservation::NAME)],
        }
    }
}

pub trait Plugin {
    fn name(&self) -> &str;
}

/// Executes at scheduling cycle start. Any non-success short-circuits the
/// cycle and requeues the pod.
pub trait PreFilterPlugin: Plugin + Send + Sync {
    fn pre_filter(&self, state: &mut CycleState, pod: &PodInfo, nodes: &[NodeInfo]) -> Status;
}

/// Evaluates whether a node can run a pod. May read cycle state, must not
/// mutate it; a node survives only if every filter returns success.
pub trait FilterPlugin: Plugin + Send + Sync {
    fn filter(&self, state: &CycleState, pod: &PodInfo, node_info: &NodeInfo) -> Status;
}

/// A node nomination produced after filtering failed everywhere: evicting
/// `victims` is expected to make `node_name` feasible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nomination {
    pub node_name: String,
    pub victims: Vec<String>,
}

/// Executes only when no node survived Filter.
pub trait PostFilterPlugin: Plugin + Send + Sync {
    fn post_filter(
        &self,
        state: &CycleState,
        pod: &PodInfo,
        nodes: &[NodeInfo],
    ) -> (Option<Nomination>, Status);
}

/// Ranks a node that passed filtering. Scores are in [0, 100].
pub trait ScorePlugin: Plugin + Send + Sync {
    fn score(&self, state: &CycleState, pod: &PodInfo, node_info: &NodeInfo) -> (i64, Status);

    fn score_extension(&self) -> Box<dyn ScoreExtension>;
}

pub trait ScoreExtension: Send + Sync {
    fn normalize_score(&self, scores: &mut Vec<i64>) -> Status;
}

pub struct DefaultNormalizeScore {
    pub max_score: i64,
    pub reverse: bool,
}

impl ScoreExtension for DefaultNormalizeScore {
    fn normalize_score(&self, scores: &mut Vec<i64>) -> Status {
        let mut max = 0_i64;
        for node_score in scores.iter() {
            if *node_score > max {
                max = *node_score;
            }
        }

        if max == 0 {
            if self.reverse {
                for node_score in scores.iter_mut() {
                    *node_score = self.max_score;
                }
            }
            return Status::default();
        }

        for node_score in scores.iter_mut() {
            *node_score = self.max_score * (*node_score) / max;
            if self.reverse {
                *node_score = self.max_score - *node_score;
            }
        }
        Status::default()
    }
}

/// Consulted after Reserve; may admit, reject, or suspend the unit.
pub trait PermitPlugin: Plugin + Send + Sync {
    /// Returns the permit decision and, for `Code::Wait`, the timeout.
    fn permit(&self, state: &CycleState, pod: &PodInfo, node_name: &str) -> (Status, Duration);
}

/// Executes after a successful bind; typically cleanup.
pub trait PostBindPlugin: Plugin + Send + Sync {
    fn post_bind(&self, state: &CycleState, pod: &PodInfo, node_name: &str);
}

/// Everything plugin constructors may depend on. Built once at startup.
#[derive(Clone)]
pub struct PluginDeps {
    pub listers: SharedListers,
    pub gang_directory: SharedGangDirectory,
    pub waiting_room: SharedWaitingRoom,
    pub sentinels: SharedSentinels,
    pub reservation_tx: UnboundedSender<ReservationCommand>,
    pub scoring_strategy: ScoringStrategy,
    pub zone_count_mode: ZoneCountMode,
    /// Default waiting-room timeout handed out by the gang permit gate.
    pub permit_timeout: Duration,
}

/// Registry of all available plugins, instantiated once from `PluginDeps`.
#[derive(Clone)]
pub struct Registry {
    pub pre_filter: Vec<Arc<dyn PreFilterPlugin>>,
    pub filter: Vec<Arc<dyn FilterPlugin>>,
    pub post_filter: Vec<Arc<dyn PostFilterPlugin>>,
    pub score: Vec<Arc<dyn ScorePlugin>>,
    pub permit: Vec<Arc<dyn PermitPlugin>>,
    pub post_bind: Vec<Arc<dyn PostBindPlugin>>,
}

impl Registry {
    pub fn new(deps: &PluginDeps) -> Self {
        let classifier = Arc::new(WorkloadClassifier::new(deps.listers.clone()));
        let reservation = Arc::new(ReservationManager::new(
            deps.listers.clone(),
            deps.sentinels.clone(),
            deps.reservation_tx.clone(),
        ));
        let gang = Arc::new(GangCoordinator::new(
            deps.listers.clone(),
            deps.gang_directory.clone(),
            deps.waiting_room.clone(),
            deps.permit_timeout,
        ));
        let fit = Arc::new(Fit::new(deps.scoring_strategy.clone()));
        let taints = Arc::new(TaintToleration);
        let vram = Arc::new(VramFit);
        let fabric = Arc::new(NetworkFabric::new(deps.listers.clone()));
        let workload = Arc::new(WorkloadSpread);
        let backfill = Arc::new(Backfill);
        let fragmentation = Arc::new(ResourceFragmentation);
        let tenant = Arc::new(TenantHardwareAffinity);
        let zone = Arc::new(ZoneSpread::new(
            deps.listers.clone(),
            deps.zone_count_mode.clone(),
        ));
        let preemption = Arc::new(GangPreemption::new(deps.listers.clone()));

        Self {
            pre_filter: vec![classifier.clone(), reservation.clone(), gang.clone()],
            filter: vec![
                fit.clone(),
                taints.clone(),
                vram.clone(),
                fabric.clone(),
                reservation.clone(),
            ],
            post_filter: vec![preemption.clone()],
            score: vec![
                workload.clone(),
                backfill.clone(),
                fragmentation.clone(),
                tenant.clone(),
                fabric.clone(),
                vram.clone(),
                zone.clone(),
                // Available for configs that want allocation-strategy
                // scoring; not in the default suite.
                fit.clone(),
            ],
            permit: vec![gang.clone()],
            post_bind: vec![reservation.clone()],
        }
    }
}

/// Registry filtered down to the configured plugin set, score weights
/// attached.
#[derive(Clone, Default)]
pub struct EnabledPlugins {
    pub pre_filter: Vec<Arc<dyn PreFilterPlugin>>,
    pub filter: Vec<Arc<dyn FilterPlugin>>,
    pub post_filter: Vec<Arc<dyn PostFilterPlugin>>,
    pub score: Vec<(Arc<dyn ScorePlugin>, i64)>,
    pub permit: Vec<Arc<dyn PermitPlugin>>,
    pub post_bind: Vec<Arc<dyn PostBindPlugin>>,
}

impl EnabledPlugins {
    pub fn assemble(registry: &Registry, config: &Plugins) -> Self {
        fn pick<T: ?Sized + Plugin>(
            available: &[Arc<T>],
            wanted: &[PluginInfo],
        ) -> Vec<Arc<T>> {
            wanted
                .iter()
                .filter_map(|info| {
                    let found = available.iter().find(|p| p.name() == info.name);
                    if found.is_none() {
                        log::warn!("unknown plugin {:?} ignored", info.name);
                    }
                    found.cloned()
                })
                .collect()
        }

        let score = config
            .score
            .iter()
            .filter_map(|info| {
                registry
                    .score
                    .iter()
                    .find(|p| p.name() == info.name)
                    .map(|p| (p.clone(), info.weight.max(1)))
            })
            .collect();

        Self {
            pre_filter: pick(&registry.pre_filter, &config.pre_filter),
            filter: pick(&registry.filter, &config.filter),
            post_filter: pick(&registry.post_filter, &config.post_filter),
            score,
            permit: pick(&registry.permit, &config.permit),
            post_bind: pick(&registry.post_bind, &config.post_bind),
        }
    }
}

/// Per-node filter outcomes collected during the Filter phase.
#[derive(Default)]
pub struct NodeToStatus {
    node_to_status: HashMap<String, Status>,
}

impl NodeToStatus {
    pub fn insert(&mut self, node_name: String, status: Status) {
        self.node_to_status.insert(node_name, status);
    }

    pub fn get(&self, node_name: &str) -> Option<&Status> {
        self.node_to_status.get(node_name)
    }

    /// True when every recorded failure is sticky, i.e. preemption cannot
    /// help either.
    pub fn all_unresolvable(&self) -> bool {
        !self.node_to_status.is_empty()
            && self
                .node_to_status
                .values()
                .all(|s| s.code == Code::UnschedulableAndUnresolvable)
    }
}

#[derive(Clone, Debug)]
pub struct Status {
    pub code: Code,
    pub reasons: Vec<String>,
    pub err: String,
    pub plugin: String,
}

impl Default for Status {
    /// Default success status.
    fn default() -> Self {
        Self {
            code: Code::Success,
            reasons: vec![],
            err: String::new(),
            plugin: String::new(),
        }
    }
}

impl Status {
    pub fn new(code: Code, reasons: Vec<String>) -> Self {
        Status {
            code,
            reasons,
            err: String::new(),
            plugin: String::new(),
        }
    }

    pub fn unschedulable(reason: &str) -> Self {
        Self::new(Code::Unschedulable, vec![reason.to_string()])
    }

    pub fn error(error: &str) -> Self {
        Self {
            code: Code::Error,
            err: error.to_string(),
            ..Default::default()
        }
    }

    pub fn with_plugin(mut self, plugin: &str) -> Self {
        self.plugin = plugin.to_string();
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }

    pub fn message(&self) -> String {
        if !self.reasons.is_empty() {
            self.reasons.join("; ")
        } else {
            self.err.clone()
        }
    }
}

/// Code is the Status code/type which is returned from plugins.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Code {
    /// Plugin ran correctly and found the pod schedulable.
    Success,
    /// Internal plugin error, unexpected input, lister or store failure.
    /// Not for expected failures; the pod requeues with backoff.
    Error,
    /// Plugin found the pod unschedulable here and now. PostFilter plugins
    /// such as preemption may still help.
    Unschedulable,
    /// Plugin found the pod unschedulable and no PostFilter plugin would
    /// change that on this node until the node itself changes.
    UnschedulableAndUnresolvable,
    /// A Permit plugin wants the pod parked in the waiting room.
    Wait,
    /// PreFilter asks for the coupled Filter/Score plugin to be skipped.
    Skip,
}
