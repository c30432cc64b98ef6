use crate::{
    cycle_state::CycleState,
    models::{NodeInfo, PodInfo},
    plugins::{
        DefaultNormalizeScore, Plugin, ScoreExtension, ScorePlugin, Status, classifier::profile_of,
    },
    profile::WorkloadClass,
};

pub const NAME: &str = "WorkloadSpread";

/// Hybrid bin-pack/spread scorer: batch-like work packs onto busy nodes,
/// traffic-serving work spreads onto idle ones.
pub struct WorkloadSpread;

impl Plugin for WorkloadSpread {
    fn name(&self) -> &str {
        NAME
    }
}

/// Node utilization in percent, CPU and memory weighted equally, capped at
/// 100.
fn utilization(node: &NodeInfo) -> i64 {
    let cpu = if node.allocatable.cpu > 0 {
        node.requested.cpu as f64 / node.allocatable.cpu as f64
    } else {
        0.0
    };
    let memory = if node.allocatable.memory > 0 {
        node.requested.memory as f64 / node.allocatable.memory as f64
    } else {
        0.0
    };
    (((0.5 * cpu + 0.5 * memory) * 100.0) as i64).min(100)
}

impl ScorePlugin for WorkloadSpread {
    fn score(&self, state: &CycleState, _pod: &PodInfo, node_info: &NodeInfo) -> (i64, Status) {
        let class = profile_of(state)
            .map(|p| p.workload_class)
            .unwrap_or(WorkloadClass::Unknown);
        let u = utilization(node_info);
        let score = match class {
            WorkloadClass::Batch | WorkloadClass::Training => u,
            _ => 100 - u,
        };
        (score.clamp(0, 100), Status::default())
    }

    fn score_extension(&self) -> Box<dyn ScoreExtension> {
        Box::new(DefaultNormalizeScore {
            max_score: 100,
            reverse: false,
        })
    }
}
