use crate::{
    cycle_state::CycleState,
    labels,
    models::{NodeInfo, PodInfo},
    plugins::{
        DefaultNormalizeScore, Plugin, ScoreExtension, ScorePlugin, Status, classifier::profile_of,
    },
    profile::PREEMPTIBLE_PRIORITY_CEILING,
};

pub const NAME: &str = "Backfill";

/// Preemptible work fills capacity gaps on idle nodes; regular work
/// consolidates onto busy ones so the gaps stay large.
pub struct Backfill;

impl Plugin for Backfill {
    fn name(&self) -> &str {
        NAME
    }
}

fn is_preemptible(state: &CycleState, pod: &PodInfo) -> bool {
    if let Some(profile) = profile_of(state) {
        return profile.is_preemptible;
    }
    pod.label(labels::PREEMPTIBLE_LABEL) == Some("true")
        || pod.annotation(labels::BACKFILL_ANNOTATION) == Some("true")
        || pod.spec.priority <= PREEMPTIBLE_PRIORITY_CEILING
}

/// Utilization in percent, CPU weighted 0.6 and memory 0.4.
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
    (((0.6 * cpu + 0.4 * memory) * 100.0) as i64).min(100)
}

impl ScorePlugin for Backfill {
    fn score(&self, state: &CycleState, pod: &PodInfo, node_info: &NodeInfo) -> (i64, Status) {
        let u = utilization(node_info);
        let score = if is_preemptible(state, pod) { 100 - u } else { u };
        (score.clamp(0, 100), Status::default())
    }

    fn score_extension(&self) -> Box<dyn ScoreExtension> {
        Box::new(DefaultNormalizeScore {
            max_score: 100,
            reverse: false,
        })
    }
}
