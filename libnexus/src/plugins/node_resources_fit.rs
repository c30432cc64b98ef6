use crate::{
    cycle_state::CycleState,
    models::{NodeInfo, PodInfo, ResourcesRequirements},
    plugins::{
        Code, DefaultNormalizeScore, FilterPlugin, Plugin, PreFilterPlugin, ScoreExtension,
        ScorePlugin, Status,
    },
};

pub const NAME: &str = "NodeResourcesFit";

/// The standard fit filter: resources and node selectors. Also scores nodes
/// by allocation according to the configured strategy.
pub struct Fit {
    strategy: ScoringStrategy,
}

impl Fit {
    pub fn new(strategy: ScoringStrategy) -> Self {
        Self { strategy }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ScoringStrategy {
    #[default]
    LeastAllocated,
    MostAllocated,
}

impl Plugin for Fit {
    fn name(&self) -> &str {
        NAME
    }
}

struct PreFilterState {
    pod_requests: ResourcesRequirements,
}

const PRE_FILTER_KEY: &str = "PreFilterNodeResourcesFit";

impl PreFilterPlugin for Fit {
    fn pre_filter(&self, state: &mut CycleState, pod: &PodInfo, _nodes: &[NodeInfo]) -> Status {
        let pod_requests = pod.spec.resources.clone();
        state.write(PRE_FILTER_KEY, Box::new(PreFilterState { pod_requests }));
        Status::default()
    }
}

fn is_fit(pod_requests: &ResourcesRequirements, node: &NodeInfo) -> bool {
    pod_requests.fits_within(&node.available())
}

fn selector_matches(pod: &PodInfo, node: &NodeInfo) -> bool {
    pod.spec
        .node_selector
        .iter()
        .all(|(k, v)| node.labels.get(k) == Some(v))
}

const ERR_REASON_RESOURCES: &str = "node(s) didn't have enough resource(s)";
const ERR_REASON_SELECTOR: &str = "node(s) didn't match pod node selector";

impl FilterPlugin for Fit {
    fn filter(&self, state: &CycleState, pod: &PodInfo, node_info: &NodeInfo) -> Status {
        if !selector_matches(pod, node_info) {
            return Status::new(
                Code::UnschedulableAndUnresolvable,
                vec![ERR_REASON_SELECTOR.to_string()],
            );
        }
        match state.read::<PreFilterState>(PRE_FILTER_KEY) {
            Some(sta) => {
                if !is_fit(&sta.pod_requests, node_info) {
                    Status::new(Code::Unschedulable, vec![ERR_REASON_RESOURCES.to_string()])
                } else {
                    Status::default()
                }
            }
            None => Status::error("failed to read pre-filter state"),
        }
    }
}

impl ScorePlugin for Fit {
    fn score(&self, state: &CycleState, _pod: &PodInfo, node_info: &NodeInfo) -> (i64, Status) {
        let sta = match state.read::<PreFilterState>(PRE_FILTER_KEY) {
            Some(sta) => sta,
            None => {
                return (0, Status::error("failed to read pre-filter state"));
            }
        };
        let score = match self.strategy {
            ScoringStrategy::MostAllocated => {
                calculate_most_allocated_score(&sta.pod_requests, node_info)
            }
            ScoringStrategy::LeastAllocated => {
                100 - calculate_most_allocated_score(&sta.pod_requests, node_info)
            }
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

fn calculate_most_allocated_score(
    pod_requests: &ResourcesRequirements,
    node_info: &NodeInfo,
) -> i64 {
    let allocatable = &node_info.allocatable;
    let requested = &node_info.requested;

    let cpu_utilization = if allocatable.cpu > 0 {
        (requested.cpu + pod_requests.cpu) as f64 / allocatable.cpu as f64
    } else {
        0.0
    };

    let memory_utilization = if allocatable.memory > 0 {
        (requested.memory + pod_requests.memory) as f64 / allocatable.memory as f64
    } else {
        0.0
    };

    let avg_utilization = ((cpu_utilization + memory_utilization) / 2.0).min(1.0);
    (avg_utilization * 100.0) as i64
}
