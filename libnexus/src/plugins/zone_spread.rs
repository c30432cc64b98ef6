use crate::{
    cycle_state::CycleState,
    labels,
    listers::SharedListers,
    models::{NodeInfo, PodInfo},
    plugins::{
        DefaultNormalizeScore, Plugin, ScoreExtension, ScorePlugin, Status, classifier::profile_of,
    },
    profile::WorkloadClass,
};

pub const NAME: &str = "ZoneSpread";

/// How zone population is measured.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ZoneCountMode {
    /// Nodes per zone as a proxy for load.
    #[default]
    NodeCount,
    /// Scheduled pods per zone.
    PodCount,
}

/// Prefers less-populated zones for traffic-serving workloads; batch work is
/// indifferent.
pub struct ZoneSpread {
    listers: SharedListers,
    mode: ZoneCountMode,
}

impl ZoneSpread {
    pub fn new(listers: SharedListers, mode: ZoneCountMode) -> Self {
        Self { listers, mode }
    }
}

impl Plugin for ZoneSpread {
    fn name(&self) -> &str {
        NAME
    }
}

const NEUTRAL: i64 = 50;

impl ScorePlugin for ZoneSpread {
    fn score(&self, state: &CycleState, _pod: &PodInfo, node_info: &NodeInfo) -> (i64, Status) {
        let class = profile_of(state)
            .map(|p| p.workload_class)
            .unwrap_or(WorkloadClass::Unknown);
        if class == WorkloadClass::Batch {
            return (NEUTRAL, Status::default());
        }

        let zone = match node_info.label(labels::ZONE_LABEL) {
            Some(zone) => zone.to_string(),
            None => return (NEUTRAL, Status::default()),
        };

        let nodes = self.listers.nodes();
        let (in_zone, total) = match self.mode {
            ZoneCountMode::NodeCount => {
                let total = nodes.len();
                let in_zone = nodes
                    .iter()
                    .filter(|n| n.label(labels::ZONE_LABEL) == Some(zone.as_str()))
                    .count();
                (in_zone, total)
            }
            ZoneCountMode::PodCount => {
                let counts = self.listers.scheduled_pod_counts();
                let total: usize = counts.values().sum();
                let in_zone = nodes
                    .iter()
                    .filter(|n| n.label(labels::ZONE_LABEL) == Some(zone.as_str()))
                    .map(|n| counts.get(&n.name).copied().unwrap_or(0))
                    .sum();
                (in_zone, total)
            }
        };

        if total == 0 {
            return (NEUTRAL, Status::default());
        }
        let score = 100 - (100 * in_zone / total) as i64;
        (score.clamp(0, 100), Status::default())
    }

    fn score_extension(&self) -> Box<dyn ScoreExtension> {
        Box::new(DefaultNormalizeScore {
            max_score: 100,
            reverse: false,
        })
    }
}
