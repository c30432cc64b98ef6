use crate::{
    cycle_state::CycleState,
    labels::{self, FabricTier},
    listers::SharedListers,
    models::{NodeInfo, PodInfo},
    plugins::{
        Code, DefaultNormalizeScore, FilterPlugin, Plugin, ScoreExtension, ScorePlugin, Status,
    },
};

pub const NAME: &str = "NetworkFabric";

/// Inter-accelerator network placement: filters nodes below a pod's declared
/// minimum fabric tier, and scores by fabric quality plus colocation with
/// already-placed gang peers.
pub struct NetworkFabric {
    listers: SharedListers,
}

impl NetworkFabric {
    pub fn new(listers: SharedListers) -> Self {
        Self { listers }
    }
}

impl Plugin for NetworkFabric {
    fn name(&self) -> &str {
        NAME
    }
}

fn node_fabric_tier(node: &NodeInfo) -> FabricTier {
    node.label(labels::FABRIC_TYPE_LABEL)
        .map(FabricTier::parse)
        .unwrap_or(FabricTier::Unknown)
}

impl FilterPlugin for NetworkFabric {
    fn filter(&self, _: &CycleState, pod: &PodInfo, node_info: &NodeInfo) -> Status {
        let minimum = match pod.annotation(labels::MIN_FABRIC_TIER_ANNOTATION) {
            Some(value) => FabricTier::parse(value),
            None => return Status::default(),
        };
        let tier = node_fabric_tier(node_info);
        if tier < minimum {
            Status::new(
                Code::Unschedulable,
                vec![format!(
                    "node fabric {tier:?} below required minimum {minimum:?}"
                )],
            )
        } else {
            Status::default()
        }
    }
}

/// Colocation comparison of one topology label across the candidate and the
/// gang's already-placed peers.
fn colocation_delta(
    candidate: Option<&str>,
    peer_values: &[String],
    bonus: i64,
) -> i64 {
    if peer_values.is_empty() {
        return 0;
    }
    match candidate {
        Some(value) if peer_values.iter().any(|p| p == value) => bonus,
        _ => -bonus,
    }
}

impl ScorePlugin for NetworkFabric {
    fn score(&self, _: &CycleState, pod: &PodInfo, node_info: &NodeInfo) -> (i64, Status) {
        let mut score = node_fabric_tier(node_info).base_score();

        // Gang membership implies colocation with peers; the co-locate
        // annotation requests it explicitly, naming the peer group.
        let peer_group = labels::gang_group(pod).map(|(group, _)| group).or_else(|| {
            pod.annotation(labels::CO_LOCATE_ANNOTATION)
                .map(str::to_string)
        });
        if let Some(group) = peer_group {
            let peer_nodes: Vec<NodeInfo> = self
                .listers
                .bound_gang_peer_nodes(&pod.namespace, &group, &pod.key())
                .into_iter()
                .filter_map(|name| self.listers.get_node(&name))
                .collect();

            let collect = |label: &str| -> Vec<String> {
                peer_nodes
                    .iter()
                    .filter_map(|n| n.label(label).map(str::to_string))
                    .collect()
            };

            score += colocation_delta(
                node_info.label(labels::FABRIC_ID_LABEL),
                &collect(labels::FABRIC_ID_LABEL),
                30,
            );
            score += colocation_delta(
                node_info.label(labels::RACK_ID_LABEL),
                &collect(labels::RACK_ID_LABEL),
                20,
            );
            score += colocation_delta(
                node_info.label(labels::AZ_LABEL),
                &collect(labels::AZ_LABEL),
                10,
            );
        }

        score = score.clamp(0, 100);
        if pod.annotation(labels::NETWORK_SENSITIVE_ANNOTATION) == Some("true") {
            score = (score * 3 / 2).clamp(0, 100);
        }
        (score, Status::default())
    }

    fn score_extension(&self) -> Box<dyn ScoreExtension> {
        Box::new(DefaultNormalizeScore {
            max_score: 100,
            reverse: false,
        })
    }
}
