use std::collections::HashMap;

use crate::{
    cycle_state::CycleState,
    labels,
    listers::SharedListers,
    models::{NodeInfo, PodInfo, ResourcesRequirements},
    plugins::{Code, Nomination, Plugin, PostFilterPlugin, Status},
};

pub const NAME: &str = "GangPreemption";

/// Upper bound on victims considered for one nomination.
const MAX_VICTIMS: usize = 50;

/// When filtering left a gang member nowhere to go, pick lower-priority
/// bound pods whose eviction frees enough capacity for the whole gang.
pub struct GangPreemption {
    listers: SharedListers,
}

impl GangPreemption {
    pub fn new(listers: SharedListers) -> Self {
        Self { listers }
    }
}

impl Plugin for GangPreemption {
    fn name(&self) -> &str {
        NAME
    }
}

impl PostFilterPlugin for GangPreemption {
    fn post_filter(
        &self,
        _state: &CycleState,
        pod: &PodInfo,
        _nodes: &[NodeInfo],
    ) -> (Option<Nomination>, Status) {
        let (group, min_count) = match labels::gang_group(pod) {
            Some(membership) => membership,
            // Preemption only rescues gangs.
            None => {
                return (
                    None,
                    Status::new(Code::Unschedulable, vec!["not a gang member".to_string()]),
                );
            }
        };

        // Aggregate need of the whole gang, per-member demand times size.
        let mut need = ResourcesRequirements::default();
        for _ in 0..min_count {
            need.add(&pod.spec.resources);
        }

        let mut candidates: Vec<PodInfo> = self
            .listers
            .bound_pods()
            .into_iter()
            .filter(|candidate| {
                candidate.spec.priority < pod.spec.priority
                    && !(candidate.namespace == pod.namespace
                        && matches!(labels::gang_group(candidate), Some((g, _)) if g == group))
            })
            .collect();
        // Lowest priority first, then smaller pods, to minimize disruption.
        candidates.sort_by(|a, b| {
            (a.spec.priority, a.spec.resources.cpu).cmp(&(b.spec.priority, b.spec.resources.cpu))
        });

        let mut freed = ResourcesRequirements::default();
        let mut victims: Vec<PodInfo> = Vec::new();
        for candidate in candidates {
            if need.fits_within(&freed) || victims.len() >= MAX_VICTIMS {
                break;
            }
            freed.add(&candidate.spec.resources);
            victims.push(candidate);
        }

        if !need.fits_within(&freed) {
            return (
                None,
                Status::new(
                    Code::Unschedulable,
                    vec![format!(
                        "preemption found no victim set covering gang {group} demand"
                    )],
                ),
            );
        }

        // Nominate the node where eviction frees the most CPU.
        let mut freed_cpu_by_node: HashMap<String, u64> = HashMap::new();
        for victim in &victims {
            if let Some(node) = victim.spec.node_name.as_ref().or(victim.scheduled.as_ref()) {
                *freed_cpu_by_node.entry(node.clone()).or_default() += victim.spec.resources.cpu;
            }
        }
        let node_name = match freed_cpu_by_node
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        {
            Some((node, _)) => node,
            None => {
                return (
                    None,
                    Status::new(
                        Code::Unschedulable,
                        vec!["victims carry no node assignment".to_string()],
                    ),
                );
            }
        };

        let victim_keys: Vec<String> = victims.iter().map(|v| v.key()).collect();
        log::info!(
            "nominating node {node_name} for gang {group}: evicting {} pod(s)",
            victim_keys.len()
        );
        (
            Some(Nomination {
                node_name,
                victims: victim_keys,
            }),
            Status::default(),
        )
    }
}
