use crate::cycle_state::{CycleState, PROFILE_KEY};
use crate::listers::SharedListers;
use crate::models::{NodeInfo, PodInfo};
use crate::plugins::{Plugin, PreFilterPlugin, Status};
use crate::profile::{self, SchedulingProfile};

pub const NAME: &str = "WorkloadClassifier";

/// Enriches cycle state with the pod's scheduling profile. Never fails a
/// cycle; unresolved dimensions default.
pub struct WorkloadClassifier {
    listers: SharedListers,
}

impl WorkloadClassifier {
    pub fn new(listers: SharedListers) -> Self {
        Self { listers }
    }
}

impl Plugin for WorkloadClassifier {
    fn name(&self) -> &str {
        NAME
    }
}

impl PreFilterPlugin for WorkloadClassifier {
    fn pre_filter(&self, state: &mut CycleState, pod: &PodInfo, _nodes: &[NodeInfo]) -> Status {
        let ns_labels = self.listers.namespace_labels(&pod.namespace);
        let profile = profile::classify(pod, ns_labels.as_ref());
        log::debug!(
            "classified pod {}: tier {:?} class {:?} gang {} preemptible {}",
            pod.key(),
            profile.tenant_tier,
            profile.workload_class,
            profile.is_gang,
            profile.is_preemptible
        );
        state.write(PROFILE_KEY, Box::new(profile));
        Status::default()
    }
}

/// The profile stashed by this plugin, when the classifier ran this cycle.
pub fn profile_of(state: &CycleState) -> Option<&SchedulingProfile> {
    state.read::<SchedulingProfile>(PROFILE_KEY)
}
