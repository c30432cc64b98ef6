use std::time::Duration;

use crate::{
    cycle_state::CycleState,
    gang::SharedGangDirectory,
    labels,
    listers::SharedListers,
    metrics,
    models::{NodeInfo, PodInfo},
    plugins::{Code, PermitPlugin, Plugin, PreFilterPlugin, Status},
    waiting_room::SharedWaitingRoom,
};

pub const NAME: &str = "GangCoordinator";

/// Drives gang assembly: the PreFilter gathering gate keeps members out of
/// the pipeline until enough of them are pending, and the Permit gate holds
/// admitted members in the waiting room until `min_count` of them have
/// reserved capacity.
pub struct GangCoordinator {
    listers: SharedListers,
    directory: SharedGangDirectory,
    waiting_room: SharedWaitingRoom,
    permit_timeout: Duration,
}

impl GangCoordinator {
    pub fn new(
        listers: SharedListers,
        directory: SharedGangDirectory,
        waiting_room: SharedWaitingRoom,
        permit_timeout: Duration,
    ) -> Self {
        Self {
            listers,
            directory,
            waiting_room,
            permit_timeout,
        }
    }
}

impl Plugin for GangCoordinator {
    fn name(&self) -> &str {
        NAME
    }
}

impl PreFilterPlugin for GangCoordinator {
    fn pre_filter(&self, _state: &mut CycleState, pod: &PodInfo, _nodes: &[NodeInfo]) -> Status {
        let (group, min_count) = match labels::gang_group(pod) {
            Some(membership) => membership,
            None => return Status::default(),
        };
        let gang_key = labels::gang_key(&pod.namespace, &group);
        self.directory
            .observe_member(&gang_key, &pod.namespace, &group, min_count, pod.uid);

        let observed = self.listers.pending_gang_members(&pod.namespace, &group).len() as u32;
        metrics::POD_GROUP_SIZE
            .with_label_values(&[&pod.namespace])
            .observe(observed as f64);

        if observed < min_count {
            Status::new(
                Code::Unschedulable,
                vec![format!("gang gathering: {observed}/{min_count}")],
            )
        } else {
            Status::default()
        }
    }
}

impl PermitPlugin for GangCoordinator {
    fn permit(&self, _state: &CycleState, pod: &PodInfo, _node_name: &str) -> (Status, Duration) {
        let (group, min_count) = match labels::gang_group(pod) {
            Some(membership) => membership,
            None => return (Status::default(), Duration::ZERO),
        };
        if min_count <= 1 {
            // A gang of one needs no gate.
            return (Status::default(), Duration::ZERO);
        }
        let gang_key = labels::gang_key(&pod.namespace, &group);

        let bound = self.listers.bound_gang_member_count(&pod.namespace, &group) as u32;
        let waiting = self.directory.waiting_count(&gang_key) as u32;
        let ready = bound + waiting;

        // This pod counts toward the gate.
        if ready + 1 >= min_count {
            let released = self.waiting_room.allow_group(&pod.namespace, &group) as u32;
            self.directory.take_waiters(&gang_key);
            self.directory.record_admitted(&gang_key, released + 1);
            log::info!(
                "gang {gang_key} reached quorum ({}/{min_count}); released {released} waiter(s)",
                ready + 1
            );
            (Status::default(), Duration::ZERO)
        } else {
            self.directory.record_waiting(&gang_key, pod.uid);
            (
                Status::new(
                    Code::Wait,
                    vec![format!("gang assembling: {}/{min_count} ready", ready + 1)],
                ),
                self.permit_timeout,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gang::GangDirectory;
    use crate::listers::Listers;
    use crate::waiting_room::WaitingRoom;
    use uuid::Uuid;

    fn gang_pod(name: &str, group: &str, min: u32) -> PodInfo {
        let mut pod = PodInfo {
            uid: Uuid::new_v4(),
            name: name.to_string(),
            namespace: "ml".to_string(),
            ..Default::default()
        };
        pod.labels
            .insert(labels::GANG_NAME_LABEL.to_string(), group.to_string());
        pod.labels
            .insert(labels::GANG_MIN_AVAILABLE_LABEL.to_string(), min.to_string());
        pod
    }

    fn coordinator() -> (GangCoordinator, SharedListers, SharedGangDirectory, SharedWaitingRoom) {
        let listers = Listers::new();
        let directory = GangDirectory::new();
        let room = WaitingRoom::new();
        let plugin = GangCoordinator::new(
            listers.clone(),
            directory.clone(),
            room.clone(),
            Duration::from_secs(60),
        );
        (plugin, listers, directory, room)
    }

    #[test]
    fn test_pre_filter_gathering_gate() {
        let (plugin, listers, _, _) = coordinator();
        let pod = gang_pod("w-0", "trainer", 3);
        listers.upsert_pod(pod.clone());

        let mut state = CycleState::default();
        let status = plugin.pre_filter(&mut state, &pod, &[]);
        assert_eq!(status.code, Code::Unschedulable);
        assert!(status.reasons[0].contains("gang gathering: 1/3"));

        listers.upsert_pod(gang_pod("w-1", "trainer", 3));
        listers.upsert_pod(gang_pod("w-2", "trainer", 3));
        assert!(plugin.pre_filter(&mut state, &pod, &[]).is_success());
    }

    #[test]
    fn test_pre_filter_ignores_non_gang() {
        let (plugin, _, _, _) = coordinator();
        let pod = PodInfo::default();
        let mut state = CycleState::default();
        assert!(plugin.pre_filter(&mut state, &pod, &[]).is_success());
    }

    #[tokio::test]
    async fn test_permit_waits_then_releases_in_order() {
        let (plugin, listers, directory, room) = coordinator();
        let pods: Vec<PodInfo> = (0..3).map(|i| gang_pod(&format!("w-{i}"), "trainer", 3)).collect();
        for pod in &pods {
            listers.upsert_pod(pod.clone());
        }
        let state = CycleState::default();

        // First two members wait.
        let (status, timeout) = plugin.permit(&state, &pods[0], "n1");
        assert_eq!(status.code, Code::Wait);
        assert_eq!(timeout, Duration::from_secs(60));
        let rx0 = room.park(pods[0].uid, "ml", "trainer");

        let (status, _) = plugin.permit(&state, &pods[1], "n2");
        assert_eq!(status.code, Code::Wait);
        let rx1 = room.park(pods[1].uid, "ml", "trainer");

        // Third member completes the gate and releases both waiters.
        let (status, _) = plugin.permit(&state, &pods[2], "n3");
        assert!(status.is_success());
        assert!(rx0.await.is_ok());
        assert!(rx1.await.is_ok());
        assert_eq!(directory.waiting_count("ml/trainer"), 0);
        assert!(room.is_empty());
    }

    #[test]
    fn test_permit_min_count_one_never_waits() {
        let (plugin, listers, _, _) = coordinator();
        let pod = gang_pod("solo", "solo-group", 1);
        listers.upsert_pod(pod.clone());
        let state = CycleState::default();
        let (status, _) = plugin.permit(&state, &pod, "n1");
        assert!(status.is_success());
    }

    #[test]
    fn test_permit_counts_bound_members() {
        let (plugin, listers, _, _) = coordinator();
        // Two members already bound, the third arrives.
        for i in 0..2 {
            let mut bound = gang_pod(&format!("w-{i}"), "trainer", 3);
            bound.spec.node_name = Some(format!("n{i}"));
            listers.upsert_pod(bound);
        }
        let pod = gang_pod("w-2", "trainer", 3);
        listers.upsert_pod(pod.clone());

        let state = CycleState::default();
        let (status, _) = plugin.permit(&state, &pod, "n2");
        assert!(status.is_success());
    }
}
