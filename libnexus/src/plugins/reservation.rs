use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use common::quantity::{format_cpu, format_memory};
use common::reservation::{RESERVATION_API_VERSION, RESERVATION_KIND};
use common::{ObjectMeta, Reservation, ResourceReservation};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    cycle_state::CycleState,
    gang::SharedSentinels,
    labels,
    listers::{SharedListers, sanitize_gang_key},
    models::{NodeInfo, PodInfo},
    plugins::{FilterPlugin, Plugin, PostBindPlugin, PreFilterPlugin, Status},
};

pub const NAME: &str = "CapacityReservation";

/// Default slot demand when the first container declares no requests.
const DEFAULT_SLOT_CPU_MILLIS: u64 = 1000;
const DEFAULT_SLOT_MEMORY_BYTES: u64 = 750_000_000;

/// Store writes requested by the plugin, executed by the store task.
#[derive(Clone, Debug)]
pub enum ReservationCommand {
    Create {
        record: Box<ResourceReservation>,
        gang_key: String,
    },
    /// Delete every record labeled with the gang key.
    DeleteForGang { namespace: String, gang_key: String },
}

/// Publishes phantom demand while a gang assembles, so other consumers of
/// the store do not claim the capacity the gang still needs.
pub struct ReservationManager {
    listers: SharedListers,
    sentinels: SharedSentinels,
    commands: UnboundedSender<ReservationCommand>,
    /// Pod keys seen binding per gang; the informer echo may lag, this does
    /// not.
    bound: Mutex<HashMap<String, HashSet<String>>>,
}

impl ReservationManager {
    pub fn new(
        listers: SharedListers,
        sentinels: SharedSentinels,
        commands: UnboundedSender<ReservationCommand>,
    ) -> Self {
        Self {
            listers,
            sentinels,
            commands,
            bound: Mutex::new(HashMap::new()),
        }
    }

    /// The record synthesized for a gang's expected slots: one entry per
    /// member, node left empty so the demand applies everywhere.
    fn synthesize(&self, pod: &PodInfo, group: &str, min_count: u32) -> ResourceReservation {
        let cpu = match pod.spec.resources.cpu {
            0 => DEFAULT_SLOT_CPU_MILLIS,
            cpu => cpu,
        };
        let memory = match pod.spec.resources.memory {
            0 => DEFAULT_SLOT_MEMORY_BYTES,
            memory => memory,
        };

        let mut record = ResourceReservation {
            api_version: RESERVATION_API_VERSION.to_string(),
            kind: RESERVATION_KIND.to_string(),
            metadata: ObjectMeta {
                name: format!("{group}-reservation"),
                namespace: pod.namespace.clone(),
                ..Default::default()
            },
            ..Default::default()
        };
        let gang_key = labels::gang_key(&pod.namespace, group);
        record.metadata.labels.insert(
            labels::RESERVATION_GANG_KEY_LABEL.to_string(),
            sanitize_gang_key(&gang_key),
        );
        record.metadata.labels.insert(
            labels::RESERVATION_POD_GROUP_LABEL.to_string(),
            group.to_string(),
        );
        record.metadata.labels.insert(
            labels::RESERVATION_MANAGED_BY_LABEL.to_string(),
            labels::RESERVATION_MANAGER_NAME.to_string(),
        );
        for i in 0..min_count {
            record.spec.reservations.insert(
                format!("{group}-member-{i}"),
                Reservation {
                    node: String::new(),
                    cpu: format_cpu(cpu),
                    memory: format_memory(memory),
                },
            );
        }
        record
    }
}

impl Plugin for ReservationManager {
    fn name(&self) -> &str {
        NAME
    }
}

impl PreFilterPlugin for ReservationManager {
    fn pre_filter(&self, _state: &mut CycleState, pod: &PodInfo, _nodes: &[NodeInfo]) -> Status {
        let (group, min_count) = match labels::gang_group(pod) {
            Some(membership) => membership,
            None => return Status::default(),
        };
        let gang_key = labels::gang_key(&pod.namespace, &group);

        if self.sentinels.try_claim(&gang_key) {
            let record = self.synthesize(pod, &group, min_count);
            log::info!(
                "publishing reservation {} for gang {gang_key} ({min_count} slot(s))",
                record.key()
            );
            if self
                .commands
                .send(ReservationCommand::Create {
                    record: Box::new(record),
                    gang_key: gang_key.clone(),
                })
                .is_err()
            {
                // Store task is gone; re-arm so a later cycle can retry.
                self.sentinels.clear(&gang_key);
                return Status::error("reservation store task unavailable");
            }
        } else if !self.sentinels.is_pending(&gang_key)
            && self.listers.reservations_for_gang(&gang_key).is_empty()
        {
            // The sentinel says created and confirmed, but the record is
            // gone, deleted externally. Re-arm; the next member re-creates.
            log::warn!("reservation for gang {gang_key} missing from store; re-arming creation");
            self.sentinels.clear(&gang_key);
        }
        Status::default()
    }
}

impl FilterPlugin for ReservationManager {
    fn filter(&self, _state: &CycleState, pod: &PodInfo, node_info: &NodeInfo) -> Status {
        // Reservations are advisory here: self-reservations never block, and
        // foreign demand is only surfaced. The authoritative capacity check
        // stays with the fit filter.
        let own_gang_key = labels::gang_group(pod)
            .map(|(group, _)| sanitize_gang_key(&labels::gang_key(&pod.namespace, &group)));

        for record in self.listers.reservations() {
            let record_gang = record.metadata.labels.get(labels::RESERVATION_GANG_KEY_LABEL);
            if record_gang == own_gang_key.as_ref() {
                continue;
            }
            let foreign_slots = record
                .spec
                .reservations
                .values()
                .filter(|slot| slot.node.is_empty() || slot.node == node_info.name)
                .count();
            if foreign_slots > 0 {
                log::debug!(
                    "node {}: {foreign_slots} reserved slot(s) held by {} while evaluating {}",
                    node_info.name,
                    record.key(),
                    pod.key()
                );
            }
        }
        Status::default()
    }
}

impl PostBindPlugin for ReservationManager {
    fn post_bind(&self, _state: &CycleState, pod: &PodInfo, _node_name: &str) {
        let (group, min_count) = match labels::gang_group(pod) {
            Some(membership) => membership,
            None => return,
        };
        let gang_key = labels::gang_key(&pod.namespace, &group);

        // Union of binds seen here and binds the informer already echoed;
        // either view may lag the other.
        let observed = self.listers.bound_gang_member_keys(&pod.namespace, &group);
        let bound = {
            let mut tracker = self.bound.lock().unwrap();
            let entry = tracker.entry(gang_key.clone()).or_default();
            entry.insert(pod.key());
            entry.extend(observed);
            entry.len() as u32
        };

        if bound >= min_count {
            log::info!(
                "gang {gang_key} fully bound ({bound}/{min_count}); retiring reservation records"
            );
            self.bound.lock().unwrap().remove(&gang_key);
            let _ = self.commands.send(ReservationCommand::DeleteForGang {
                namespace: pod.namespace.clone(),
                gang_key,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gang::ReservationSentinels;
    use crate::listers::Listers;
    use tokio::sync::mpsc::unbounded_channel;

    fn gang_pod(name: &str, group: &str, min: u32) -> PodInfo {
        let mut pod = PodInfo {
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

    #[test]
    fn test_pre_filter_creates_once_per_lifetime() {
        let (tx, mut rx) = unbounded_channel();
        let listers = Listers::new();
        let plugin = ReservationManager::new(listers.clone(), ReservationSentinels::new(), tx);
        let mut state = CycleState::default();

        let pod = gang_pod("w-0", "trainer", 3);
        assert!(plugin.pre_filter(&mut state, &pod, &[]).is_success());

        let record = match rx.try_recv().unwrap() {
            ReservationCommand::Create { record, gang_key } => {
                assert_eq!(gang_key, "ml/trainer");
                record
            }
            other => panic!("unexpected command {other:?}"),
        };
        assert_eq!(record.metadata.name, "trainer-reservation");
        assert_eq!(record.spec.reservations.len(), 3);
        assert!(record.spec.reservations.contains_key("trainer-member-0"));
        assert_eq!(
            record.metadata.labels.get(labels::RESERVATION_POD_GROUP_LABEL),
            Some(&"trainer".to_string())
        );
        // Entries affect all nodes and carry the default demand.
        let slot = &record.spec.reservations["trainer-member-1"];
        assert_eq!(slot.node, "");
        assert_eq!(slot.cpu, "1");

        // Echo the create into the lister, as the store task would.
        listers.upsert_reservation(*record);

        // A second member does not create again.
        let second = gang_pod("w-1", "trainer", 3);
        assert!(plugin.pre_filter(&mut state, &second, &[]).is_success());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pre_filter_rearms_when_record_vanishes() {
        let (tx, mut rx) = unbounded_channel();
        let sentinels = ReservationSentinels::new();
        let plugin = ReservationManager::new(Listers::new(), sentinels.clone(), tx);
        let mut state = CycleState::default();

        let pod = gang_pod("w-0", "trainer", 2);
        plugin.pre_filter(&mut state, &pod, &[]);
        assert!(rx.try_recv().is_ok());

        // While the create is in flight nothing re-arms.
        plugin.pre_filter(&mut state, &pod, &[]);
        assert!(rx.try_recv().is_err());

        // Create confirmed, but the record was deleted externally and never
        // reappears in the lister: the next member re-arms, the one after
        // re-creates.
        sentinels.mark_created("ml/trainer");
        plugin.pre_filter(&mut state, &pod, &[]);
        assert!(rx.try_recv().is_err());
        plugin.pre_filter(&mut state, &pod, &[]);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ReservationCommand::Create { .. }
        ));
    }

    #[test]
    fn test_post_bind_deletes_after_last_member() {
        let (tx, mut rx) = unbounded_channel();
        let listers = Listers::new();
        let plugin = ReservationManager::new(listers.clone(), ReservationSentinels::new(), tx);
        let state = CycleState::default();

        // One bound member in the lister, one binding now.
        let mut first = gang_pod("w-0", "trainer", 2);
        first.spec.node_name = Some("n1".to_string());
        listers.upsert_pod(first);

        let current = gang_pod("w-1", "trainer", 2);
        listers.upsert_pod(current.clone());
        plugin.post_bind(&state, &current, "n2");

        match rx.try_recv().unwrap() {
            ReservationCommand::DeleteForGang { namespace, gang_key } => {
                assert_eq!(namespace, "ml");
                assert_eq!(gang_key, "ml/trainer");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_post_bind_retains_while_assembling() {
        let (tx, mut rx) = unbounded_channel();
        let listers = Listers::new();
        let plugin = ReservationManager::new(listers.clone(), ReservationSentinels::new(), tx);
        let state = CycleState::default();

        let current = gang_pod("w-0", "trainer", 3);
        listers.upsert_pod(current.clone());
        plugin.post_bind(&state, &current, "n1");
        assert!(rx.try_recv().is_err());
    }
}
