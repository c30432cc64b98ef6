use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use common::ResourceReservation;

use crate::labels;
use crate::models::{NodeInfo, PodInfo, PodPhase};

/// Read-only indexed snapshots fed by the store watch streams.
///
/// Many readers (plugin code running inside scheduling cycles), one writer
/// (the watch task). Readers receive clones and must not expect mutations to
/// propagate back.
#[derive(Default)]
pub struct Listers {
    pods: RwLock<HashMap<String, PodInfo>>,
    nodes: RwLock<HashMap<String, NodeInfo>>,
    namespaces: RwLock<HashMap<String, HashMap<String, String>>>,
    reservations: RwLock<HashMap<String, ResourceReservation>>,
}

pub type SharedListers = Arc<Listers>;

impl Listers {
    pub fn new() -> SharedListers {
        Arc::new(Listers::default())
    }

    // Writer side.

    pub fn upsert_pod(&self, pod: PodInfo) {
        self.pods.write().unwrap().insert(pod.key(), pod);
    }

    pub fn remove_pod(&self, pod_key: &str) {
        self.pods.write().unwrap().remove(pod_key);
    }

    pub fn upsert_node(&self, node: NodeInfo) {
        self.nodes.write().unwrap().insert(node.name.clone(), node);
    }

    pub fn remove_node(&self, node_name: &str) {
        self.nodes.write().unwrap().remove(node_name);
    }

    pub fn upsert_namespace(&self, name: &str, labels: HashMap<String, String>) {
        self.namespaces
            .write()
            .unwrap()
            .insert(name.to_string(), labels);
    }

    pub fn remove_namespace(&self, name: &str) {
        self.namespaces.write().unwrap().remove(name);
    }

    /// Returns true when the record was not present before.
    pub fn upsert_reservation(&self, record: ResourceReservation) -> bool {
        self.reservations
            .write()
            .unwrap()
            .insert(record.key(), record)
            .is_none()
    }

    /// Returns true when a record was actually removed.
    pub fn remove_reservation(&self, key: &str) -> bool {
        self.reservations.write().unwrap().remove(key).is_some()
    }

    // Reader side.

    pub fn get_pod(&self, pod_key: &str) -> Option<PodInfo> {
        self.pods.read().unwrap().get(pod_key).cloned()
    }

    pub fn get_node(&self, node_name: &str) -> Option<NodeInfo> {
        self.nodes.read().unwrap().get(node_name).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    pub fn namespace_labels(&self, name: &str) -> Option<HashMap<String, String>> {
        self.namespaces.read().unwrap().get(name).cloned()
    }

    /// Pending members of a gang observed in the store, including ones that
    /// have not entered a scheduling cycle yet.
    pub fn pending_gang_members(&self, namespace: &str, group: &str) -> Vec<PodInfo> {
        self.pods
            .read()
            .unwrap()
            .values()
            .filter(|p| {
                p.namespace == namespace
                    && p.phase == PodPhase::Pending
                    && matches!(labels::gang_group(p), Some((g, _)) if g == group)
            })
            .cloned()
            .collect()
    }

    /// Node names already holding bound members of a gang.
    pub fn bound_gang_peer_nodes(&self, namespace: &str, group: &str, exclude_key: &str) -> Vec<String> {
        self.pods
            .read()
            .unwrap()
            .values()
            .filter(|p| {
                p.namespace == namespace
                    && p.key() != exclude_key
                    && matches!(labels::gang_group(p), Some((g, _)) if g == group)
            })
            .filter_map(|p| p.spec.node_name.clone().or_else(|| p.scheduled.clone()))
            .collect()
    }

    /// Keys of bound members of a gang.
    pub fn bound_gang_member_keys(&self, namespace: &str, group: &str) -> Vec<String> {
        self.pods
            .read()
            .unwrap()
            .values()
            .filter(|p| {
                p.namespace == namespace
                    && matches!(labels::gang_group(p), Some((g, _)) if g == group)
                    && (p.spec.node_name.is_some() || p.scheduled.is_some())
            })
            .map(PodInfo::key)
            .collect()
    }

    /// Count of bound members of a gang.
    pub fn bound_gang_member_count(&self, namespace: &str, group: &str) -> usize {
        self.bound_gang_member_keys(namespace, group).len()
    }

    /// Every pod currently assigned to some node, across all namespaces.
    pub fn bound_pods(&self) -> Vec<PodInfo> {
        self.pods
            .read()
            .unwrap()
            .values()
            .filter(|p| p.spec.node_name.is_some() || p.scheduled.is_some())
            .cloned()
            .collect()
    }

    /// Scheduled pod count per node name, for pod-count zone spreading.
    pub fn scheduled_pod_counts(&self) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for pod in self.pods.read().unwrap().values() {
            if let Some(node) = pod.spec.node_name.as_ref().or(pod.scheduled.as_ref()) {
                *counts.entry(node.clone()).or_default() += 1;
            }
        }
        counts
    }

    pub fn reservations(&self) -> Vec<ResourceReservation> {
        self.reservations.read().unwrap().values().cloned().collect()
    }

    /// Reservation records labeled with the given gang key.
    pub fn reservations_for_gang(&self, gang_key: &str) -> Vec<ResourceReservation> {
        self.reservations
            .read()
            .unwrap()
            .values()
            .filter(|r| {
                r.metadata.labels.get(labels::RESERVATION_GANG_KEY_LABEL)
                    == Some(&sanitize_gang_key(gang_key))
            })
            .cloned()
            .collect()
    }
}

/// Gang keys contain a `/`, which label values cannot; records carry the
/// sanitized form.
pub fn sanitize_gang_key(gang_key: &str) -> String {
    gang_key.replace('/', ".")
}
