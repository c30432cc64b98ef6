use std::collections::HashMap;

use crate::models::{NodeInfo, PodInfo, QueuedPod};

/// In-memory snapshot of cluster state the pipeline schedules against.
///
/// The snapshot runs ahead of the store: `assign` accounts a pod's resources
/// onto its node synchronously during Reserve, before the bind is committed.
/// This is the invariant that prevents double-booking between cycles.
pub struct Cache {
    pods: HashMap<String, PodInfo>,
    nodes: HashMap<String, NodeInfo>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            pods: HashMap::new(),
            nodes: HashMap::new(),
        }
    }

    pub fn add_fail(&mut self, pod_key: &str) -> bool {
        if !self.pods.contains_key(pod_key) {
            return false;
        }
        self.pods
            .entry(pod_key.to_string())
            .and_modify(|p| p.queued_info.attempts += 1);
        true
    }

    /// Assume `pod_key` onto `node_name`, consuming node capacity in the
    /// snapshot. Returns false if either side is gone.
    pub fn assign(&mut self, pod_key: &str, node_name: &str) -> bool {
        let pod_info = match self.pods.get_mut(pod_key) {
            Some(pod) => pod,
            None => return false,
        };
        let node = match self.nodes.get_mut(node_name) {
            Some(node) => node,
            None => return false,
        };
        pod_info.scheduled = Some(node_name.to_owned());
        node.requested.add(&pod_info.spec.resources);
        true
    }

    /// Roll back an assumption, e.g. after a failed bind or a permit timeout.
    /// Idempotent: unassuming an unassumed pod is a no-op.
    pub fn unassume(&mut self, pod_key: &str) {
        if let Some(pod) = self.pods.get_mut(pod_key)
            && let Some(node_name) = pod.scheduled.take()
            && let Some(node) = self.nodes.get_mut(&node_name)
        {
            node.requested.saturating_sub(&pod.spec.resources);
        }
    }

    pub fn update_pod(&mut self, pod: PodInfo) -> Option<PodInfo> {
        self.pods.insert(pod.key(), pod)
    }

    pub fn remove_pod(&mut self, pod_key: &str) {
        if let Some(p) = self.pods.get(pod_key)
            && let Some(n) = &p.scheduled
            && let Some(node) = self.nodes.get_mut(n)
        {
            node.requested.saturating_sub(&p.spec.resources);
        }
        self.pods.remove(pod_key);
    }

    /// Release every pod assumed or bound onto a departing node and hand the
    /// displaced entries back for requeueing.
    pub fn pop_pods_on_node(&mut self, node_name: &str) -> Vec<QueuedPod> {
        let mut res = Vec::new();
        self.pods
            .values_mut()
            .filter(|p| matches!(&p.scheduled, Some(name) if name == node_name))
            .for_each(|p| {
                p.scheduled = None;
                p.queued_info.attempts = 0;
                res.push(QueuedPod {
                    priority: p.spec.priority,
                    seq: 0,
                    key: p.key(),
                });
            });
        res
    }

    pub fn update_node(&mut self, node: NodeInfo) {
        self.nodes.insert(node.name.clone(), node);
    }

    pub fn remove_node(&mut self, node_name: &str) {
        self.nodes.remove(node_name);
    }

    pub fn get_nodes(&self) -> Vec<NodeInfo> {
        self.nodes.values().cloned().collect()
    }

    pub fn get_node(&self, node_name: &str) -> Option<NodeInfo> {
        self.nodes.get(node_name).cloned()
    }

    pub fn get_pod(&self, pod_key: &str) -> Option<PodInfo> {
        self.pods.get(pod_key).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourcesRequirements;

    fn pod(key_name: &str, cpu: u64, memory: u64, devices: u64) -> PodInfo {
        let mut p = PodInfo {
            name: key_name.to_string(),
            ..Default::default()
        };
        p.spec.resources = ResourcesRequirements {
            cpu,
            memory,
            devices,
        };
        p
    }

    fn node(name: &str, cpu: u64, memory: u64, devices: u64) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            allocatable: ResourcesRequirements {
                cpu,
                memory,
                devices,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_assign_and_unassume_account_resources() {
        let mut cache = Cache::new();
        cache.update_node(node("n1", 4000, 8 << 30, 4));
        cache.update_pod(pod("p1", 1000, 1 << 30, 2));

        assert!(cache.assign("default/p1", "n1"));
        let n = cache.get_node("n1").unwrap();
        assert_eq!(n.requested.cpu, 1000);
        assert_eq!(n.requested.devices, 2);
        assert_eq!(n.available().devices, 2);

        cache.unassume("default/p1");
        let n = cache.get_node("n1").unwrap();
        assert_eq!(n.requested.cpu, 0);
        assert_eq!(n.requested.devices, 0);
        assert!(cache.get_pod("default/p1").unwrap().scheduled.is_none());

        // Idempotent.
        cache.unassume("default/p1");
        assert_eq!(cache.get_node("n1").unwrap().requested.cpu, 0);
    }

    #[test]
    fn test_remove_pod_releases_node() {
        let mut cache = Cache::new();
        cache.update_node(node("n1", 4000, 8 << 30, 0));
        cache.update_pod(pod("p1", 2000, 1 << 30, 0));
        assert!(cache.assign("default/p1", "n1"));
        cache.remove_pod("default/p1");
        assert_eq!(cache.get_node("n1").unwrap().requested.cpu, 0);
        assert!(cache.get_pod("default/p1").is_none());
    }

    #[test]
    fn test_pop_pods_on_node() {
        let mut cache = Cache::new();
        cache.update_node(node("n1", 8000, 8 << 30, 0));
        let mut p1 = pod("p1", 1000, 1 << 30, 0);
        p1.spec.priority = 7;
        cache.update_pod(p1);
        cache.update_pod(pod("p2", 1000, 1 << 30, 0));
        assert!(cache.assign("default/p1", "n1"));

        let displaced = cache.pop_pods_on_node("n1");
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].key, "default/p1");
        assert_eq!(displaced[0].priority, 7);
        assert!(cache.get_pod("default/p1").unwrap().scheduled.is_none());
    }

    #[test]
    fn test_assign_missing_pod_or_node() {
        let mut cache = Cache::new();
        cache.update_node(node("n1", 1000, 1 << 30, 0));
        assert!(!cache.assign("default/ghost", "n1"));
        cache.update_pod(pod("p1", 100, 1 << 20, 0));
        assert!(!cache.assign("default/p1", "ghost-node"));
    }
}
