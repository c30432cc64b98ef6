use std::cmp::Ordering;
use std::collections::HashMap;

use tokio::time::Instant;
use uuid::Uuid;

/// Aggregated resource demand or supply. CPU is measured in millicores,
/// memory in bytes, devices in accelerator count across all vendor keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourcesRequirements {
    pub cpu: u64,
    pub memory: u64,
    pub devices: u64,
}

impl ResourcesRequirements {
    pub fn is_zero(&self) -> bool {
        self.cpu == 0 && self.memory == 0 && self.devices == 0
    }

    pub fn add(&mut self, other: &ResourcesRequirements) {
        self.cpu += other.cpu;
        self.memory += other.memory;
        self.devices += other.devices;
    }

    pub fn saturating_sub(&mut self, other: &ResourcesRequirements) {
        self.cpu = self.cpu.saturating_sub(other.cpu);
        self.memory = self.memory.saturating_sub(other.memory);
        self.devices = self.devices.saturating_sub(other.devices);
    }

    /// True when every dimension of `self` fits within `avail`.
    pub fn fits_within(&self, avail: &ResourcesRequirements) -> bool {
        self.cpu <= avail.cpu && self.memory <= avail.memory && self.devices <= avail.devices
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: &str, effect: TaintEffect) -> Self {
        Self {
            key: key.to_string(),
            value: String::new(),
            effect,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Toleration {
    /// None tolerates every taint key (only valid with `Exists`).
    pub key: Option<String>,
    pub operator: TolerationOperator,
    pub value: String,
    /// None matches every effect.
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    pub fn tolerate(&self, taint: &Taint) -> bool {
        if let Some(effect) = &self.effect
            && *effect != taint.effect
        {
            return false;
        }
        match &self.key {
            None => self.operator == TolerationOperator::Exists,
            Some(key) => {
                key == &taint.key
                    && match self.operator {
                        TolerationOperator::Exists => true,
                        TolerationOperator::Equal => self.value == taint.value,
                    }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl PodPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

#[derive(Clone, Debug, Default)]
pub struct PodSpec {
    pub resources: ResourcesRequirements,
    /// Signed; larger is higher.
    pub priority: i64,
    pub priority_class_name: Option<String>,
    pub scheduler_name: String,
    pub node_selector: HashMap<String, String>,
    pub tolerations: Vec<Toleration>,
    /// Set by a successful bind.
    pub node_name: Option<String>,
}

/// Bookkeeping attached to a pod while it sits in the scheduling queue.
#[derive(Clone, Debug, Default)]
pub struct QueuedInfo {
    pub attempts: u32,
}

#[derive(Clone, Debug)]
pub struct PodInfo {
    pub uid: Uuid,
    pub name: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub spec: PodSpec,
    pub phase: PodPhase,
    pub queued_info: QueuedInfo,
    /// Node this pod is assumed or bound onto, None while pending.
    pub scheduled: Option<String>,
}

impl Default for PodInfo {
    fn default() -> Self {
        Self {
            uid: Uuid::nil(),
            name: String::new(),
            namespace: "default".to_string(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            spec: PodSpec::default(),
            phase: PodPhase::Pending,
            queued_info: QueuedInfo::default(),
            scheduled: None,
        }
    }
}

impl PodInfo {
    /// `namespace/name`, the cache and queue key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Label value with an annotation of the same key as fallback.
    pub fn label_or_annotation(&self, key: &str) -> Option<&str> {
        self.label(key).or_else(|| self.annotation(key))
    }
}

#[derive(Clone, Debug, Default)]
pub struct NodeSpec {
    pub unschedulable: bool,
    pub taints: Vec<Taint>,
}

#[derive(Clone, Debug, Default)]
pub struct NodeInfo {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub spec: NodeSpec,
    pub allocatable: ResourcesRequirements,
    /// Sum of requests of pods assumed or bound onto this node.
    pub requested: ResourcesRequirements,
}

impl NodeInfo {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Allocatable minus requested, saturating at zero.
    pub fn available(&self) -> ResourcesRequirements {
        let mut avail = self.allocatable.clone();
        avail.saturating_sub(&self.requested);
        avail
    }
}

/// A committed placement decision flowing out of the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub pod_key: String,
    pub pod_uid: Uuid,
    pub node_name: String,
}

/// Why a scheduling cycle gave up on a pod.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// Transient; the pod was requeued with backoff.
    Unschedulable,
    /// Sticky per node; still requeued, retried when the cluster changes.
    UnschedulableAndUnresolvable,
    /// Internal error (lister/store failure, malformed input).
    Error,
}

impl FailureReason {
    /// The event `reason` string surfaced on the pod.
    pub fn event_reason(&self) -> &'static str {
        match self {
            FailureReason::Unschedulable | FailureReason::UnschedulableAndUnresolvable => {
                "Unschedulable"
            }
            FailureReason::Error => "FailedScheduling",
        }
    }
}

/// Everything the daemon needs to act on one finished cycle.
#[derive(Clone, Debug)]
pub enum SchedulingEvent {
    Assigned(Assignment),
    Failed {
        pod_key: String,
        reason: FailureReason,
        message: String,
    },
    /// PostFilter nominated a node; victims must be evicted externally before
    /// the pod can land there.
    Nominated {
        pod_key: String,
        node_name: String,
        victims: Vec<String>,
    },
}

/// Entry of the active queue: priority descending, then FIFO by sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedPod {
    pub priority: i64,
    pub seq: u64,
    pub key: String,
}

impl PartialOrd for QueuedPod {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedPod {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct BackOffPod {
    pub pod: QueuedPod,
    pub expire: Instant,
}

impl PartialEq for BackOffPod {
    fn eq(&self, other: &Self) -> bool {
        self.expire == other.expire
    }
}

impl Eq for BackOffPod {}

impl PartialOrd for BackOffPod {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BackOffPod {
    fn cmp(&self, other: &Self) -> Ordering {
        other.expire.cmp(&self.expire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toleration_matching() {
        let taint = Taint {
            key: "dedicated".to_string(),
            value: "ml".to_string(),
            effect: TaintEffect::NoSchedule,
        };
        let equal = Toleration {
            key: Some("dedicated".to_string()),
            operator: TolerationOperator::Equal,
            value: "ml".to_string(),
            effect: Some(TaintEffect::NoSchedule),
        };
        assert!(equal.tolerate(&taint));

        let wrong_value = Toleration {
            value: "batch".to_string(),
            ..equal.clone()
        };
        assert!(!wrong_value.tolerate(&taint));

        let exists_any_key = Toleration {
            key: None,
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect: None,
        };
        assert!(exists_any_key.tolerate(&taint));

        let equal_no_key = Toleration {
            key: None,
            operator: TolerationOperator::Equal,
            value: String::new(),
            effect: None,
        };
        assert!(!equal_no_key.tolerate(&taint));
    }

    #[test]
    fn test_queued_pod_order() {
        use std::collections::BinaryHeap;
        let mut heap = BinaryHeap::new();
        heap.push(QueuedPod {
            priority: 10,
            seq: 2,
            key: "default/b".to_string(),
        });
        heap.push(QueuedPod {
            priority: 100,
            seq: 3,
            key: "default/c".to_string(),
        });
        heap.push(QueuedPod {
            priority: 10,
            seq: 1,
            key: "default/a".to_string(),
        });

        assert_eq!(heap.pop().unwrap().key, "default/c");
        // Equal priority pops FIFO by sequence.
        assert_eq!(heap.pop().unwrap().key, "default/a");
        assert_eq!(heap.pop().unwrap().key, "default/b");
    }

    #[test]
    fn test_resources_fit() {
        let req = ResourcesRequirements {
            cpu: 500,
            memory: 1 << 30,
            devices: 2,
        };
        let node = ResourcesRequirements {
            cpu: 4000,
            memory: 8 << 30,
            devices: 2,
        };
        assert!(req.fits_within(&node));
        let too_many_devices = ResourcesRequirements {
            devices: 3,
            ..req.clone()
        };
        assert!(!too_many_devices.fits_within(&node));
    }
}
