//! Workload classification. Pure functions over a pod and its namespace
//! labels; the classifier plugin stashes the result in cycle state.

use std::collections::HashMap;

use crate::labels;
use crate::models::PodInfo;

/// Priority at or below which a workload is considered preemptible.
pub const PREEMPTIBLE_PRIORITY_CEILING: i64 = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TenantTier {
    Gold,
    Silver,
    Bronze,
    #[default]
    Unknown,
}

impl TenantTier {
    pub fn parse(value: &str) -> TenantTier {
        match value.to_ascii_lowercase().as_str() {
            "gold" => TenantTier::Gold,
            "silver" => TenantTier::Silver,
            "bronze" => TenantTier::Bronze,
            _ => TenantTier::Unknown,
        }
    }

    /// Ordinal rank used for tenant-vs-node-reservation comparisons.
    /// Higher is better; Unknown ranks lowest.
    pub fn rank(&self) -> u8 {
        match self {
            TenantTier::Gold => 3,
            TenantTier::Silver => 2,
            TenantTier::Bronze => 1,
            TenantTier::Unknown => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkloadClass {
    Training,
    Inference,
    Batch,
    Service,
    Interactive,
    #[default]
    Unknown,
}

impl WorkloadClass {
    pub fn parse(value: &str) -> WorkloadClass {
        match value.to_ascii_lowercase().as_str() {
            "training" => WorkloadClass::Training,
            "inference" => WorkloadClass::Inference,
            "batch" => WorkloadClass::Batch,
            "service" => WorkloadClass::Service,
            "interactive" => WorkloadClass::Interactive,
            _ => WorkloadClass::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QosClass {
    Guaranteed,
    #[default]
    Burstable,
    BestEffort,
}

/// Classifier output, cached in cycle state for the rest of the cycle.
#[derive(Clone, Debug, Default)]
pub struct SchedulingProfile {
    pub tenant_tier: TenantTier,
    pub workload_class: WorkloadClass,
    pub is_gang: bool,
    pub is_preemptible: bool,
    pub priority: i64,
    pub qos_class: QosClass,
}

/// Classify a pod. `namespace_labels` is the labels map of the pod's
/// namespace when available. Never fails; unresolved dimensions default.
pub fn classify(pod: &PodInfo, namespace_labels: Option<&HashMap<String, String>>) -> SchedulingProfile {
    SchedulingProfile {
        tenant_tier: classify_tenant_tier(pod, namespace_labels),
        workload_class: classify_workload_class(pod),
        is_gang: labels::is_gang_member(pod),
        is_preemptible: classify_preemptible(pod),
        priority: pod.spec.priority,
        qos_class: classify_qos(pod),
    }
}

fn classify_tenant_tier(
    pod: &PodInfo,
    namespace_labels: Option<&HashMap<String, String>>,
) -> TenantTier {
    let ns_tier = namespace_labels
        .and_then(|labels| labels.get(labels::TENANT_TIER_KEY))
        .map(|v| TenantTier::parse(v))
        .filter(|t| *t != TenantTier::Unknown);

    // A queue-name label routes classification through the namespace; absent
    // the queue label the namespace tier label still applies.
    if pod.label(labels::QUEUE_NAME_LABEL).is_some()
        && let Some(tier) = ns_tier
    {
        return tier;
    }
    if let Some(tier) = ns_tier {
        return tier;
    }

    if let Some(class_name) = pod.spec.priority_class_name.as_deref() {
        match tier_from_priority_class(class_name) {
            TenantTier::Unknown => {}
            tier => return tier,
        }
    }

    if let Some(tier) = pod.annotation(labels::TENANT_TIER_KEY) {
        let parsed = TenantTier::parse(tier);
        if parsed != TenantTier::Unknown {
            return parsed;
        }
    }

    TenantTier::Bronze
}

fn tier_from_priority_class(class_name: &str) -> TenantTier {
    match class_name {
        "high-priority" => TenantTier::Gold,
        name if name.starts_with("system-") && name.ends_with("-critical") => TenantTier::Gold,
        "medium-priority" | "default-priority" => TenantTier::Silver,
        "low-priority" | "best-effort" => TenantTier::Bronze,
        _ => TenantTier::Unknown,
    }
}

const FRAMEWORK_MARKERS: &[&str] = &["spark", "tensorflow", "pytorch", "ray", "mpi", "kubeflow"];
const TRAINING_MARKERS: &[&str] = &["kubeflow", "pytorch", "tensorflow"];
const INFERENCE_MARKERS: &[&str] = &["kserve", "seldon"];

fn label_marker_present(pod: &PodInfo, markers: &[&str]) -> bool {
    pod.labels.iter().any(|(k, v)| {
        let k = k.to_ascii_lowercase();
        let v = v.to_ascii_lowercase();
        markers.iter().any(|m| k.contains(m) || v.contains(m))
    })
}

fn classify_workload_class(pod: &PodInfo) -> WorkloadClass {
    if let Some(value) = pod.label(labels::WORKLOAD_TYPE_KEY) {
        let parsed = WorkloadClass::parse(value);
        if parsed != WorkloadClass::Unknown {
            return parsed;
        }
    }
    if let Some(value) = pod.annotation(labels::WORKLOAD_TYPE_KEY) {
        let parsed = WorkloadClass::parse(value);
        if parsed != WorkloadClass::Unknown {
            return parsed;
        }
    }

    // Coarse pass: gang members, framework-managed pods and Job children are
    // batch-like, everything else serves traffic.
    let job_owned = pod.labels.contains_key("job-name")
        || pod.labels.contains_key("batch.kubernetes.io/job-name");
    let mut class = if labels::is_gang_member(pod)
        || job_owned
        || label_marker_present(pod, FRAMEWORK_MARKERS)
    {
        WorkloadClass::Batch
    } else {
        WorkloadClass::Service
    };

    if label_marker_present(pod, TRAINING_MARKERS) || pod.spec.resources.devices > 1 {
        class = WorkloadClass::Training;
    }

    let component_marker = pod
        .label("component")
        .or_else(|| pod.label("app.kubernetes.io/component"))
        .map(|v| matches!(v, "predictor" | "inference" | "serving"))
        .unwrap_or(false);
    if component_marker || label_marker_present(pod, INFERENCE_MARKERS) {
        class = WorkloadClass::Inference;
    }

    class
}

fn classify_preemptible(pod: &PodInfo) -> bool {
    if pod.label(labels::PREEMPTIBLE_LABEL) == Some("true")
        || pod.annotation(labels::BACKFILL_ANNOTATION) == Some("true")
        || pod.annotation(labels::PRIORITY_TIER_ANNOTATION) == Some("low")
    {
        return true;
    }
    if matches!(
        pod.spec.priority_class_name.as_deref(),
        Some("low-priority") | Some("best-effort")
    ) {
        return true;
    }
    pod.spec.priority <= PREEMPTIBLE_PRIORITY_CEILING
}

fn classify_qos(pod: &PodInfo) -> QosClass {
    let res = &pod.spec.resources;
    if res.is_zero() {
        QosClass::BestEffort
    } else if res.cpu > 0 && res.memory > 0 {
        QosClass::Guaranteed
    } else {
        QosClass::Burstable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourcesRequirements;

    fn pod_with_labels(pairs: &[(&str, &str)]) -> PodInfo {
        let mut pod = PodInfo {
            name: "p".to_string(),
            ..Default::default()
        };
        for (k, v) in pairs {
            pod.labels.insert(k.to_string(), v.to_string());
        }
        pod
    }

    #[test]
    fn test_tenant_tier_namespace_label_wins() {
        let pod = pod_with_labels(&[]);
        let mut ns = HashMap::new();
        ns.insert(labels::TENANT_TIER_KEY.to_string(), "gold".to_string());
        let profile = classify(&pod, Some(&ns));
        assert_eq!(profile.tenant_tier, TenantTier::Gold);
    }

    #[test]
    fn test_tenant_tier_from_priority_class() {
        let mut pod = pod_with_labels(&[]);
        pod.spec.priority_class_name = Some("system-node-critical".to_string());
        assert_eq!(classify(&pod, None).tenant_tier, TenantTier::Gold);

        pod.spec.priority_class_name = Some("default-priority".to_string());
        assert_eq!(classify(&pod, None).tenant_tier, TenantTier::Silver);

        pod.spec.priority_class_name = Some("best-effort".to_string());
        assert_eq!(classify(&pod, None).tenant_tier, TenantTier::Bronze);
    }

    #[test]
    fn test_tenant_tier_annotation_then_default() {
        let mut pod = pod_with_labels(&[]);
        pod.annotations
            .insert(labels::TENANT_TIER_KEY.to_string(), "silver".to_string());
        assert_eq!(classify(&pod, None).tenant_tier, TenantTier::Silver);

        let bare = pod_with_labels(&[]);
        assert_eq!(classify(&bare, None).tenant_tier, TenantTier::Bronze);
    }

    #[test]
    fn test_workload_class_explicit_label() {
        let pod = pod_with_labels(&[(labels::WORKLOAD_TYPE_KEY, "interactive")]);
        assert_eq!(classify(&pod, None).workload_class, WorkloadClass::Interactive);
    }

    #[test]
    fn test_workload_class_coarse_refinement() {
        // Spark label alone reads as batch.
        let spark = pod_with_labels(&[("spark-role", "executor")]);
        assert_eq!(classify(&spark, None).workload_class, WorkloadClass::Batch);

        // PyTorch operator labels refine to training.
        let torch = pod_with_labels(&[("training.kubeflow.org/operator-name", "pytorchjob")]);
        assert_eq!(classify(&torch, None).workload_class, WorkloadClass::Training);

        // Multi-accelerator request refines to training too.
        let mut multi = pod_with_labels(&[("job-name", "fold")]);
        multi.spec.resources = ResourcesRequirements {
            cpu: 1000,
            memory: 1 << 30,
            devices: 4,
        };
        assert_eq!(classify(&multi, None).workload_class, WorkloadClass::Training);

        // KServe component refines to inference.
        let serving = pod_with_labels(&[("component", "predictor")]);
        assert_eq!(classify(&serving, None).workload_class, WorkloadClass::Inference);

        // Anything unlabeled serves traffic.
        let plain = pod_with_labels(&[("app", "web")]);
        assert_eq!(classify(&plain, None).workload_class, WorkloadClass::Service);
    }

    #[test]
    fn test_preemptible_rules() {
        let mut pod = pod_with_labels(&[(labels::PREEMPTIBLE_LABEL, "true")]);
        pod.spec.priority = 5000;
        assert!(classify(&pod, None).is_preemptible);

        let mut high = pod_with_labels(&[]);
        high.spec.priority = 1000;
        assert!(!classify(&high, None).is_preemptible);

        let mut low = pod_with_labels(&[]);
        low.spec.priority = 100;
        assert!(classify(&low, None).is_preemptible);
    }

    #[test]
    fn test_classify_is_idempotent() {
        let mut pod = pod_with_labels(&[(labels::GANG_NAME_LABEL, "trainer")]);
        pod.spec.priority = 900;
        let mut ns = HashMap::new();
        ns.insert(labels::TENANT_TIER_KEY.to_string(), "silver".to_string());

        let first = classify(&pod, Some(&ns));
        let second = classify(&pod, Some(&ns));
        assert_eq!(first.tenant_tier, second.tenant_tier);
        assert_eq!(first.workload_class, second.workload_class);
        assert_eq!(first.is_gang, second.is_gang);
        assert_eq!(first.is_preemptible, second.is_preemptible);
        assert_eq!(first.priority, second.priority);
        assert!(first.is_gang);
    }
}
