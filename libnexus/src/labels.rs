//! Label and annotation vocabulary the scheduler reads, plus the fixed
//! hardware knowledge tables (fabric tier order, GPU model capacities).

use crate::models::{NodeInfo, PodInfo};

pub const DOMAIN: &str = "kubenexus.io";

// Gang membership. The pod-group prefix is canonical for new writes; the
// legacy x-k8s annotation and gang label are accepted as aliases.
pub const GANG_NAME_LABEL: &str = "pod-group.kubenexus.io/name";
pub const GANG_MIN_AVAILABLE_LABEL: &str = "pod-group.kubenexus.io/min-available";
pub const LEGACY_GANG_NAME_LABEL: &str = "gang.scheduling.kubenexus.io/name";
pub const LEGACY_POD_GROUP_ANNOTATION: &str = "scheduling.x-k8s.io/pod-group";
pub const MIN_AVAILABLE_ANNOTATION: &str = "scheduling.kubenexus.io/min-available";

// Classification.
pub const WORKLOAD_TYPE_KEY: &str = "workload.kubenexus.io/type";
pub const PREEMPTIBLE_LABEL: &str = "workload.kubenexus.io/preemptible";
pub const TENANT_TIER_KEY: &str = "tenant.kubenexus.io/tier";
pub const TENANT_NAME_LABEL: &str = "tenant.kubenexus.io/name";
pub const QUEUE_NAME_LABEL: &str = "kueue.x-k8s.io/queue-name";

// Topology.
pub const FABRIC_TYPE_LABEL: &str = "network.kubenexus.io/fabric-type";
pub const FABRIC_ID_LABEL: &str = "network.kubenexus.io/fabric-id";
pub const RACK_ID_LABEL: &str = "network.kubenexus.io/rack-id";
pub const AZ_LABEL: &str = "network.kubenexus.io/az";
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

// Hardware.
pub const HARDWARE_TIER_LABEL: &str = "hardware.kubenexus.io/tier";
pub const GPU_MODEL_LABEL: &str = "gpu.kubenexus.io/model";
pub const GPU_COUNT_LABEL: &str = "gpu.kubenexus.io/count";
pub const GPU_TOPOLOGY_LABEL: &str = "gpu.kubenexus.io/topology";
pub const GPU_VRAM_LABEL: &str = "gpu.kubenexus.io/vram";
pub const GPU_PRISTINE_LABEL: &str = "gpu.kubenexus.io/is-pristine";
pub const RESERVED_TIER_LABEL: &str = "tenant.kubenexus.io/reserved-tier";

// Per-pod requests.
pub const VRAM_REQUEST_ANNOTATION: &str = "scheduling.kubenexus.io/vram-request";
pub const MIN_FABRIC_TIER_ANNOTATION: &str = "scheduling.kubenexus.io/min-fabric-tier";
pub const NETWORK_SENSITIVE_ANNOTATION: &str = "scheduling.kubenexus.io/network-sensitive";
pub const CO_LOCATE_ANNOTATION: &str = "scheduling.kubenexus.io/co-locate";
pub const PRIORITY_TIER_ANNOTATION: &str = "scheduling.kubenexus.io/priority-tier";
pub const BACKFILL_ANNOTATION: &str = "scheduling.kubenexus.io/backfill";

// Reservation record labels.
pub const RESERVATION_GANG_KEY_LABEL: &str = "scheduling.kubenexus.io/gang-key";
pub const RESERVATION_POD_GROUP_LABEL: &str = "scheduling.kubenexus.io/pod-group";
pub const RESERVATION_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const RESERVATION_MANAGER_NAME: &str = "kube-nexus";

/// Ordinal quality of an inter-accelerator network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FabricTier {
    Unknown = 0,
    Ethernet = 1,
    RoCE = 2,
    InfiniBand = 3,
    NvLink = 4,
    NvSwitch = 5,
}

impl FabricTier {
    pub fn parse(value: &str) -> FabricTier {
        match value.to_ascii_lowercase().as_str() {
            "nvswitch" => FabricTier::NvSwitch,
            "nvlink" => FabricTier::NvLink,
            "infiniband" | "ib" => FabricTier::InfiniBand,
            "roce" => FabricTier::RoCE,
            "ethernet" | "eth" => FabricTier::Ethernet,
            _ => FabricTier::Unknown,
        }
    }

    /// Base topology score used by the fabric scorer.
    pub fn base_score(&self) -> i64 {
        match self {
            FabricTier::NvSwitch => 100,
            FabricTier::NvLink => 90,
            FabricTier::InfiniBand => 75,
            FabricTier::RoCE => 60,
            FabricTier::Ethernet => 40,
            FabricTier::Unknown => 50,
        }
    }
}

/// Per-device memory for known accelerator models, in bytes. Used when a node
/// does not advertise an explicit VRAM label.
pub fn vram_per_device(model: &str) -> Option<u64> {
    const GI: u64 = 1024 * 1024 * 1024;
    let model = model.to_ascii_lowercase();
    let gi = match model.as_str() {
        "h100" | "h100-sxm" | "h100-pcie" => 80,
        "h200" => 141,
        "a100-40gb" | "a100" => 40,
        "a100-80gb" => 80,
        "l40" | "l40s" => 48,
        "l4" => 24,
        "a40" => 48,
        "a30" => 24,
        "t4" => 16,
        "v100-16gb" | "v100" => 16,
        "v100-32gb" => 32,
        "rtx6000" => 24,
        "rtx8000" => 48,
        "mi300" | "mi300x" => 192,
        _ => return None,
    };
    Some(gi * GI)
}

/// Hardware quality bands a node can belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HardwareTier {
    Premium,
    Standard,
    Economy,
    Unknown,
}

impl HardwareTier {
    pub fn parse(value: &str) -> HardwareTier {
        match value.to_ascii_lowercase().as_str() {
            "premium" => HardwareTier::Premium,
            "standard" => HardwareTier::Standard,
            "economy" => HardwareTier::Economy,
            _ => HardwareTier::Unknown,
        }
    }

    /// Infer the band from the accelerator model when no tier label is set.
    pub fn from_gpu_model(model: &str) -> HardwareTier {
        let model = model.to_ascii_lowercase();
        match model.as_str() {
            "h100" | "h100-sxm" | "h100-pcie" | "h200" | "a100-80gb" | "mi300" | "mi300x" => {
                HardwareTier::Premium
            }
            "a100" | "a100-40gb" | "a40" | "a6000" | "mi250" => HardwareTier::Standard,
            "l40" | "l40s" | "l4" | "t4" | "a10" | "a16" => HardwareTier::Economy,
            _ => HardwareTier::Unknown,
        }
    }

    pub fn of_node(node: &NodeInfo) -> HardwareTier {
        if let Some(tier) = node.label(HARDWARE_TIER_LABEL) {
            let parsed = HardwareTier::parse(tier);
            if parsed != HardwareTier::Unknown {
                return parsed;
            }
        }
        match node.label(GPU_MODEL_LABEL) {
            Some(model) => HardwareTier::from_gpu_model(model),
            None => HardwareTier::Unknown,
        }
    }
}

/// `(group name, declared minimum member count)` for a gang member, reading
/// the canonical labels first and the legacy prefix as an alias.
pub fn gang_group(pod: &PodInfo) -> Option<(String, u32)> {
    let name = pod
        .label(GANG_NAME_LABEL)
        .or_else(|| pod.label(LEGACY_GANG_NAME_LABEL))
        .or_else(|| pod.annotation(LEGACY_POD_GROUP_ANNOTATION))?;
    let min_count = pod
        .label(GANG_MIN_AVAILABLE_LABEL)
        .or_else(|| pod.annotation(MIN_AVAILABLE_ANNOTATION))
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(1)
        .max(1);
    Some((name.to_string(), min_count))
}

/// `namespace/groupName`, the gang directory and reservation sentinel key.
pub fn gang_key(namespace: &str, group: &str) -> String {
    format!("{namespace}/{group}")
}

pub fn is_gang_member(pod: &PodInfo) -> bool {
    pod.annotation(MIN_AVAILABLE_ANNOTATION).is_some()
        || pod.annotation(LEGACY_POD_GROUP_ANNOTATION).is_some()
        || pod.label(LEGACY_GANG_NAME_LABEL).is_some()
        || pod.label(GANG_NAME_LABEL).is_some()
}

/// The node's advertised device count: explicit label first, then the
/// allocatable device dimension.
pub fn node_device_count(node: &NodeInfo) -> u64 {
    node.label(GPU_COUNT_LABEL)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(node.allocatable.devices)
}

/// Per-device VRAM in bytes: explicit label first, then the model table.
pub fn node_vram_per_device(node: &NodeInfo) -> Option<u64> {
    if let Some(v) = node.label(GPU_VRAM_LABEL) {
        let parsed = common::quantity::parse_memory(v);
        if parsed > 0 {
            return Some(parsed);
        }
    }
    node.label(GPU_MODEL_LABEL).and_then(vram_per_device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fabric_tier_order() {
        assert!(FabricTier::NvSwitch > FabricTier::NvLink);
        assert!(FabricTier::NvLink > FabricTier::InfiniBand);
        assert!(FabricTier::InfiniBand > FabricTier::RoCE);
        assert!(FabricTier::RoCE > FabricTier::Ethernet);
        assert!(FabricTier::Ethernet > FabricTier::Unknown);
        assert_eq!(FabricTier::parse("NVSwitch"), FabricTier::NvSwitch);
        assert_eq!(FabricTier::parse("weird"), FabricTier::Unknown);
    }

    #[test]
    fn test_vram_table() {
        const GI: u64 = 1024 * 1024 * 1024;
        assert_eq!(vram_per_device("H100"), Some(80 * GI));
        assert_eq!(vram_per_device("a100-40gb"), Some(40 * GI));
        assert_eq!(vram_per_device("mi300"), Some(192 * GI));
        assert_eq!(vram_per_device("unknown-model"), None);
    }

    #[test]
    fn test_gang_group_label_aliases() {
        let mut pod = PodInfo {
            name: "w-0".to_string(),
            ..Default::default()
        };
        assert_eq!(gang_group(&pod), None);

        pod.labels
            .insert(LEGACY_GANG_NAME_LABEL.to_string(), "trainer".to_string());
        pod.annotations
            .insert(MIN_AVAILABLE_ANNOTATION.to_string(), "3".to_string());
        assert_eq!(gang_group(&pod), Some(("trainer".to_string(), 3)));

        // The canonical label wins over the legacy alias.
        pod.labels
            .insert(GANG_NAME_LABEL.to_string(), "trainer-v2".to_string());
        pod.labels
            .insert(GANG_MIN_AVAILABLE_LABEL.to_string(), "4".to_string());
        assert_eq!(gang_group(&pod), Some(("trainer-v2".to_string(), 4)));
        assert!(is_gang_member(&pod));
    }

    #[test]
    fn test_hardware_tier_inference() {
        let mut node = NodeInfo {
            name: "n1".to_string(),
            ..Default::default()
        };
        assert_eq!(HardwareTier::of_node(&node), HardwareTier::Unknown);
        node.labels
            .insert(GPU_MODEL_LABEL.to_string(), "l4".to_string());
        assert_eq!(HardwareTier::of_node(&node), HardwareTier::Economy);
        node.labels
            .insert(HARDWARE_TIER_LABEL.to_string(), "premium".to_string());
        assert_eq!(HardwareTier::of_node(&node), HardwareTier::Premium);
    }
}
