use std::collections::HashMap;

use common::quantity::{parse_count, parse_cpu, parse_memory};
use common::{Namespace, Node, PodTask, ResourceReservation};
use etcd_client::{Client, GetOptions, KeyValue};
use uuid::Uuid;

use crate::models::{
    NodeInfo, NodeSpec, PodInfo, PodPhase, PodSpec, QueuedInfo, ResourcesRequirements, Taint,
    TaintEffect, Toleration, TolerationOperator,
};

pub const PODS_PREFIX: &str = "/registry/pods/";
pub const NODES_PREFIX: &str = "/registry/nodes/";
pub const NAMESPACES_PREFIX: &str = "/registry/namespaces/";
pub const RESERVATIONS_PREFIX: &str = "/registry/reservations/";

/// Accelerator resource names recognized in requests and allocatable maps.
pub const DEVICE_RESOURCE_KEYS: [&str; 3] = ["nvidia.com/gpu", "amd.com/gpu", "intel.com/gpu"];

pub async fn list_pods(client: &mut Client) -> Result<Vec<PodInfo>, anyhow::Error> {
    let resp = client
        .get(PODS_PREFIX, Some(GetOptions::new().with_prefix()))
        .await?;
    let mut res = Vec::new();
    for kv in resp.kvs() {
        match serde_yaml::from_slice::<PodTask>(kv.value()) {
            Ok(pod) => res.push(pod_task_to_pod_info(&pod)),
            Err(e) => log::warn!("skipping malformed pod object in store: {e}"),
        }
    }
    Ok(res)
}

pub async fn list_nodes(client: &mut Client) -> Result<Vec<NodeInfo>, anyhow::Error> {
    let resp = client
        .get(NODES_PREFIX, Some(GetOptions::new().with_prefix()))
        .await?;
    let mut result = Vec::new();
    for kv in resp.kvs() {
        match serde_yaml::from_slice::<Node>(kv.value()) {
            Ok(node) => result.push(node_to_node_info(&node)),
            Err(e) => log::warn!("skipping malformed node object in store: {e}"),
        }
    }
    Ok(result)
}

pub async fn list_namespaces(
    client: &mut Client,
) -> Result<Vec<(String, HashMap<String, String>)>, anyhow::Error> {
    let resp = client
        .get(NAMESPACES_PREFIX, Some(GetOptions::new().with_prefix()))
        .await?;
    let mut result = Vec::new();
    for kv in resp.kvs() {
        match serde_yaml::from_slice::<Namespace>(kv.value()) {
            Ok(ns) => result.push((ns.metadata.name.clone(), ns.metadata.labels.clone())),
            Err(e) => log::warn!("skipping malformed namespace object in store: {e}"),
        }
    }
    Ok(result)
}

pub async fn list_reservations(
    client: &mut Client,
) -> Result<Vec<ResourceReservation>, anyhow::Error> {
    let resp = client
        .get(RESERVATIONS_PREFIX, Some(GetOptions::new().with_prefix()))
        .await?;
    let mut result = Vec::new();
    for kv in resp.kvs() {
        match serde_yaml::from_slice::<ResourceReservation>(kv.value()) {
            Ok(record) => result.push(record),
            Err(e) => log::warn!("skipping malformed reservation in store: {e}"),
        }
    }
    Ok(result)
}

pub fn pod_from_kv(kv: &KeyValue) -> Result<PodInfo, anyhow::Error> {
    let pod: PodTask = serde_yaml::from_slice(kv.value())?;
    Ok(pod_task_to_pod_info(&pod))
}

pub fn node_from_kv(kv: &KeyValue) -> Result<NodeInfo, anyhow::Error> {
    let node: Node = serde_yaml::from_slice(kv.value())?;
    Ok(node_to_node_info(&node))
}

/// The `{namespace}/{name}` tail of a store key under `prefix`.
pub fn key_suffix(kv: &KeyValue, prefix: &str) -> Option<String> {
    let key = String::from_utf8_lossy(kv.key()).to_string();
    key.strip_prefix(prefix).map(str::to_string)
}

fn requests_of(container: &common::Container) -> ResourcesRequirements {
    let mut requirements = ResourcesRequirements::default();
    let Some(resources) = &container.resources else {
        return requirements;
    };
    // Requests are authoritative for scheduling; limits stand in when no
    // request is declared.
    let map = resources.requests.as_ref().or(resources.limits.as_ref());
    let Some(map) = map else {
        return requirements;
    };
    requirements.cpu = map.get("cpu").map(|v| parse_cpu(v)).unwrap_or(0);
    requirements.memory = map.get("memory").map(|v| parse_memory(v)).unwrap_or(0);
    requirements.devices = DEVICE_RESOURCE_KEYS
        .iter()
        .filter_map(|key| map.get(*key))
        .map(|v| parse_count(v))
        .sum();
    requirements
}

fn parse_effect(effect: &str) -> Option<TaintEffect> {
    match effect {
        "NoSchedule" => Some(TaintEffect::NoSchedule),
        "PreferNoSchedule" => Some(TaintEffect::PreferNoSchedule),
        "NoExecute" => Some(TaintEffect::NoExecute),
        _ => None,
    }
}

fn parse_phase(phase: Option<&str>) -> PodPhase {
    match phase {
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        _ => PodPhase::Pending,
    }
}

/// A stable UID even when the store object carries none: derived from the
/// object key so repeated conversions agree.
fn stable_uid(pod: &PodTask) -> Uuid {
    pod.metadata
        .uid
        .as_deref()
        .and_then(|uid| Uuid::parse_str(uid).ok())
        .unwrap_or_else(|| Uuid::new_v5(&Uuid::NAMESPACE_OID, pod.key().as_bytes()))
}

pub fn pod_task_to_pod_info(pod: &PodTask) -> PodInfo {
    let mut total = ResourcesRequirements::default();
    for container in &pod.spec.containers {
        total.add(&requests_of(container));
    }
    // Init containers run sequentially; the pod needs the max of any one of
    // them and the main total.
    let mut init_max = ResourcesRequirements::default();
    for container in &pod.spec.init_containers {
        let req = requests_of(container);
        init_max.cpu = init_max.cpu.max(req.cpu);
        init_max.memory = init_max.memory.max(req.memory);
        init_max.devices = init_max.devices.max(req.devices);
    }
    total.cpu = total.cpu.max(init_max.cpu);
    total.memory = total.memory.max(init_max.memory);
    total.devices = total.devices.max(init_max.devices);

    let tolerations = pod
        .spec
        .tolerations
        .iter()
        .map(|t| Toleration {
            key: t.key.clone(),
            operator: match t.operator.as_deref() {
                Some("Exists") => TolerationOperator::Exists,
                _ => TolerationOperator::Equal,
            },
            value: t.value.clone().unwrap_or_default(),
            effect: t.effect.as_deref().and_then(parse_effect),
        })
        .collect();

    let node_name = pod.spec.node_name.clone().filter(|n| !n.is_empty());
    let namespace = if pod.metadata.namespace.is_empty() {
        "default".to_string()
    } else {
        pod.metadata.namespace.clone()
    };

    PodInfo {
        uid: stable_uid(pod),
        name: pod.metadata.name.clone(),
        namespace,
        labels: pod.metadata.labels.clone(),
        annotations: pod.metadata.annotations.clone(),
        spec: PodSpec {
            resources: total,
            priority: pod.spec.priority.unwrap_or(0),
            priority_class_name: pod.spec.priority_class_name.clone(),
            scheduler_name: pod.spec.scheduler_name.clone().unwrap_or_default(),
            node_selector: pod.spec.node_selector.clone().unwrap_or_default(),
            tolerations,
            node_name: node_name.clone(),
        },
        phase: parse_phase(pod.status.phase.as_deref()),
        queued_info: QueuedInfo::default(),
        scheduled: node_name,
    }
}

pub fn node_to_node_info(node: &Node) -> NodeInfo {
    let allocatable = &node.status.allocatable;
    let devices = DEVICE_RESOURCE_KEYS
        .iter()
        .filter_map(|key| allocatable.get(*key))
        .map(|v| parse_count(v))
        .sum();

    let taints = node
        .spec
        .taints
        .iter()
        .filter_map(|t| {
            parse_effect(&t.effect).map(|effect| Taint {
                key: t.key.clone(),
                value: t.value.clone(),
                effect,
            })
        })
        .collect();

    NodeInfo {
        name: node.metadata.name.clone(),
        labels: node.metadata.labels.clone(),
        spec: NodeSpec {
            unschedulable: node.spec.unschedulable,
            taints,
        },
        allocatable: ResourcesRequirements {
            cpu: allocatable.get("cpu").map(|v| parse_cpu(v)).unwrap_or(0),
            memory: allocatable.get("memory").map(|v| parse_memory(v)).unwrap_or(0),
            devices,
        },
        requested: ResourcesRequirements::default(),
    }
}
