use std::collections::HashMap;

use axum::{Json, Router, extract::State, routing::post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::admission::{
    AdmissionResponse, AdmissionResultStatus, AdmissionReview, PatchOperation, escape_json_pointer,
};
use common::quantity::parse_count;
use common::{ObjectMeta, PodTask};
use libnexus::labels;
use libnexus::listers::SharedListers;
use libnexus::profile::TenantTier;
use log::{debug, warn};

/// Accelerator resource name and the vendor domain used in the class
/// selector it maps to.
const GPU_RESOURCE_VENDORS: [(&str, &str); 3] = [
    ("nvidia.com/gpu", "nvidia.com"),
    ("amd.com/gpu", "amd.com"),
    ("intel.com/gpu", "intel.com"),
];

#[derive(Clone)]
pub struct WebhookState {
    pub listers: SharedListers,
}

pub fn router(state: WebhookState) -> Router {
    Router::new().route("/mutate", post(mutate)).with_state(state)
}

async fn mutate(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview>,
) -> Json<AdmissionReview> {
    let request_uid = review
        .request
        .as_ref()
        .map(|r| r.uid.clone())
        .unwrap_or_default();
    let namespace_labels = review
        .request
        .as_ref()
        .and_then(|r| state.listers.namespace_labels(&r.namespace));

    let response = build_response(&review, namespace_labels.as_ref(), request_uid);
    Json(AdmissionReview {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        request: None,
        response: Some(response),
    })
}

/// Decide the mutation for one review. Pure so it is directly testable.
pub fn build_response(
    review: &AdmissionReview,
    namespace_labels: Option<&HashMap<String, String>>,
    request_uid: String,
) -> AdmissionResponse {
    let allowed_without_patch = AdmissionResponse {
        uid: request_uid.clone(),
        allowed: true,
        status: None,
        patch: None,
        patch_type: None,
    };

    let Some(request) = &review.request else {
        return AdmissionResponse {
            allowed: false,
            status: Some(AdmissionResultStatus {
                message: "admission review carried no request".to_string(),
            }),
            ..allowed_without_patch
        };
    };
    let pod: PodTask = match request
        .object
        .clone()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(pod)) => pod,
        Ok(None) => {
            return AdmissionResponse {
                allowed: false,
                status: Some(AdmissionResultStatus {
                    message: "admission request carried no object".to_string(),
                }),
                ..allowed_without_patch
            };
        }
        Err(e) => {
            return AdmissionResponse {
                allowed: false,
                status: Some(AdmissionResultStatus {
                    message: format!("failed to decode pod: {e}"),
                }),
                ..allowed_without_patch
            };
        }
    };

    let Some(vendor) = requested_gpu_vendor(&pod) else {
        // No accelerator demand; nothing to inject.
        return allowed_without_patch;
    };
    let selector_key = format!("gpu.{vendor}/class");
    if pod
        .spec
        .node_selector
        .as_ref()
        .map(|s| s.contains_key(&selector_key))
        .unwrap_or(false)
    {
        debug!(
            "pod {} already pins {selector_key}; not mutating",
            pod_display(&pod.metadata)
        );
        return allowed_without_patch;
    }

    let tier = namespace_labels
        .and_then(|l| l.get(labels::TENANT_TIER_KEY))
        .map(|v| TenantTier::parse(v))
        .unwrap_or(TenantTier::Unknown);
    let class = tier_to_gpu_class(tier);

    let patch = if pod.spec.node_selector.is_none() {
        vec![PatchOperation {
            op: "add".to_string(),
            path: "/spec/nodeSelector".to_string(),
            value: Some(serde_json::json!({ selector_key.clone(): class })),
        }]
    } else {
        vec![PatchOperation {
            op: "add".to_string(),
            path: format!("/spec/nodeSelector/{}", escape_json_pointer(&selector_key)),
            value: Some(serde_json::Value::String(class.to_string())),
        }]
    };

    let payload = match serde_json::to_vec(&patch) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("failed to encode patch: {e}");
            return AdmissionResponse {
                allowed: false,
                status: Some(AdmissionResultStatus {
                    message: format!("failed to encode patch: {e}"),
                }),
                ..allowed_without_patch
            };
        }
    };
    debug!(
        "injecting {selector_key}={class} for pod {} (tier {tier:?})",
        pod_display(&pod.metadata)
    );
    AdmissionResponse {
        uid: request_uid,
        allowed: true,
        status: None,
        patch: Some(BASE64.encode(payload)),
        patch_type: Some("JSONPatch".to_string()),
    }
}

fn pod_display(metadata: &ObjectMeta) -> String {
    format!("{}/{}", metadata.namespace, metadata.name)
}

/// The vendor of the first accelerator resource the pod requests, if any.
fn requested_gpu_vendor(pod: &PodTask) -> Option<&'static str> {
    for container in pod.spec.containers.iter().chain(&pod.spec.init_containers) {
        let Some(resources) = &container.resources else {
            continue;
        };
        for map in [&resources.requests, &resources.limits].into_iter().flatten() {
            for (resource_key, vendor) in GPU_RESOURCE_VENDORS {
                if map.get(resource_key).map(|v| parse_count(v) > 0).unwrap_or(false) {
                    return Some(vendor);
                }
            }
        }
    }
    None
}

fn tier_to_gpu_class(tier: TenantTier) -> &'static str {
    match tier {
        TenantTier::Gold => "h100",
        TenantTier::Silver => "a100",
        TenantTier::Bronze | TenantTier::Unknown => "l4",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::admission::AdmissionRequest;

    fn review_for(pod: serde_json::Value, namespace: &str) -> AdmissionReview {
        AdmissionReview {
            api_version: "admission.k8s.io/v1".to_string(),
            kind: "AdmissionReview".to_string(),
            request: Some(AdmissionRequest {
                uid: "req-1".to_string(),
                namespace: namespace.to_string(),
                operation: "CREATE".to_string(),
                object: Some(pod),
            }),
            response: None,
        }
    }

    fn gpu_pod(selector: Option<serde_json::Value>) -> serde_json::Value {
        let mut spec = serde_json::json!({
            "containers": [{
                "name": "main",
                "resources": {"requests": {"nvidia.com/gpu": "1"}}
            }]
        });
        if let Some(selector) = selector {
            spec["nodeSelector"] = selector;
        }
        serde_json::json!({
            "metadata": {"name": "gpu-pod", "namespace": "team-a"},
            "spec": spec
        })
    }

    fn silver_namespace() -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(labels::TENANT_TIER_KEY.to_string(), "silver".to_string());
        labels
    }

    #[test]
    fn test_injects_class_selector_for_silver_tenant() {
        let review = review_for(gpu_pod(None), "team-a");
        let ns = silver_namespace();
        let response = build_response(&review, Some(&ns), "req-1".to_string());

        assert!(response.allowed);
        assert_eq!(response.patch_type.as_deref(), Some("JSONPatch"));
        let patch: Vec<PatchOperation> = serde_json::from_slice(
            &BASE64.decode(response.patch.unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(
            patch,
            vec![PatchOperation {
                op: "add".to_string(),
                path: "/spec/nodeSelector".to_string(),
                value: Some(serde_json::json!({"gpu.nvidia.com/class": "a100"})),
            }]
        );
    }

    #[test]
    fn test_appends_to_existing_selector_with_escaped_pointer() {
        let review = review_for(
            gpu_pod(Some(serde_json::json!({"disk": "ssd"}))),
            "team-a",
        );
        let ns = silver_namespace();
        let response = build_response(&review, Some(&ns), "req-1".to_string());

        let patch: Vec<PatchOperation> = serde_json::from_slice(
            &BASE64.decode(response.patch.unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(patch[0].path, "/spec/nodeSelector/gpu.nvidia.com~1class");
        assert_eq!(
            patch[0].value,
            Some(serde_json::Value::String("a100".to_string()))
        );
    }

    #[test]
    fn test_leaves_existing_class_selector_alone() {
        let review = review_for(
            gpu_pod(Some(serde_json::json!({"gpu.nvidia.com/class": "h100"}))),
            "team-a",
        );
        let ns = silver_namespace();
        let response = build_response(&review, Some(&ns), "req-1".to_string());
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn test_ignores_pods_without_accelerators() {
        let pod = serde_json::json!({
            "metadata": {"name": "web", "namespace": "team-a"},
            "spec": {"containers": [{"name": "main"}]}
        });
        let response = build_response(&review_for(pod, "team-a"), None, "req-1".to_string());
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn test_unknown_tenant_defaults_to_economy_class() {
        let review = review_for(gpu_pod(None), "team-a");
        let response = build_response(&review, None, "req-1".to_string());
        let patch: Vec<PatchOperation> = serde_json::from_slice(
            &BASE64.decode(response.patch.unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(
            patch[0].value,
            Some(serde_json::json!({"gpu.nvidia.com/class": "l4"}))
        );
    }

    #[test]
    fn test_gold_tenant_gets_h100() {
        let review = review_for(gpu_pod(None), "team-a");
        let mut ns = HashMap::new();
        ns.insert(labels::TENANT_TIER_KEY.to_string(), "gold".to_string());
        let response = build_response(&review, Some(&ns), "req-1".to_string());
        let patch: Vec<PatchOperation> = serde_json::from_slice(
            &BASE64.decode(response.patch.unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(
            patch[0].value,
            Some(serde_json::json!({"gpu.nvidia.com/class": "h100"}))
        );
    }

    #[test]
    fn test_malformed_object_rejected() {
        let review = review_for(serde_json::json!({"spec": 42}), "team-a");
        let response = build_response(&review, None, "req-1".to_string());
        assert!(!response.allowed);
        assert!(response.status.unwrap().message.contains("failed to decode"));
    }
}
