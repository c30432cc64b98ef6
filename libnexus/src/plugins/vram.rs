use common::quantity::parse_memory;

use crate::{
    cycle_state::CycleState,
    labels,
    models::{NodeInfo, PodInfo},
    plugins::{
        Code, DefaultNormalizeScore, FilterPlugin, Plugin, ScoreExtension, ScorePlugin, Status,
    },
};

pub const NAME: &str = "VramFit";

/// Accelerator-memory fit. Filters nodes whose devices cannot hold the pod's
/// declared VRAM request, and scores survivors by how tightly the request
/// fills the devices it will occupy.
pub struct VramFit;

impl Plugin for VramFit {
    fn name(&self) -> &str {
        NAME
    }
}

/// Total VRAM the pod asks for, from its request annotation.
fn vram_request(pod: &PodInfo) -> Option<u64> {
    let request = parse_memory(pod.annotation(labels::VRAM_REQUEST_ANNOTATION)?);
    (request > 0).then_some(request)
}

/// Devices the request will occupy; a VRAM request with no device count
/// still lands on one device.
fn requested_devices(pod: &PodInfo) -> u64 {
    pod.spec.resources.devices.max(1)
}

fn is_high_end_model(model: &str) -> bool {
    matches!(
        model.to_ascii_lowercase().as_str(),
        "h100" | "h100-sxm" | "h100-pcie" | "h200" | "a100-80gb" | "mi300" | "mi300x"
    )
}

impl FilterPlugin for VramFit {
    fn filter(&self, _: &CycleState, pod: &PodInfo, node_info: &NodeInfo) -> Status {
        let request = match vram_request(pod) {
            Some(request) => request,
            None => return Status::default(),
        };
        let per_device = match labels::node_vram_per_device(node_info) {
            Some(capacity) => capacity,
            // Nothing advertised; capacity cannot be judged here.
            None => return Status::default(),
        };
        let available = per_device * requested_devices(pod);
        if request > available {
            Status::new(
                Code::UnschedulableAndUnresolvable,
                vec![format!(
                    "insufficient accelerator memory: need {request} bytes, node offers {available} bytes across {} device(s)",
                    requested_devices(pod)
                )],
            )
        } else {
            Status::default()
        }
    }
}

impl ScorePlugin for VramFit {
    fn score(&self, _: &CycleState, pod: &PodInfo, node_info: &NodeInfo) -> (i64, Status) {
        let (request, per_device) = match (vram_request(pod), labels::node_vram_per_device(node_info)) {
            (Some(r), Some(c)) => (r, c),
            // Nothing to judge; stay neutral.
            _ => return (50, Status::default()),
        };

        let capacity = per_device * requested_devices(pod);
        if capacity == 0 {
            return (0, Status::default());
        }
        let utilization = request as f64 / capacity as f64;

        let mut score: i64 = if utilization >= 0.95 {
            100
        } else if utilization >= 0.70 {
            80
        } else if utilization >= 0.50 {
            60
        } else if utilization >= 0.30 {
            30
        } else {
            0
        };

        let high_end = node_info
            .label(labels::GPU_MODEL_LABEL)
            .map(is_high_end_model)
            .unwrap_or(false);
        if high_end && utilization >= 0.70 {
            score += 10;
        }
        if utilization < 0.30 {
            // Stranding penalty: a tiny request parks expensive VRAM idle.
            score -= 20;
        }

        (score.clamp(0, 100), Status::default())
    }

    fn score_extension(&self) -> Box<dyn ScoreExtension> {
        Box::new(DefaultNormalizeScore {
            max_score: 100,
            reverse: false,
        })
    }
}
