use crate::{
    cycle_state::CycleState,
    labels,
    models::{NodeInfo, PodInfo},
    plugins::{
        DefaultNormalizeScore, Plugin, ScoreExtension, ScorePlugin, Status, classifier::profile_of,
    },
    profile::TenantTier,
};

pub const NAME: &str = "ResourceFragmentation";

/// Accelerator-island preservation: keep pristine large islands intact for
/// the jobs that need them, steer small requests toward partially used or
/// small islands, and reward exact fits.
pub struct ResourceFragmentation;

impl Plugin for ResourceFragmentation {
    fn name(&self) -> &str {
        NAME
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IslandTopology {
    NvSwitch,
    NvLink,
    Pcie,
    Unknown,
}

impl IslandTopology {
    fn parse(value: &str) -> IslandTopology {
        match value.to_ascii_lowercase().as_str() {
            "nvswitch" => IslandTopology::NvSwitch,
            "nvlink" => IslandTopology::NvLink,
            "pcie" => IslandTopology::Pcie,
            _ => IslandTopology::Unknown,
        }
    }

    /// Island quality used to scale the fragmentation penalty.
    fn quality(&self) -> i64 {
        match self {
            IslandTopology::NvSwitch => 100,
            IslandTopology::NvLink => 80,
            IslandTopology::Pcie => 50,
            IslandTopology::Unknown => 30,
        }
    }
}

struct Island {
    total: u64,
    allocated: u64,
    topology: IslandTopology,
    pristine: bool,
    reserved_tier: Option<TenantTier>,
}

fn detect_island(node: &NodeInfo) -> Island {
    let total = labels::node_device_count(node);
    let allocated = node.requested.devices.min(total);
    let pristine_label = node.label(labels::GPU_PRISTINE_LABEL) == Some("true");
    Island {
        total,
        allocated,
        topology: node
            .label(labels::GPU_TOPOLOGY_LABEL)
            .map(IslandTopology::parse)
            .unwrap_or(IslandTopology::Unknown),
        pristine: allocated == 0 || pristine_label,
        reserved_tier: node
            .label(labels::RESERVED_TIER_LABEL)
            .map(TenantTier::parse),
    }
}

impl ScorePlugin for ResourceFragmentation {
    fn score(&self, state: &CycleState, pod: &PodInfo, node_info: &NodeInfo) -> (i64, Status) {
        let requested = pod.spec.resources.devices;
        if requested == 0 || labels::node_device_count(node_info) == 0 {
            // No accelerator stake; fall back to CPU utilization.
            let cpu = if node_info.allocatable.cpu > 0 {
                (node_info.requested.cpu * 100 / node_info.allocatable.cpu) as i64
            } else {
                0
            };
            return (cpu.clamp(0, 100), Status::default());
        }

        let island = detect_island(node_info);
        let available = island.total - island.allocated;
        let pod_tier = profile_of(state)
            .map(|p| p.tenant_tier)
            .unwrap_or(TenantTier::Unknown);

        let score = if matches!(&island.reserved_tier, Some(reserved) if pod_tier.rank() < reserved.rank())
        {
            10
        } else if island.pristine && island.total >= 4 && requested <= 2 {
            0
        } else if available == requested
            || (island.pristine && island.total < 4 && available >= requested)
        {
            // Perfect fits complete an island; small pristine islands are
            // exactly where small requests belong.
            90
        } else if !island.pristine && available >= requested {
            100 - (available - requested) as i64
        } else if island.total >= 4 && requested < island.total / 2 {
            20 + island.topology.quality() / 10
        } else if island.total > 0 {
            (100 * island.allocated / island.total) as i64
        } else {
            0
        };

        (score.clamp(0, 100), Status::default())
    }

    fn score_extension(&self) -> Box<dyn ScoreExtension> {
        Box::new(DefaultNormalizeScore {
            max_score: 100,
            reverse: false,
        })
    }
}
