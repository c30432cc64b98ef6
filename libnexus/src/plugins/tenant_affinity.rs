use crate::{
    cycle_state::CycleState,
    labels::HardwareTier,
    models::{NodeInfo, PodInfo},
    plugins::{
        DefaultNormalizeScore, Plugin, ScoreExtension, ScorePlugin, Status, classifier::profile_of,
    },
    profile::TenantTier,
};

pub const NAME: &str = "TenantHardwareAffinity";

/// Steers tenants toward the hardware band they pay for: gold onto premium,
/// silver onto standard, bronze onto economy.
pub struct TenantHardwareAffinity;

impl Plugin for TenantHardwareAffinity {
    fn name(&self) -> &str {
        NAME
    }
}

const NEUTRAL: i64 = 50;

fn affinity_score(tenant: TenantTier, hardware: HardwareTier) -> i64 {
    match (tenant, hardware) {
        (TenantTier::Unknown, _) | (_, HardwareTier::Unknown) => NEUTRAL,
        (TenantTier::Gold, HardwareTier::Premium) => 100,
        (TenantTier::Gold, HardwareTier::Standard) => 70,
        (TenantTier::Gold, HardwareTier::Economy) => 60,
        (TenantTier::Silver, HardwareTier::Premium) => 20,
        (TenantTier::Silver, HardwareTier::Standard) => 100,
        (TenantTier::Silver, HardwareTier::Economy) => 70,
        (TenantTier::Bronze, HardwareTier::Premium) => 20,
        (TenantTier::Bronze, HardwareTier::Standard) => 20,
        (TenantTier::Bronze, HardwareTier::Economy) => 100,
    }
}

impl ScorePlugin for TenantHardwareAffinity {
    fn score(&self, state: &CycleState, _pod: &PodInfo, node_info: &NodeInfo) -> (i64, Status) {
        let tenant = profile_of(state)
            .map(|p| p.tenant_tier)
            .unwrap_or(TenantTier::Unknown);
        let hardware = HardwareTier::of_node(node_info);
        (affinity_score(tenant, hardware), Status::default())
    }

    fn score_extension(&self) -> Box<dyn ScoreExtension> {
        Box::new(DefaultNormalizeScore {
            max_score: 100,
            reverse: false,
        })
    }
}
