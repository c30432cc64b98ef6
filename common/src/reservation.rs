use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::pod::ObjectMeta;

pub const RESERVATION_API_VERSION: &str = "scheduling.kubenexus.io/v1alpha1";
pub const RESERVATION_KIND: &str = "ResourceReservation";

/// One reserved slot of an assembling gang. An empty `node` means the demand
/// applies to all nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    #[serde(default)]
    pub node: String,
    pub cpu: String,
    pub memory: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReservationSpec {
    /// Member slot name to reserved quantities.
    #[serde(default)]
    pub reservations: BTreeMap<String, Reservation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReservationStatus {
    /// Slot name to the pod observed to occupy it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pods: BTreeMap<String, String>,
}

/// Cluster-visible record of the phantom demand of an assembling gang.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReservation {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ReservationSpec,
    #[serde(default)]
    pub status: ReservationStatus,
}

impl ResourceReservation {
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_serde_defaults() {
        let value = serde_json::json!({
            "apiVersion": RESERVATION_API_VERSION,
            "kind": RESERVATION_KIND,
            "metadata": {"name": "trainer-reservation", "namespace": "ml-team"},
            "spec": {"reservations": {
                "trainer-member-0": {"cpu": "1000m", "memory": "750M"},
                "trainer-member-1": {"node": "gpu-a1", "cpu": "1000m", "memory": "750M"}
            }}
        });
        let record: ResourceReservation = serde_json::from_value(value).unwrap();
        assert_eq!(record.key(), "ml-team/trainer-reservation");
        assert_eq!(record.spec.reservations.len(), 2);
        assert_eq!(record.spec.reservations["trainer-member-0"].node, "");
        assert!(record.status.pods.is_empty());
    }
}
