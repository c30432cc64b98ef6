//! Prometheus metrics. Registered once against the default registry; the
//! daemon exports them in text format.

use lazy_static::lazy_static;
use prometheus::{
    HistogramVec, IntCounterVec, IntGaugeVec, register_histogram_vec, register_int_counter_vec,
    register_int_gauge_vec,
};

lazy_static! {
    pub static ref SCHEDULING_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "scheduling_attempts_total",
        "Scheduling attempts by result and deciding plugin.",
        &["result", "plugin"]
    )
    .unwrap();
    pub static ref SCHEDULING_DURATION: HistogramVec = register_histogram_vec!(
        "scheduling_duration_seconds",
        "Duration of scheduling operations.",
        &["operation", "plugin"]
    )
    .unwrap();
    pub static ref POD_GROUP_SIZE: HistogramVec = register_histogram_vec!(
        "pod_group_size",
        "Observed gang sizes at permit time.",
        &["namespace"],
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0]
    )
    .unwrap();
    pub static ref WAITING_PODS: IntGaugeVec = register_int_gauge_vec!(
        "waiting_pods",
        "Pods parked in the permit waiting room.",
        &["namespace", "pod_group"]
    )
    .unwrap();
    pub static ref RESOURCE_RESERVATIONS: IntGaugeVec = register_int_gauge_vec!(
        "resource_reservations",
        "Live reservation records per namespace.",
        &["namespace"]
    )
    .unwrap();
}

/// `result` label values.
pub const RESULT_SCHEDULED: &str = "scheduled";
pub const RESULT_UNSCHEDULABLE: &str = "unschedulable";
pub const RESULT_ERROR: &str = "error";
