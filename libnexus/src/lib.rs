//! Scheduling pipeline library for KubeNexus.
//!
//! The pipeline runs each pending workload unit through PreFilter, Filter,
//! PostFilter, Score, Reserve, Permit, Bind and PostBind hook points, with a
//! gang coordinator and a capacity-reservation protocol layered on top.

pub mod cache;
pub mod cycle_state;
pub mod gang;
pub mod labels;
pub mod listers;
pub mod metrics;
pub mod models;
pub mod plugins;
pub mod profile;
pub mod scheduler;
pub mod waiting_room;
pub mod with_store;
