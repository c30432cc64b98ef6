use std::sync::Arc;

use libnexus::models::{FailureReason, SchedulingEvent};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::store::NexusStore;

/// Consumes pipeline outcomes: commits bindings to the store, reports bind
/// failures back over the unassume channel, and records events on pods.
pub struct SchedulerRunner {
    events_rx: mpsc::UnboundedReceiver<SchedulingEvent>,
    unassume_tx: mpsc::UnboundedSender<String>,
    store: Arc<NexusStore>,
}

impl SchedulerRunner {
    pub fn new(
        events_rx: mpsc::UnboundedReceiver<SchedulingEvent>,
        unassume_tx: mpsc::UnboundedSender<String>,
        store: Arc<NexusStore>,
    ) -> Self {
        Self {
            events_rx,
            unassume_tx,
            store,
        }
    }

    /// Runs the outcome loop in a background task and returns immediately.
    pub fn run(mut self) {
        debug!("scheduler outcome loop is running");
        tokio::spawn(async move {
            while let Some(event) = self.events_rx.recv().await {
                match event {
                    SchedulingEvent::Assigned(assignment) => {
                        match self
                            .store
                            .bind_pod(&assignment.pod_key, &assignment.node_name)
                            .await
                        {
                            Ok(()) => {
                                info!(
                                    "bound pod {} to node {}",
                                    assignment.pod_key, assignment.node_name
                                );
                                if let Err(e) = self
                                    .store
                                    .put_event(
                                        &assignment.pod_key,
                                        "Scheduled",
                                        &format!(
                                            "Successfully assigned {} to {}",
                                            assignment.pod_key, assignment.node_name
                                        ),
                                        "Normal",
                                    )
                                    .await
                                {
                                    warn!("failed to record Scheduled event: {e:?}");
                                }
                            }
                            Err(e) => {
                                error!(
                                    "failed to bind pod {} to {}: {e:?}",
                                    assignment.pod_key, assignment.node_name
                                );
                                // Unreserve and retry.
                                let _ = self.unassume_tx.send(assignment.pod_key);
                            }
                        }
                    }
                    SchedulingEvent::Failed {
                        pod_key,
                        reason,
                        message,
                    } => {
                        let event_reason = reason.event_reason();
                        let event_type = match reason {
                            FailureReason::Error => "Warning",
                            _ => "Normal",
                        };
                        if let Err(e) = self
                            .store
                            .put_event(&pod_key, event_reason, &message, event_type)
                            .await
                        {
                            warn!("failed to record {event_reason} event for {pod_key}: {e:?}");
                        }
                    }
                    SchedulingEvent::Nominated {
                        pod_key,
                        node_name,
                        victims,
                    } => {
                        let message = format!(
                            "nominated node {node_name}; awaiting eviction of {}",
                            victims.join(", ")
                        );
                        if let Err(e) = self
                            .store
                            .put_event(&pod_key, "PreemptionNominated", &message, "Warning")
                            .await
                        {
                            warn!("failed to record nomination event for {pod_key}: {e:?}");
                        }
                    }
                }
            }
        });
    }
}
