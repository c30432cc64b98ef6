//! Store integration: long-lived watch streams feed the scheduler cache and
//! the listers, and a store task executes reservation writes.

use std::sync::Arc;

use etcd_client::{Client, EventType, WatchOptions, WatchResponse};
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use crate::gang::{GangDirectory, ReservationSentinels, SharedSentinels};
use crate::listers::{Listers, SharedListers};
use crate::metrics;
use crate::models::SchedulingEvent;
use crate::plugins::node_resources_fit::ScoringStrategy;
use crate::plugins::reservation::ReservationCommand;
use crate::plugins::zone_spread::ZoneCountMode;
use crate::plugins::{PluginDeps, Plugins};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::waiting_room::WaitingRoom;

pub mod utils;

use utils::{
    NAMESPACES_PREFIX, NODES_PREFIX, PODS_PREFIX, RESERVATIONS_PREFIX, key_suffix,
    list_namespaces, list_nodes, list_pods, list_reservations, node_from_kv, pod_from_kv,
};

/// Connection and identity of this scheduler instance.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    /// Pods enter the queue only when their `schedulerName` matches.
    pub scheduler_name: String,
}

/// Start a scheduler wired to the store.
///
/// # Arguments
/// - `unassume_rx`: receiver passing keys of pods whose bind failed.
///
/// Returns the scheduler handle (for shutdown and lister access) and the
/// stream of scheduling outcomes.
pub async fn run_scheduler_with_store(
    config: StoreConfig,
    settings: SchedulerSettings,
    plugins: Plugins,
    scoring_strategy: ScoringStrategy,
    zone_count_mode: ZoneCountMode,
    mut unassume_rx: UnboundedReceiver<String>,
) -> Result<(Arc<Scheduler>, UnboundedReceiver<SchedulingEvent>), anyhow::Error> {
    let endpoints: Vec<&str> = config.endpoints.iter().map(String::as_str).collect();
    let mut client = Client::connect(&endpoints, None).await?;

    let listers = Listers::new();
    let (reservation_tx, reservation_rx) = unbounded_channel();
    let sentinels = ReservationSentinels::new();
    let deps = PluginDeps {
        listers: listers.clone(),
        gang_directory: GangDirectory::new(),
        waiting_room: WaitingRoom::new(),
        sentinels: sentinels.clone(),
        reservation_tx,
        scoring_strategy,
        zone_count_mode,
        permit_timeout: settings.permit_timeout,
    };
    let scheduler = Arc::new(Scheduler::new(settings, &plugins, deps));

    // Prime every informer before the first cycle runs.
    scheduler.prime_nodes(list_nodes(&mut client).await?).await;
    for (name, labels) in list_namespaces(&mut client).await? {
        listers.upsert_namespace(&name, labels);
    }
    for record in list_reservations(&mut client).await? {
        if listers.upsert_reservation(record.clone()) {
            metrics::RESOURCE_RESERVATIONS
                .with_label_values(&[&record.metadata.namespace])
                .inc();
        }
    }
    for pod in list_pods(&mut client).await? {
        if pod.spec.scheduler_name == config.scheduler_name {
            scheduler.update_cache_pod(pod).await;
        } else {
            scheduler.observe_foreign_pod(pod).await;
        }
    }

    let (_, mut nodes_watch_stream) = client
        .watch(NODES_PREFIX, Some(WatchOptions::new().with_prefix()))
        .await?;
    let (_, mut pods_watch_stream) = client
        .watch(PODS_PREFIX, Some(WatchOptions::new().with_prefix()))
        .await?;
    let (_, mut namespaces_watch_stream) = client
        .watch(NAMESPACES_PREFIX, Some(WatchOptions::new().with_prefix()))
        .await?;
    let (_, mut reservations_watch_stream) = client
        .watch(RESERVATIONS_PREFIX, Some(WatchOptions::new().with_prefix()))
        .await?;

    tokio::spawn(run_reservation_executor(
        client.clone(),
        reservation_rx,
        listers.clone(),
        sentinels,
    ));

    let rx = scheduler.run();
    let watch_scheduler = scheduler.clone();
    let scheduler_name = config.scheduler_name.clone();
    tokio::spawn(async move {
        loop {
            select! {
                pod_msg = pods_watch_stream.message() => {
                    handle_pod_update(&watch_scheduler, &scheduler_name, pod_msg).await;
                }
                node_msg = nodes_watch_stream.message() => {
                    handle_node_update(&watch_scheduler, node_msg).await;
                }
                ns_msg = namespaces_watch_stream.message() => {
                    handle_namespace_update(&watch_scheduler.listers(), ns_msg);
                }
                reservation_msg = reservations_watch_stream.message() => {
                    handle_reservation_update(&watch_scheduler.listers(), reservation_msg);
                }
                to_unassume = unassume_rx.recv() => {
                    if let Some(key) = to_unassume {
                        watch_scheduler.unassume(&key).await;
                    }
                }
            }
        }
    });
    Ok((scheduler, rx))
}

/// Execute reservation writes ordered by the reservation manager. A failed
/// create re-arms the sentinel so the next gang member retries; failed
/// deletes stay in the lister and are retried on a later PostBind.
async fn run_reservation_executor(
    mut client: Client,
    mut rx: UnboundedReceiver<ReservationCommand>,
    listers: SharedListers,
    sentinels: SharedSentinels,
) {
    while let Some(command) = rx.recv().await {
        match command {
            ReservationCommand::Create { record, gang_key } => {
                let store_key = format!("{RESERVATIONS_PREFIX}{}", record.key());
                let payload = match serde_yaml::to_string(&*record) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::error!("failed to encode reservation {}: {e}", record.key());
                        sentinels.clear(&gang_key);
                        continue;
                    }
                };
                match client.put(store_key, payload, None).await {
                    Ok(_) => {
                        sentinels.mark_created(&gang_key);
                        // Echo into the lister immediately so the next
                        // member's PreFilter sees it.
                        if listers.upsert_reservation((*record).clone()) {
                            metrics::RESOURCE_RESERVATIONS
                                .with_label_values(&[&record.metadata.namespace])
                                .inc();
                        }
                    }
                    Err(e) => {
                        log::error!("failed to create reservation {}: {e}", record.key());
                        sentinels.clear(&gang_key);
                    }
                }
            }
            ReservationCommand::DeleteForGang { namespace: _, gang_key } => {
                for record in listers.reservations_for_gang(&gang_key) {
                    let store_key = format!("{RESERVATIONS_PREFIX}{}", record.key());
                    match client.delete(store_key, None).await {
                        Ok(_) => {
                            if listers.remove_reservation(&record.key()) {
                                metrics::RESOURCE_RESERVATIONS
                                    .with_label_values(&[&record.metadata.namespace])
                                    .dec();
                            }
                        }
                        Err(e) => {
                            // Left in the lister; the next PostBind retries.
                            log::warn!("failed to delete reservation {}: {e}", record.key());
                        }
                    }
                }
                sentinels.clear(&gang_key);
            }
        }
    }
}

async fn handle_pod_update(
    scheduler: &Arc<Scheduler>,
    scheduler_name: &str,
    pod_msg: Result<Option<WatchResponse>, etcd_client::Error>,
) {
    let Ok(Some(resp)) = pod_msg else { return };
    for e in resp.events() {
        let Some(kv) = e.kv() else { continue };
        match e.event_type() {
            EventType::Put => match pod_from_kv(kv) {
                Ok(pod) => {
                    if pod.phase.is_terminal() {
                        scheduler.remove_cache_pod(&pod.key()).await;
                    } else if pod.spec.scheduler_name == scheduler_name {
                        scheduler.update_cache_pod(pod).await;
                    } else {
                        scheduler.observe_foreign_pod(pod).await;
                    }
                }
                Err(e) => log::warn!("ignoring malformed pod event: {e}"),
            },
            EventType::Delete => {
                if let Some(pod_key) = key_suffix(kv, PODS_PREFIX) {
                    scheduler.remove_cache_pod(&pod_key).await;
                }
            }
        }
    }
}

async fn handle_node_update(
    scheduler: &Arc<Scheduler>,
    node_msg: Result<Option<WatchResponse>, etcd_client::Error>,
) {
    let Ok(Some(resp)) = node_msg else { return };
    for e in resp.events() {
        let Some(kv) = e.kv() else { continue };
        match e.event_type() {
            EventType::Put => match node_from_kv(kv) {
                Ok(node) => scheduler.update_cache_node(node).await,
                Err(e) => log::warn!("ignoring malformed node event: {e}"),
            },
            EventType::Delete => {
                if let Some(node_name) = key_suffix(kv, NODES_PREFIX) {
                    scheduler.remove_cache_node(&node_name).await;
                }
            }
        }
    }
}

fn handle_namespace_update(
    listers: &SharedListers,
    ns_msg: Result<Option<WatchResponse>, etcd_client::Error>,
) {
    let Ok(Some(resp)) = ns_msg else { return };
    for e in resp.events() {
        let Some(kv) = e.kv() else { continue };
        match e.event_type() {
            EventType::Put => match serde_yaml::from_slice::<common::Namespace>(kv.value()) {
                Ok(ns) => listers.upsert_namespace(&ns.metadata.name, ns.metadata.labels),
                Err(e) => log::warn!("ignoring malformed namespace event: {e}"),
            },
            EventType::Delete => {
                if let Some(name) = key_suffix(kv, NAMESPACES_PREFIX) {
                    listers.remove_namespace(&name);
                }
            }
        }
    }
}

fn handle_reservation_update(
    listers: &SharedListers,
    reservation_msg: Result<Option<WatchResponse>, etcd_client::Error>,
) {
    let Ok(Some(resp)) = reservation_msg else { return };
    for e in resp.events() {
        let Some(kv) = e.kv() else { continue };
        match e.event_type() {
            EventType::Put => {
                match serde_yaml::from_slice::<common::ResourceReservation>(kv.value()) {
                    Ok(record) => {
                        if listers.upsert_reservation(record.clone()) {
                            metrics::RESOURCE_RESERVATIONS
                                .with_label_values(&[&record.metadata.namespace])
                                .inc();
                        }
                    }
                    Err(e) => log::warn!("ignoring malformed reservation event: {e}"),
                }
            }
            EventType::Delete => {
                if let Some(key) = key_suffix(kv, RESERVATIONS_PREFIX)
                    && listers.remove_reservation(&key)
                {
                    let namespace = key.split('/').next().unwrap_or_default().to_string();
                    metrics::RESOURCE_RESERVATIONS
                        .with_label_values(&[&namespace])
                        .dec();
                }
            }
        }
    }
}
