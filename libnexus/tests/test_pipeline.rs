use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::time::timeout;

use libnexus::gang::GangDirectory;
use libnexus::gang::ReservationSentinels;
use libnexus::labels;
use libnexus::listers::Listers;
use libnexus::models::{NodeInfo, PodInfo, ResourcesRequirements, SchedulingEvent};
use libnexus::plugins::node_resources_fit::ScoringStrategy;
use libnexus::plugins::reservation::ReservationCommand;
use libnexus::plugins::zone_spread::ZoneCountMode;
use libnexus::plugins::{PluginDeps, Plugins};
use libnexus::scheduler::{Scheduler, SchedulerSettings};
use libnexus::waiting_room::WaitingRoom;
use uuid::Uuid;

fn build_scheduler(
    settings: SchedulerSettings,
) -> (Scheduler, UnboundedReceiver<ReservationCommand>) {
    let listers = Listers::new();
    let (reservation_tx, reservation_rx) = unbounded_channel();
    let deps = PluginDeps {
        listers,
        gang_directory: GangDirectory::new(),
        waiting_room: WaitingRoom::new(),
        sentinels: ReservationSentinels::new(),
        reservation_tx,
        scoring_strategy: ScoringStrategy::LeastAllocated,
        zone_count_mode: ZoneCountMode::NodeCount,
        permit_timeout: settings.permit_timeout,
    };
    (Scheduler::new(settings, &Plugins::default(), deps), reservation_rx)
}

/// Stand-in for the store task: echoes creates into the lister and executes
/// gang deletions, counting creates along the way.
fn spawn_reservation_echo(
    scheduler: &Scheduler,
    mut rx: UnboundedReceiver<ReservationCommand>,
) -> Arc<AtomicUsize> {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let listers = scheduler.listers();
    let sentinels = scheduler.sentinels();
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                ReservationCommand::Create { record, gang_key } => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    sentinels.mark_created(&gang_key);
                    listers.upsert_reservation(*record);
                }
                ReservationCommand::DeleteForGang { gang_key, .. } => {
                    for record in listers.reservations_for_gang(&gang_key) {
                        listers.remove_reservation(&record.key());
                    }
                    sentinels.clear(&gang_key);
                }
            }
        }
    });
    created
}

fn make_node(name: &str, cpu: u64, memory: u64, devices: u64) -> NodeInfo {
    NodeInfo {
        name: name.to_string(),
        allocatable: ResourcesRequirements {
            cpu,
            memory,
            devices,
        },
        ..Default::default()
    }
}

fn make_pod(name: &str, namespace: &str, cpu: u64, memory: u64, devices: u64) -> PodInfo {
    let mut pod = PodInfo {
        uid: Uuid::new_v4(),
        name: name.to_string(),
        namespace: namespace.to_string(),
        ..Default::default()
    };
    pod.spec.resources = ResourcesRequirements {
        cpu,
        memory,
        devices,
    };
    pod
}

fn make_gang_pod(
    name: &str,
    namespace: &str,
    group: &str,
    min: u32,
    cpu: u64,
    memory: u64,
    devices: u64,
) -> PodInfo {
    let mut pod = make_pod(name, namespace, cpu, memory, devices);
    pod.labels
        .insert(labels::GANG_NAME_LABEL.to_string(), group.to_string());
    pod.labels
        .insert(labels::GANG_MIN_AVAILABLE_LABEL.to_string(), min.to_string());
    pod
}

#[tokio::test]
async fn test_gang_of_three_binds_atomically() {
    let settings = SchedulerSettings {
        workers: 2,
        permit_timeout: Duration::from_secs(10),
        ..Default::default()
    };
    let (scheduler, reservation_rx) = build_scheduler(settings);
    let created = spawn_reservation_echo(&scheduler, reservation_rx);

    for i in 1..=4 {
        scheduler
            .update_cache_node(make_node(&format!("n{i}"), 1000, 1 << 30, 0))
            .await;
    }
    for i in 0..3 {
        scheduler
            .update_cache_pod(make_gang_pod(
                &format!("w-{i}"),
                "ml",
                "trainer",
                3,
                100,
                128 << 20,
                0,
            ))
            .await;
    }

    let mut rx = scheduler.run();
    let mut assigned = Vec::new();
    while assigned.len() < 3 {
        let event = timeout(Duration::from_secs(15), rx.recv())
            .await
            .expect("gang did not bind in time")
            .expect("event stream closed");
        if let SchedulingEvent::Assigned(assignment) = event {
            // Echo the bind back, as the store watch would.
            let mut bound = scheduler
                .listers()
                .get_pod(&assignment.pod_key)
                .expect("assigned pod in lister");
            bound.spec.node_name = Some(assignment.node_name.clone());
            bound.scheduled = Some(assignment.node_name.clone());
            scheduler.update_cache_pod(bound).await;
            assigned.push(assignment);
        }
    }

    let mut pods: Vec<String> = assigned.iter().map(|a| a.pod_key.clone()).collect();
    pods.sort();
    assert_eq!(pods, vec!["ml/w-0", "ml/w-1", "ml/w-2"]);

    // Exactly one reservation record was created, and it is retired once the
    // last member binds.
    assert_eq!(created.load(Ordering::SeqCst), 1);
    let listers = scheduler.listers();
    timeout(Duration::from_secs(5), async move {
        loop {
            if listers.reservations_for_gang("ml/trainer").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("reservation record not retired");
}

#[tokio::test]
async fn test_gang_without_capacity_never_binds() {
    let settings = SchedulerSettings {
        workers: 1,
        permit_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let (scheduler, reservation_rx) = build_scheduler(settings);
    let created = spawn_reservation_echo(&scheduler, reservation_rx);

    // Two slots, three members.
    scheduler
        .update_cache_node(make_node("n1", 100, 1 << 30, 0))
        .await;
    scheduler
        .update_cache_node(make_node("n2", 100, 1 << 30, 0))
        .await;
    for i in 0..3 {
        scheduler
            .update_cache_pod(make_gang_pod(
                &format!("w-{i}"),
                "ml",
                "trainer",
                3,
                100,
                64 << 20,
                0,
            ))
            .await;
    }

    let mut rx = scheduler.run();
    let mut saw_permit_timeout = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, rx.recv()).await {
            Ok(Some(SchedulingEvent::Assigned(assignment))) => {
                panic!("no member may bind while the gang cannot assemble: {assignment:?}");
            }
            Ok(Some(SchedulingEvent::Failed { message, .. })) => {
                if message.contains("gang permit timeout") {
                    saw_permit_timeout = true;
                }
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    assert!(saw_permit_timeout, "expected at least one permit timeout");

    // The reservation record persists while the gang is incomplete.
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(
        scheduler.listers().reservations_for_gang("ml/trainer").len(),
        1
    );
}

#[tokio::test]
async fn test_small_job_avoids_pristine_island() {
    let (scheduler, _reservation_rx) = build_scheduler(SchedulerSettings::default());

    let mut big = make_node("gpu-nvswitch", 64_000, 512 << 30, 8);
    big.labels
        .insert(labels::GPU_TOPOLOGY_LABEL.to_string(), "nvswitch".to_string());
    big.labels
        .insert(labels::GPU_COUNT_LABEL.to_string(), "8".to_string());
    let mut small = make_node("gpu-pcie", 64_000, 512 << 30, 2);
    small
        .labels
        .insert(labels::GPU_TOPOLOGY_LABEL.to_string(), "pcie".to_string());
    small
        .labels
        .insert(labels::GPU_COUNT_LABEL.to_string(), "2".to_string());
    scheduler.update_cache_node(big).await;
    scheduler.update_cache_node(small).await;

    scheduler
        .update_cache_pod(make_pod("inference-1", "ml", 1000, 1 << 30, 1))
        .await;

    let mut rx = scheduler.run();
    let event = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("pod did not schedule")
        .expect("event stream closed");
    match event {
        SchedulingEvent::Assigned(assignment) => {
            assert_eq!(assignment.node_name, "gpu-pcie");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_bronze_tenant_steered_off_premium_hardware() {
    let (scheduler, _reservation_rx) = build_scheduler(SchedulerSettings::default());

    let mut ns_labels = HashMap::new();
    ns_labels.insert(labels::TENANT_TIER_KEY.to_string(), "bronze".to_string());
    scheduler.listers().upsert_namespace("batch", ns_labels);

    let mut premium = make_node("premium-node", 8000, 32 << 30, 0);
    premium
        .labels
        .insert(labels::HARDWARE_TIER_LABEL.to_string(), "premium".to_string());
    let mut economy = make_node("economy-node", 8000, 32 << 30, 0);
    economy
        .labels
        .insert(labels::HARDWARE_TIER_LABEL.to_string(), "economy".to_string());
    scheduler.update_cache_node(premium).await;
    scheduler.update_cache_node(economy).await;

    scheduler
        .update_cache_pod(make_pod("job-1", "batch", 500, 1 << 30, 0))
        .await;

    let mut rx = scheduler.run();
    let event = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("pod did not schedule")
        .expect("event stream closed");
    match event {
        SchedulingEvent::Assigned(assignment) => {
            assert_eq!(assignment.node_name, "economy-node");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_gang_preemption_nominates_then_binds() {
    let (scheduler, _reservation_rx) = build_scheduler(SchedulerSettings::default());

    scheduler
        .update_cache_node(make_node("gpu-1", 32_000, 256 << 30, 8))
        .await;
    // Saturate the node with low-priority holders.
    for i in 0..4 {
        let mut holder = make_pod(&format!("low-{i}"), "batch", 1000, 1 << 30, 2);
        holder.spec.priority = 10;
        holder.spec.node_name = Some("gpu-1".to_string());
        holder.scheduled = Some("gpu-1".to_string());
        scheduler.observe_foreign_pod(holder).await;
    }

    let mut gang = make_gang_pod("trainer-0", "ml", "trainer", 1, 4000, 2 << 30, 8);
    gang.spec.priority = 1000;
    scheduler.update_cache_pod(gang).await;

    let mut rx = scheduler.run();

    // First outcome: a nomination listing all four victims.
    let victims = loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no nomination")
            .expect("event stream closed");
        match event {
            SchedulingEvent::Nominated {
                node_name, victims, ..
            } => {
                assert_eq!(node_name, "gpu-1");
                assert_eq!(victims.len(), 4);
                break victims;
            }
            SchedulingEvent::Failed { .. } => continue,
            other => panic!("unexpected event {other:?}"),
        }
    };

    // The orchestrator evicts the victims; the gang pod then lands.
    for victim in victims {
        scheduler.remove_cache_pod(&victim).await;
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        assert!(!remaining.is_zero(), "gang pod never bound after eviction");
        match timeout(remaining, rx.recv()).await {
            Ok(Some(SchedulingEvent::Assigned(assignment))) => {
                assert_eq!(assignment.pod_key, "ml/trainer-0");
                assert_eq!(assignment.node_name, "gpu-1");
                break;
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => panic!("event stream ended early"),
        }
    }
}
