use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, interval, timeout};

use crate::cache::Cache;
use crate::cycle_state::CycleState;
use crate::gang::{SharedGangDirectory, SharedSentinels};
use crate::labels;
use crate::listers::SharedListers;
use crate::metrics;
use crate::models::{
    Assignment, BackOffPod, FailureReason, NodeInfo, PodInfo, QueuedPod, SchedulingEvent,
};
use crate::plugins::{Code, EnabledPlugins, NodeToStatus, PluginDeps, Plugins, Registry, Status};
use crate::waiting_room::{PermitVerdict, SharedWaitingRoom};

/// Knobs of the pipeline driver.
#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    /// Worker tasks pulling units off the queue.
    pub workers: usize,
    /// Default gang permit timeout.
    pub permit_timeout: Duration,
    /// Upper bound of the per-cycle filter/score fan-out.
    pub max_parallelism: usize,
    /// Cycles started per second across all workers; None removes the limit.
    pub queue_burst: Option<u32>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            permit_timeout: Duration::from_secs(60),
            max_parallelism: 16,
            queue_burst: None,
        }
    }
}

type ActiveQueue = Arc<Mutex<BinaryHeap<QueuedPod>>>;
type BackoffQueue = Arc<Mutex<BinaryHeap<BackOffPod>>>;
type UnschedulableQueue = Arc<Mutex<Vec<(BackOffPod, Instant)>>>;

/// How long a unit may sit in the unschedulable pool before it is retried
/// regardless of cluster events.
const POD_MAX_IN_UNSCHEDULABLE_DURATION: Duration = Duration::from_secs(5 * 60);
const UNSCHEDULABLE_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
/// Attempts after which a unit parks in the unschedulable pool instead of
/// the backoff heap.
const MAX_BACKOFF_ATTEMPTS: u32 = 8;

pub struct SchedulingQueue {
    active_queue: ActiveQueue,
    backoff_queue: BackoffQueue,
    unschedulable_queue: UnschedulableQueue,
    /// Used for waiting for state changes when no pods are schedulable.
    /// Each pod addition increments the state change counter.
    status_count: Mutex<watch::Receiver<usize>>,
    status_sx: watch::Sender<usize>,
    seq: AtomicU64,
}

impl Default for SchedulingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulingQueue {
    pub fn new() -> Self {
        let (sx, rx) = watch::channel(0);
        Self {
            active_queue: Arc::new(Mutex::new(BinaryHeap::new())),
            backoff_queue: Arc::new(Mutex::new(BinaryHeap::new())),
            unschedulable_queue: Arc::new(Mutex::new(Vec::new())),
            status_count: Mutex::new(rx),
            status_sx: sx,
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// A cluster event may have made parked units schedulable; move
    /// everything out of the unschedulable pool.
    pub async fn move_all_to_active_or_backoff(&self) {
        let now = Instant::now();
        let mut active_guard = self.active_queue.lock().await;
        let mut backoff_guard = self.backoff_queue.lock().await;
        self.unschedulable_queue
            .lock()
            .await
            .drain(..)
            .for_each(|(p, _)| {
                if p.expire <= now {
                    active_guard.push(p.pod);
                } else {
                    backoff_guard.push(p);
                }
            });
        self.add_count().await;
    }

    pub async fn next_pod(&self) -> QueuedPod {
        let mut next = self.active_queue.lock().await.pop();
        while next.is_none() {
            let mut status_guard = self.status_count.lock().await;
            status_guard
                .changed()
                .await
                .expect("status_sx closed for unknown reason");
            next = self.active_queue.lock().await.pop();
        }
        next.unwrap()
    }

    async fn flush_backoff_completed(
        active: ActiveQueue,
        backoff: BackoffQueue,
        sx: watch::Sender<usize>,
    ) {
        let now = Instant::now();
        let mut active_guard = active.lock().await;
        let mut backoff_guard = backoff.lock().await;
        while !backoff_guard.is_empty() && backoff_guard.peek().unwrap().expire <= now {
            let pod = backoff_guard.pop().unwrap();
            active_guard.push(pod.pod);
        }
        sx.send_modify(|v| (*v) += 1);
    }

    async fn flush_unschedulable_left_over(
        active: ActiveQueue,
        backoff: BackoffQueue,
        unschedulable: UnschedulableQueue,
        sx: watch::Sender<usize>,
    ) {
        let now = Instant::now();
        let mut active_guard = active.lock().await;
        let mut backoff_guard = backoff.lock().await;
        let mut unschedulable_guard = unschedulable.lock().await;
        let mut remaining = Vec::with_capacity(unschedulable_guard.len());
        for (p, parked_at) in unschedulable_guard.drain(..) {
            if now.duration_since(parked_at) > POD_MAX_IN_UNSCHEDULABLE_DURATION {
                if now >= p.expire {
                    active_guard.push(p.pod);
                } else {
                    backoff_guard.push(p);
                }
            } else {
                remaining.push((p, parked_at));
            }
        }
        *unschedulable_guard = remaining;
        sx.send_modify(|v| (*v) += 1);
    }

    fn run(&self) {
        let active_queue = self.active_queue.clone();
        let backoff_queue = self.backoff_queue.clone();
        let status_sx = self.status_sx.clone();
        tokio::spawn(async move {
            let mut timer = interval(Duration::from_secs(1));
            loop {
                Self::flush_backoff_completed(
                    active_queue.clone(),
                    backoff_queue.clone(),
                    status_sx.clone(),
                )
                .await;
                timer.tick().await;
            }
        });

        let active_queue = self.active_queue.clone();
        let backoff_queue = self.backoff_queue.clone();
        let unschedulable_queue = self.unschedulable_queue.clone();
        let status_sx = self.status_sx.clone();
        tokio::spawn(async move {
            let mut timer = interval(UNSCHEDULABLE_FLUSH_INTERVAL);
            loop {
                Self::flush_unschedulable_left_over(
                    active_queue.clone(),
                    backoff_queue.clone(),
                    unschedulable_queue.clone(),
                    status_sx.clone(),
                )
                .await;
                timer.tick().await;
            }
        });
    }

    async fn add_count(&self) {
        self.status_sx.send_modify(|v| *v += 1);
    }

    pub async fn push(&self, pod_key: String, priority: i64) {
        let entry = QueuedPod {
            priority,
            seq: self.next_seq(),
            key: pod_key,
        };
        let mut guard = self.active_queue.lock().await;
        guard.push(entry);
        drop(guard);
        self.add_count().await;
    }

    pub async fn push_backoff(&self, pod: &PodInfo) {
        let attempts = pod.queued_info.attempts;
        let expire = Instant::now() + Duration::from_secs(2_u64.pow(attempts.min(MAX_BACKOFF_ATTEMPTS)));
        let backoff_pod = BackOffPod {
            pod: QueuedPod {
                priority: pod.spec.priority,
                seq: self.next_seq(),
                key: pod.key(),
            },
            expire,
        };
        if attempts > MAX_BACKOFF_ATTEMPTS {
            let mut guard = self.unschedulable_queue.lock().await;
            guard.push((backoff_pod, Instant::now()));
        } else {
            let mut guard = self.backoff_queue.lock().await;
            guard.push(backoff_pod);
        }
    }
}

/// Everything one scheduling cycle needs, shared across workers.
struct Pipeline {
    cache: Arc<RwLock<Cache>>,
    queue: Arc<SchedulingQueue>,
    plugins: EnabledPlugins,
    waiting_room: SharedWaitingRoom,
    gang_directory: SharedGangDirectory,
    settings: SchedulerSettings,
    events: UnboundedSender<SchedulingEvent>,
}

/// The pipeline driver: owns the queue, the snapshot cache and the enabled
/// plugin set, and runs worker tasks that take one pending unit each through
/// the phase sequence.
pub struct Scheduler {
    cache: Arc<RwLock<Cache>>,
    queue: Arc<SchedulingQueue>,
    listers: SharedListers,
    plugins: EnabledPlugins,
    waiting_room: SharedWaitingRoom,
    gang_directory: SharedGangDirectory,
    sentinels: SharedSentinels,
    settings: SchedulerSettings,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings, plugins_config: &Plugins, deps: PluginDeps) -> Self {
        let registry = Registry::new(&deps);
        let plugins = EnabledPlugins::assemble(&registry, plugins_config);
        let (shutdown, _) = watch::channel(false);
        Self {
            cache: Arc::new(RwLock::new(Cache::new())),
            queue: Arc::new(SchedulingQueue::new()),
            listers: deps.listers,
            plugins,
            waiting_room: deps.waiting_room,
            gang_directory: deps.gang_directory,
            sentinels: deps.sentinels,
            settings,
            shutdown,
        }
    }

    pub fn listers(&self) -> SharedListers {
        self.listers.clone()
    }

    pub fn sentinels(&self) -> SharedSentinels {
        self.sentinels.clone()
    }

    /// Start the queue maintenance tasks and the worker pool. Scheduling
    /// outcomes stream out of the returned receiver.
    pub fn run(&self) -> UnboundedReceiver<SchedulingEvent> {
        self.queue.run();
        let (sx, rx) = unbounded_channel();
        let pipeline = Arc::new(Pipeline {
            cache: self.cache.clone(),
            queue: self.queue.clone(),
            plugins: self.plugins.clone(),
            waiting_room: self.waiting_room.clone(),
            gang_directory: self.gang_directory.clone(),
            settings: self.settings.clone(),
            events: sx,
        });
        // Token bucket implementing the queue burst limit, shared by all
        // workers; refilled once a second.
        let tokens = self.settings.queue_burst.map(|burst| {
            let burst = burst.max(1) as usize;
            let (token_tx, token_rx) = tokio::sync::mpsc::channel::<()>(burst);
            tokio::spawn(async move {
                let mut timer = interval(Duration::from_secs(1));
                loop {
                    timer.tick().await;
                    while token_tx.try_send(()).is_ok() {}
                }
            });
            Arc::new(Mutex::new(token_rx))
        });

        for worker in 0..self.settings.workers.max(1) {
            let pipeline = pipeline.clone();
            let mut shutdown = self.shutdown.subscribe();
            let tokens = tokens.clone();
            tokio::spawn(async move {
                log::debug!("scheduling worker {worker} started");
                loop {
                    if let Some(tokens) = &tokens {
                        let mut rx = tokens.lock().await;
                        if rx.recv().await.is_none() {
                            break;
                        }
                    }
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        queued = pipeline.queue.next_pod() => {
                            Pipeline::schedule_one(pipeline.clone(), queued).await;
                        }
                    }
                }
                log::debug!("scheduling worker {worker} stopped");
            });
        }
        rx
    }

    /// Cancel all workers and drain the waiting room so every suspended
    /// cycle unreserves.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let drained = self.waiting_room.reject_all("shutting down");
        if drained > 0 {
            log::info!("released {drained} waiting pod(s) on shutdown");
        }
    }

    /// Only needed for unusual updates; routine post-bind state flows from
    /// the watch stream automatically.
    pub async fn update_cache_pod(&self, pod: PodInfo) {
        self.upsert_pod_inner(pod, true).await;
    }

    /// Track a pod this scheduler does not own. It still consumes node
    /// capacity and counts toward gang observation, but never enters the
    /// queue.
    pub async fn observe_foreign_pod(&self, pod: PodInfo) {
        self.upsert_pod_inner(pod, false).await;
    }

    async fn upsert_pod_inner(&self, pod: PodInfo, enqueue: bool) {
        self.listers.upsert_pod(pod.clone());
        let mut write_lock = self.cache.write().await;
        let existing = write_lock.get_pod(&pod.key());
        if let Some(existing) = &existing
            && existing.scheduled.is_some()
            && pod.scheduled.is_none()
        {
            // The snapshot runs ahead of the store; a pending echo of an
            // assumed pod must not clobber the assumption.
            return;
        }
        let key = pod.key();
        let priority = pod.spec.priority;
        let scheduled = pod.scheduled.clone();
        (*write_lock).update_pod(pod);
        if existing.is_none()
            && let Some(node_name) = &scheduled
        {
            // First sight of an already-bound pod (restart recovery or a
            // foreign placement): account it onto its node.
            (*write_lock).assign(&key, node_name);
        }
        drop(write_lock);
        if enqueue && scheduled.is_none() && existing.is_none() {
            self.queue.push(key, priority).await;
        }
    }

    /// Seed the snapshot with a full node listing at startup, before any
    /// pods are replayed against it.
    pub async fn prime_nodes(&self, nodes: Vec<NodeInfo>) {
        let mut write_lock = self.cache.write().await;
        for node in nodes {
            self.listers.upsert_node(node.clone());
            (*write_lock).update_node(node);
        }
    }

    pub async fn remove_cache_pod(&self, pod_key: &str) {
        self.listers.remove_pod(pod_key);
        let mut write_lock = self.cache.write().await;
        (*write_lock).remove_pod(pod_key);
    }

    pub async fn update_cache_node(&self, node: NodeInfo) {
        self.listers.upsert_node(node.clone());
        let mut write_lock = self.cache.write().await;
        (*write_lock).update_node(node);
        drop(write_lock);
        self.queue.move_all_to_active_or_backoff().await;
    }

    pub async fn remove_cache_node(&self, node_name: &str) {
        self.listers.remove_node(node_name);
        let mut write_lock = self.cache.write().await;
        let displaced = write_lock.pop_pods_on_node(node_name);
        for entry in displaced {
            self.queue.push(entry.key, entry.priority).await;
        }
        (*write_lock).remove_node(node_name);
        drop(write_lock);
        self.queue.move_all_to_active_or_backoff().await;
    }

    /// Roll back an assumption after a failed bind and retry the unit.
    pub async fn unassume(&self, pod_key: &str) {
        let mut write_lock = self.cache.write().await;
        write_lock.unassume(pod_key);
        let pod = write_lock.get_pod(pod_key);
        drop(write_lock);
        if let Some(pod) = pod {
            self.queue.push(pod.key(), pod.spec.priority).await;
        }
    }
}

impl Pipeline {
    /// Per-cycle fan-out bound: min(configured cap, nodeCount/2), at least 1.
    fn parallelism(&self, node_count: usize) -> usize {
        self.settings.max_parallelism.min((node_count / 2).max(1))
    }

    /// Record a failed cycle: count it, requeue with backoff, surface the
    /// diagnostic.
    async fn fail(&self, pod: &PodInfo, reason: FailureReason, message: String, plugin: &str) {
        let result = match reason {
            FailureReason::Error => metrics::RESULT_ERROR,
            _ => metrics::RESULT_UNSCHEDULABLE,
        };
        metrics::SCHEDULING_ATTEMPTS
            .with_label_values(&[result, plugin])
            .inc();
        log::debug!("pod {} not scheduled: {message}", pod.key());

        let mut cache = self.cache.write().await;
        let requeue = if cache.add_fail(&pod.key()) {
            cache.get_pod(&pod.key())
        } else {
            None
        };
        drop(cache);
        if let Some(updated) = requeue {
            self.queue.push_backoff(&updated).await;
        }
        let _ = self.events.send(SchedulingEvent::Failed {
            pod_key: pod.key(),
            reason,
            message,
        });
    }

    async fn schedule_one(pipeline: Arc<Pipeline>, queued: QueuedPod) {
        let cycle_start = Instant::now();
        let cache_read = pipeline.cache.read().await;
        let pod_info = cache_read.get_pod(&queued.key);
        let nodes = cache_read.get_nodes();
        drop(cache_read);

        let pod = match pod_info {
            Some(pod) => pod,
            None => return,
        };
        if pod.spec.priority != queued.priority {
            // The pod priority is already updated; a fresher entry exists.
            return;
        }
        if pod.scheduled.is_some() || pod.spec.node_name.is_some() {
            // Already placed; re-running the pipeline is a no-op.
            return;
        }

        // PreFilter.
        let mut state = CycleState::default();
        for plugin in &pipeline.plugins.pre_filter {
            let status = plugin.pre_filter(&mut state, &pod, &nodes);
            match status.code {
                Code::Success => {}
                Code::Skip => {
                    state.skip_filter_plugins.insert(plugin.name().to_string());
                    state.skip_score_plugins.insert(plugin.name().to_string());
                }
                Code::Unschedulable | Code::UnschedulableAndUnresolvable => {
                    pipeline
                        .fail(
                            &pod,
                            FailureReason::Unschedulable,
                            status.message(),
                            plugin.name(),
                        )
                        .await;
                    return;
                }
                _ => {
                    pipeline
                        .fail(
                            &pod,
                            FailureReason::Error,
                            status.message(),
                            plugin.name(),
                        )
                        .await;
                    return;
                }
            }
        }

        // Filter and Score read the frozen cycle state concurrently.
        let state = Arc::new(state);
        let pod = Arc::new(pod);

        let filter_start = Instant::now();
        let (survivors, node_statuses, filter_error) =
            Self::run_filters(&pipeline, state.clone(), pod.clone(), &nodes).await;
        metrics::SCHEDULING_DURATION
            .with_label_values(&["filter", "pipeline"])
            .observe(filter_start.elapsed().as_secs_f64());

        if let Some((plugin, status)) = filter_error {
            pipeline
                .fail(&pod, FailureReason::Error, status.message(), &plugin)
                .await;
            return;
        }

        // PostFilter runs only when nothing survived.
        if survivors.is_empty() {
            if !node_statuses.all_unresolvable() || pipeline.plugins.post_filter.is_empty() {
                for plugin in &pipeline.plugins.post_filter {
                    let (nomination, status) = plugin.post_filter(&state, &pod, &nodes);
                    if let Some(nomination) = nomination {
                        let _ = pipeline.events.send(SchedulingEvent::Nominated {
                            pod_key: pod.key(),
                            node_name: nomination.node_name,
                            victims: nomination.victims,
                        });
                        pipeline
                            .fail(
                                &pod,
                                FailureReason::Unschedulable,
                                "awaiting preemption of nominated victims".to_string(),
                                plugin.name(),
                            )
                            .await;
                        return;
                    } else if status.code == Code::Error {
                        pipeline
                            .fail(&pod, FailureReason::Error, status.message(), plugin.name())
                            .await;
                        return;
                    }
                }
            }
            pipeline
                .fail(
                    &pod,
                    FailureReason::Unschedulable,
                    "no feasible node".to_string(),
                    "pipeline",
                )
                .await;
            return;
        }

        // Score.
        let score_start = Instant::now();
        let chosen = Self::run_scores(&pipeline, state.clone(), pod.clone(), survivors).await;
        metrics::SCHEDULING_DURATION
            .with_label_values(&["score", "pipeline"])
            .observe(score_start.elapsed().as_secs_f64());
        let node_name = match chosen {
            Ok(node_name) => node_name,
            Err(status) => {
                pipeline
                    .fail(&pod, FailureReason::Error, status.message(), "pipeline")
                    .await;
                return;
            }
        };

        // Reserve: account the choice in the snapshot before Permit.
        {
            let mut cache = pipeline.cache.write().await;
            if !cache.assign(&pod.key(), &node_name) {
                drop(cache);
                pipeline
                    .fail(
                        &pod,
                        FailureReason::Error,
                        format!("reserve failed: pod or node {node_name} vanished"),
                        "pipeline",
                    )
                    .await;
                return;
            }
        }

        // Permit. Gang members park before the gate so a concurrent release
        // cannot slip between the decision and the parking.
        let gang = labels::gang_group(&pod);
        let permit_rx = gang
            .as_ref()
            .map(|(group, _)| pipeline.waiting_room.park(pod.uid, &pod.namespace, group));

        let mut wait_timeout: Option<Duration> = None;
        let mut rejection: Option<(String, String)> = None;
        for plugin in &pipeline.plugins.permit {
            let (status, plugin_timeout) = plugin.permit(&state, &pod, &node_name);
            match status.code {
                Code::Success => {}
                Code::Wait => {
                    wait_timeout =
                        Some(wait_timeout.map_or(plugin_timeout, |t| t.max(plugin_timeout)));
                }
                _ => {
                    rejection = Some((plugin.name().to_string(), status.message()));
                    break;
                }
            }
        }

        if let Some((plugin, message)) = rejection {
            if gang.is_some() {
                pipeline.waiting_room.forget(pod.uid);
            }
            pipeline.unreserve(&pod).await;
            pipeline
                .fail(&pod, FailureReason::Unschedulable, message, &plugin)
                .await;
            return;
        }

        match (wait_timeout, permit_rx) {
            (Some(permit_timeout), Some(rx)) => {
                // Suspend: the worker returns to the pool, a waiter task
                // finishes the cycle when the verdict or the timer fires.
                let pipeline = pipeline.clone();
                let state = state.clone();
                let gang = gang.expect("wait verdicts only come from gang pods");
                tokio::spawn(async move {
                    Self::await_permit(pipeline, state, pod, node_name, gang, permit_timeout, rx)
                        .await;
                });
            }
            (_, permit_rx) => {
                // Allowed straight through.
                if permit_rx.is_some() {
                    pipeline.waiting_room.forget(pod.uid);
                }
                if let Some((group, _)) = gang.as_ref() {
                    pipeline.gang_directory.remove_waiter(
                        &labels::gang_key(&pod.namespace, group),
                        pod.uid,
                    );
                }
                Self::bind(&pipeline, &state, &pod, &node_name, cycle_start).await;
            }
        }
    }

    async fn run_filters(
        pipeline: &Arc<Pipeline>,
        state: Arc<CycleState>,
        pod: Arc<PodInfo>,
        nodes: &[NodeInfo],
    ) -> (Vec<NodeInfo>, NodeToStatus, Option<(String, Status)>) {
        let limit = pipeline.parallelism(nodes.len());
        let chunk_size = nodes.len().div_ceil(limit.max(1)).max(1);

        let mut join_set: JoinSet<Vec<(NodeInfo, Status)>> = JoinSet::new();
        for chunk in nodes.chunks(chunk_size) {
            let chunk = chunk.to_vec();
            let pipeline = pipeline.clone();
            let state = state.clone();
            let pod = pod.clone();
            join_set.spawn(async move {
                chunk
                    .into_iter()
                    .map(|node| {
                        let mut verdict = Status::default();
                        for plugin in &pipeline.plugins.filter {
                            if state.skip_filter_plugins.contains(plugin.name()) {
                                continue;
                            }
                            let status = plugin.filter(&state, &pod, &node);
                            if !status.is_success() {
                                verdict = status.with_plugin(plugin.name());
                                break;
                            }
                        }
                        (node, verdict)
                    })
                    .collect()
            });
        }

        let mut survivors = Vec::new();
        let mut statuses = NodeToStatus::default();
        let mut error = None;
        while let Some(result) = join_set.join_next().await {
            let Ok(chunk_results) = result else { continue };
            for (node, status) in chunk_results {
                match status.code {
                    Code::Success => survivors.push(node),
                    Code::Error => {
                        error = Some((status.plugin.clone(), status));
                    }
                    _ => {
                        statuses.insert(node.name.clone(), status);
                    }
                }
            }
        }
        // Deterministic order regardless of chunk completion.
        survivors.sort_by(|a, b| a.name.cmp(&b.name));
        (survivors, statuses, error)
    }

    async fn run_scores(
        pipeline: &Arc<Pipeline>,
        state: Arc<CycleState>,
        pod: Arc<PodInfo>,
        nodes: Vec<NodeInfo>,
    ) -> Result<String, Status> {
        if pipeline.plugins.score.is_empty() {
            // Nothing ranks the survivors; lexicographic order decides.
            return Ok(nodes[0].name.clone());
        }

        let limit = pipeline.parallelism(nodes.len());
        let chunk_size = nodes.len().div_ceil(limit.max(1)).max(1);

        let mut join_set: JoinSet<Result<Vec<(usize, Vec<i64>)>, Status>> = JoinSet::new();
        for (chunk_index, chunk) in nodes.chunks(chunk_size).enumerate() {
            let chunk = chunk.to_vec();
            let base = chunk_index * chunk_size;
            let pipeline = pipeline.clone();
            let state = state.clone();
            let pod = pod.clone();
            join_set.spawn(async move {
                let mut results = Vec::with_capacity(chunk.len());
                for (offset, node) in chunk.iter().enumerate() {
                    let mut per_plugin = Vec::with_capacity(pipeline.plugins.score.len());
                    for (plugin, _) in &pipeline.plugins.score {
                        if state.skip_score_plugins.contains(plugin.name()) {
                            per_plugin.push(0);
                            continue;
                        }
                        let (score, status) = plugin.score(&state, &pod, node);
                        if !status.is_success() {
                            return Err(status.with_plugin(plugin.name()));
                        }
                        per_plugin.push(score.clamp(0, 100));
                    }
                    results.push((base + offset, per_plugin));
                }
                Ok(results)
            });
        }

        let plugin_count = pipeline.plugins.score.len();
        let mut per_plugin_scores = vec![vec![0_i64; nodes.len()]; plugin_count];
        while let Some(result) = join_set.join_next().await {
            let chunk_results = match result {
                Ok(Ok(r)) => r,
                Ok(Err(status)) => return Err(status),
                Err(e) => return Err(Status::error(&format!("score task panicked: {e}"))),
            };
            for (node_index, scores) in chunk_results {
                for (plugin_index, score) in scores.into_iter().enumerate() {
                    per_plugin_scores[plugin_index][node_index] = score;
                }
            }
        }

        // Normalize per plugin, then apply weights and sum.
        let mut totals = vec![0_i64; nodes.len()];
        for (plugin_index, (plugin, weight)) in pipeline.plugins.score.iter().enumerate() {
            let scores = &mut per_plugin_scores[plugin_index];
            let status = plugin.score_extension().normalize_score(scores);
            if !status.is_success() {
                return Err(status.with_plugin(plugin.name()));
            }
            for (node_index, score) in scores.iter().enumerate() {
                totals[node_index] += *score * *weight;
            }
        }

        // Maximum total wins; ties break lexicographically by node name,
        // which the pre-sorted survivor order provides.
        let mut best = 0;
        for index in 1..nodes.len() {
            if totals[index] > totals[best] {
                best = index;
            }
        }
        log::debug!(
            "scored {} node(s) for {}: chose {} (total {})",
            nodes.len(),
            pod.key(),
            nodes[best].name,
            totals[best]
        );
        Ok(nodes[best].name.clone())
    }

    async fn unreserve(&self, pod: &PodInfo) {
        let mut cache = self.cache.write().await;
        cache.unassume(&pod.key());
    }

    async fn bind(
        pipeline: &Arc<Pipeline>,
        state: &CycleState,
        pod: &PodInfo,
        node_name: &str,
        cycle_start: Instant,
    ) {
        let _ = pipeline.events.send(SchedulingEvent::Assigned(Assignment {
            pod_key: pod.key(),
            pod_uid: pod.uid,
            node_name: node_name.to_string(),
        }));
        metrics::SCHEDULING_ATTEMPTS
            .with_label_values(&[metrics::RESULT_SCHEDULED, "pipeline"])
            .inc();
        metrics::SCHEDULING_DURATION
            .with_label_values(&["scheduling_cycle", "pipeline"])
            .observe(cycle_start.elapsed().as_secs_f64());

        // PostBind cleanup, e.g. reservation retirement.
        for plugin in &pipeline.plugins.post_bind {
            plugin.post_bind(state, pod, node_name);
        }
    }

    async fn await_permit(
        pipeline: Arc<Pipeline>,
        state: Arc<CycleState>,
        pod: Arc<PodInfo>,
        node_name: String,
        gang: (String, u32),
        permit_timeout: Duration,
        rx: tokio::sync::oneshot::Receiver<PermitVerdict>,
    ) {
        let (group, _) = gang;
        let gang_key = labels::gang_key(&pod.namespace, &group);
        let started = Instant::now();

        let outcome = timeout(permit_timeout, rx).await;
        metrics::SCHEDULING_DURATION
            .with_label_values(&["permit_wait", "pipeline"])
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(PermitVerdict::Allow)) => {
                pipeline.gang_directory.remove_waiter(&gang_key, pod.uid);
                Self::bind(&pipeline, &state, &pod, &node_name, started).await;
            }
            Ok(Ok(PermitVerdict::Reject(message))) => {
                pipeline.gang_directory.remove_waiter(&gang_key, pod.uid);
                pipeline.unreserve(&pod).await;
                pipeline
                    .fail(&pod, FailureReason::Unschedulable, message, "GangCoordinator")
                    .await;
            }
            Ok(Err(_closed)) => {
                pipeline.gang_directory.remove_waiter(&gang_key, pod.uid);
                pipeline.unreserve(&pod).await;
                pipeline
                    .fail(
                        &pod,
                        FailureReason::Error,
                        "permit channel closed".to_string(),
                        "GangCoordinator",
                    )
                    .await;
            }
            Err(_elapsed) => {
                pipeline.waiting_room.forget(pod.uid);
                pipeline.gang_directory.remove_waiter(&gang_key, pod.uid);
                pipeline.unreserve(&pod).await;
                pipeline
                    .fail(
                        &pod,
                        FailureReason::Unschedulable,
                        "gang permit timeout".to_string(),
                        "GangCoordinator",
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_push_and_next_pod() {
        let queue = Arc::new(SchedulingQueue::new());
        queue.push("default/pod1".to_string(), 1).await;
        queue.push("default/pod3".to_string(), 3).await;
        queue.push("default/pod2".to_string(), 2).await;
        let next = queue.next_pod().await;
        assert_eq!(next.priority, 3);
        assert_eq!(next.key, "default/pod3");
        let next = queue.next_pod().await;
        assert_eq!(next.priority, 2);
        let next = queue.next_pod().await;
        assert_eq!(next.priority, 1);

        let (pod_sx, mut pod_rx) = unbounded_channel();
        let cloned_queue = queue.clone();
        tokio::spawn(async move {
            let queued = cloned_queue.next_pod().await;
            pod_sx.send(queued).unwrap();
        });
        queue.push("default/pod1".to_string(), 1).await;
        let res = timeout(Duration::from_secs(5), pod_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.priority, 1);
        assert_eq!(res.key, "default/pod1");
    }

    #[tokio::test]
    async fn test_equal_priority_pops_fifo() {
        let queue = SchedulingQueue::new();
        queue.push("default/first".to_string(), 7).await;
        queue.push("default/second".to_string(), 7).await;
        assert_eq!(queue.next_pod().await.key, "default/first");
        assert_eq!(queue.next_pod().await.key, "default/second");
    }

    fn make_pod(pod_name: &str, priority: i64, attempts: u32) -> PodInfo {
        let mut pod = PodInfo {
            name: pod_name.to_owned(),
            ..Default::default()
        };
        pod.spec.priority = priority;
        pod.queued_info.attempts = attempts;
        pod
    }

    #[tokio::test]
    async fn test_push_backoff_and_unschedulable() {
        let queue = SchedulingQueue::new();
        let pod = make_pod("pod", 1, 9);
        queue.push_backoff(&pod).await;
        let unschedulable = queue.unschedulable_queue.lock().await;
        assert_eq!(unschedulable.len(), 1);
    }

    #[tokio::test]
    async fn test_backoff_queue_flush() {
        let queue = SchedulingQueue::new();
        let pod = make_pod("pod", 1, 0);
        queue.run();
        queue.push_backoff(&pod).await;
        let res = timeout(Duration::from_secs(3), queue.next_pod()).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn test_move_all_to_active_or_backoff() {
        let queue = SchedulingQueue::new();
        let pod = make_pod("parked", 1, 9);
        queue.push_backoff(&pod).await;
        assert_eq!(queue.unschedulable_queue.lock().await.len(), 1);

        queue.move_all_to_active_or_backoff().await;
        assert_eq!(queue.unschedulable_queue.lock().await.len(), 0);
        // The entry lands in the backoff heap until its expiry passes.
        let backoff_len = queue.backoff_queue.lock().await.len();
        let active_len = queue.active_queue.lock().await.len();
        assert_eq!(backoff_len + active_len, 1);
    }
}
