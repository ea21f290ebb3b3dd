//! The node agent: wiring of every component and the handlers the sync loop
//! dispatches into.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use nodelet_core::PodUid;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::active_deadline::{ActiveDeadlineHandler, PodSyncHandler, PodSyncLoopHandler};
use crate::admission::{
    AdmitHandlers, NoNewPrivsAdmitHandler, PodAdmitAttributes, PodAdmitHandler,
    ResourceFitAdmitHandler,
};
use crate::backoff::Backoff;
use crate::cache::PodCache;
use crate::collaborators::{ContainerManager, MirrorClient, SecretProvider, VolumeManager};
use crate::error::{KubeletError, Result};
use crate::events::{EventRecorder, EventType};
use crate::eviction::{EvictionCallbacks, EvictionManager, StatsProvider};
use crate::gc::{self, ContainerGc, ImageGc};
use crate::metrics::Metrics;
use crate::pleg::GenericPleg;
use crate::pod;
use crate::pod_config::{PodUpdate, SourcesReady};
use crate::pod_dirs::PodDirs;
use crate::pod_manager::PodManager;
use crate::pod_workers::{PodSyncer, PodWorkers, PodWorkersConfig};
use crate::reason_cache::ReasonCache;
use crate::runtime::{ContainerRuntime, RunningPod, NETWORK_READY, RUNTIME_READY};
use crate::runtime_state::RuntimeState;
use crate::status_manager::{StatusManager, StatusSink};
use crate::sync_loop::{
    run_sync_loop, LivenessUpdate, SyncLoopConfig, SyncLoopHandler, SyncLoopHealth,
    SyncLoopInputs,
};
use crate::sync_pod::{KubeletPodSyncer, SyncerDeps};
use crate::types::{
    KillPodOptions, KubeletConfig, PodPhase, PodStatusFn, SyncPodType, UpdatePodOptions,
};
use crate::work_queue::WorkQueue;

/// The runtime is considered down when no status check succeeded for this
/// long.
pub const MAX_WAIT_FOR_CONTAINER_RUNTIME: Duration = Duration::from_secs(30);
/// Shortest wait for a pod kill requested through [`Kubelet::kill_pod_now`].
pub const MIN_KILL_TIMEOUT: Duration = Duration::from_secs(10);

const POD_KILLER_CAPACITY: usize = 50;

/// External collaborators handed to [`Kubelet::new`].
#[derive(Clone)]
pub struct KubeletDeps {
    /// Container runtime.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Volume manager.
    pub volume_manager: Arc<dyn VolumeManager>,
    /// Cgroup manager.
    pub container_manager: Arc<dyn ContainerManager>,
    /// Mirror pod client.
    pub mirror_client: Arc<dyn MirrorClient>,
    /// Image pull secret source.
    pub secrets: Arc<dyn SecretProvider>,
    /// Event sink.
    pub recorder: Arc<dyn EventRecorder>,
    /// Extra admission checks run once when a pod is added.
    pub admit_handlers: Vec<Arc<dyn PodAdmitHandler>>,
    /// Extra admission checks run on every sync.
    pub soft_admit_handlers: Vec<Arc<dyn PodAdmitHandler>>,
}

impl std::fmt::Debug for KubeletDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeletDeps")
            .field("runtime", &self.runtime.runtime_type())
            .field("admit_handlers", &self.admit_handlers.len())
            .field("soft_admit_handlers", &self.soft_admit_handlers.len())
            .finish_non_exhaustive()
    }
}

struct PodKillRequest {
    pod: Option<Arc<Pod>>,
    running_pod: RunningPod,
}

/// The node agent.
pub struct Kubelet {
    config: KubeletConfig,
    runtime: Arc<dyn ContainerRuntime>,
    volume_manager: Arc<dyn VolumeManager>,
    container_manager: Arc<dyn ContainerManager>,
    mirror_client: Arc<dyn MirrorClient>,
    recorder: Arc<dyn EventRecorder>,
    pod_manager: Arc<PodManager>,
    status_manager: Arc<StatusManager>,
    pod_cache: Arc<PodCache>,
    runtime_state: Arc<RuntimeState>,
    reason_cache: Arc<ReasonCache>,
    backoff: Arc<Backoff>,
    work_queue: Arc<WorkQueue>,
    metrics: Arc<Metrics>,
    pleg: Arc<GenericPleg>,
    syncer: Arc<KubeletPodSyncer>,
    pod_workers: Arc<PodWorkers>,
    admit_handlers: AdmitHandlers,
    sync_loop_handlers: Vec<Arc<dyn PodSyncLoopHandler>>,
    sources_ready: Arc<SourcesReady>,
    sync_loop_health: Arc<SyncLoopHealth>,
    pod_dirs: PodDirs,
    pod_killer_tx: mpsc::Sender<PodKillRequest>,
    pod_killer_rx: Mutex<Option<mpsc::Receiver<PodKillRequest>>>,
    pods_being_killed: Arc<Mutex<HashSet<PodUid>>>,
}

impl std::fmt::Debug for Kubelet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kubelet")
            .field("node_name", &self.config.node_name)
            .field("pods", &self.pod_manager.len())
            .field("workers", &self.pod_workers.len())
            .finish_non_exhaustive()
    }
}

impl Kubelet {
    /// Build every component from `config` and the external collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`KubeletError::UnsupportedRuntime`] when the runtime does not
    /// match the configured runtime type, and any validation or metrics
    /// registration error.
    pub fn new(config: KubeletConfig, deps: KubeletDeps) -> Result<Self> {
        config.validate()?;
        if deps.runtime.runtime_type() != config.runtime_type {
            return Err(KubeletError::UnsupportedRuntime(format!(
                "configured runtime type {} but the runtime reports {}",
                config.runtime_type,
                deps.runtime.runtime_type()
            )));
        }

        let metrics = Arc::new(Metrics::new()?);
        let pod_manager = Arc::new(PodManager::new());
        let status_manager = Arc::new(StatusManager::new(Arc::clone(&pod_manager)));
        let pod_cache = Arc::new(PodCache::new());
        let runtime_state = Arc::new(RuntimeState::new(MAX_WAIT_FOR_CONTAINER_RUNTIME));
        let reason_cache = Arc::new(ReasonCache::new(config.reason_cache_capacity));
        let backoff = Arc::new(Backoff::new(
            config.restart_backoff_initial,
            config.restart_backoff_max,
        ));
        let work_queue = Arc::new(WorkQueue::new());
        let pleg = Arc::new(GenericPleg::new(
            Arc::clone(&deps.runtime),
            Arc::clone(&pod_cache),
            config.pleg_relist_period,
            config.pleg_channel_capacity,
        ));

        let deadline = Arc::new(ActiveDeadlineHandler::new(Arc::clone(&status_manager)));
        let sync_loop_handlers = vec![Arc::clone(&deadline) as Arc<dyn PodSyncLoopHandler>];
        let sync_handlers = vec![deadline as Arc<dyn PodSyncHandler>];

        let mut admit_handlers = AdmitHandlers::new();
        admit_handlers.add_handler(Arc::new(ResourceFitAdmitHandler::new(
            config.allocatable.clone(),
        )));
        for handler in deps.admit_handlers {
            admit_handlers.add_handler(handler);
        }
        let mut soft_admit_handlers = AdmitHandlers::new();
        soft_admit_handlers.add_handler(Arc::new(NoNewPrivsAdmitHandler::new(
            config.no_new_privs_supported,
        )));
        for handler in deps.soft_admit_handlers {
            soft_admit_handlers.add_handler(handler);
        }

        let pod_dirs = PodDirs::new(&config.root_dir);
        let syncer = Arc::new(KubeletPodSyncer::new(
            config.node_ip.clone(),
            SyncerDeps {
                runtime: Arc::clone(&deps.runtime),
                runtime_state: Arc::clone(&runtime_state),
                volume_manager: Arc::clone(&deps.volume_manager),
                container_manager: Arc::clone(&deps.container_manager),
                mirror_client: Arc::clone(&deps.mirror_client),
                secrets: deps.secrets,
                recorder: Arc::clone(&deps.recorder),
                pod_manager: Arc::clone(&pod_manager),
                status_manager: Arc::clone(&status_manager),
                reason_cache: Arc::clone(&reason_cache),
                backoff: Arc::clone(&backoff),
                metrics: Arc::clone(&metrics),
            },
            soft_admit_handlers,
            sync_handlers,
            pod_dirs.clone(),
        ));

        let pod_workers = Arc::new(PodWorkers::new(
            Arc::clone(&syncer) as Arc<dyn PodSyncer>,
            Arc::clone(&deps.runtime),
            Arc::clone(&pod_cache),
            Arc::clone(&work_queue),
            Arc::clone(&deps.recorder),
            Arc::clone(&metrics),
            PodWorkersConfig {
                resync_interval: config.sync_frequency,
                backoff_period: config.worker_error_backoff,
            },
        ));

        let (pod_killer_tx, pod_killer_rx) = mpsc::channel(POD_KILLER_CAPACITY);
        let sources_ready = Arc::new(SourcesReady::new(config.config_sources.iter().cloned()));
        let sync_loop_health = Arc::new(SyncLoopHealth::new(config.sync_loop_period));

        Ok(Self {
            config,
            runtime: deps.runtime,
            volume_manager: deps.volume_manager,
            container_manager: deps.container_manager,
            mirror_client: deps.mirror_client,
            recorder: deps.recorder,
            pod_manager,
            status_manager,
            pod_cache,
            runtime_state,
            reason_cache,
            backoff,
            work_queue,
            metrics,
            pleg,
            syncer,
            pod_workers,
            admit_handlers,
            sync_loop_handlers,
            sources_ready,
            sync_loop_health,
            pod_dirs,
            pod_killer_tx,
            pod_killer_rx: Mutex::new(Some(pod_killer_rx)),
            pods_being_killed: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &KubeletConfig {
        &self.config
    }

    /// Desired pods.
    #[must_use]
    pub fn pod_manager(&self) -> &Arc<PodManager> {
        &self.pod_manager
    }

    /// Pod statuses.
    #[must_use]
    pub fn status_manager(&self) -> &Arc<StatusManager> {
        &self.status_manager
    }

    /// Runtime status cache.
    #[must_use]
    pub fn pod_cache(&self) -> &Arc<PodCache> {
        &self.pod_cache
    }

    /// Runtime and network health.
    #[must_use]
    pub fn runtime_state(&self) -> &Arc<RuntimeState> {
        &self.runtime_state
    }

    /// Container failure reasons.
    #[must_use]
    pub fn reason_cache(&self) -> &Arc<ReasonCache> {
        &self.reason_cache
    }

    /// Metrics of this node agent.
    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// The sync transaction script.
    #[must_use]
    pub fn syncer(&self) -> &Arc<KubeletPodSyncer> {
        &self.syncer
    }

    /// Per-pod workers.
    #[must_use]
    pub fn pod_workers(&self) -> &Arc<PodWorkers> {
        &self.pod_workers
    }

    /// Periodic sync queue.
    #[must_use]
    pub fn work_queue(&self) -> &Arc<WorkQueue> {
        &self.work_queue
    }

    /// Source readiness.
    #[must_use]
    pub fn sources_ready_tracker(&self) -> &Arc<SourcesReady> {
        &self.sources_ready
    }

    /// Pod lifecycle event generator.
    #[must_use]
    pub fn pleg(&self) -> &Arc<GenericPleg> {
        &self.pleg
    }

    /// Fails if the sync loop stopped iterating.
    ///
    /// # Errors
    ///
    /// Returns a description of how long the loop has been stuck.
    pub fn sync_loop_healthy(&self, now: tokio::time::Instant) -> std::result::Result<(), String> {
        self.sync_loop_health.healthy(now)
    }

    /// Desired pods that have not terminated.
    #[must_use]
    pub fn get_active_pods(&self) -> Vec<Arc<Pod>> {
        self.syncer.active_pods()
    }

    fn is_pod_terminated(&self, pod: &Pod) -> bool {
        self.syncer.is_pod_terminated(pod)
    }

    async fn reject_pod(&self, pod: &Pod, reason: &str, message: &str) {
        warn!(pod = %pod::pod_full_name(pod), reason, details = %message, "Pod rejected by admission");
        self.recorder
            .pod_event(pod, EventType::Warning, reason, message)
            .await;
        self.metrics
            .admission_rejections
            .with_label_values(&[reason])
            .inc();
        self.status_manager.set_pod_status(
            pod,
            PodStatus {
                phase: Some(PodPhase::Failed.as_str().to_string()),
                reason: Some(reason.to_string()),
                message: Some(format!("Pod {message}")),
                ..Default::default()
            },
        );
    }

    fn dispatch_work(&self, pod: Arc<Pod>, update_type: SyncPodType, mirror_pod: Option<Arc<Pod>>) {
        // A deleted pod that never got containers still goes to its worker,
        // which kills it before any further setup.
        if self.syncer.has_terminal_phase(&pod) {
            if pod::is_deletion_requested(&pod) {
                self.status_manager.terminate_pod(&pod);
            }
            return;
        }
        self.pod_workers
            .update_pod(UpdatePodOptions::new(pod, mirror_pod, update_type));
    }

    fn handle_mirror_pod(&self, mirror: &Arc<Pod>) {
        // A mirror pod change is a change of its static pod.
        if let Some(static_pod) = self.pod_manager.get_pod_by_mirror_pod(mirror) {
            self.dispatch_work(static_pod, SyncPodType::Update, Some(Arc::clone(mirror)));
        }
    }

    async fn delete_pod(&self, pod: &Pod) {
        let Ok(uid) = pod::pod_uid(pod) else {
            return;
        };
        if !self.sources_ready.all_ready() {
            info!(pod = %pod::pod_full_name(pod), "Skipping deletion of pod while sources are not ready");
            return;
        }
        if self.pod_workers.has_worker(&uid) {
            // The kill queues behind any sync in flight; the worker is
            // forgotten once it has run.
            let mut options = UpdatePodOptions::new(Arc::new(pod.clone()), None, SyncPodType::Kill);
            options.kill_pod_options = Some(KillPodOptions::default());
            let workers = Arc::clone(&self.pod_workers);
            let forget = uid.clone();
            options.on_complete = Some(Box::new(move |err: Option<&KubeletError>| {
                if let Some(e) = err {
                    warn!(pod_uid = %forget, error = %e, "Failed to kill removed pod, leaving it to housekeeping");
                }
                workers.forget_worker(&forget);
            }));
            self.pod_workers.update_pod(options);
            return;
        }

        let Some((status, _)) = self.pod_cache.get(&uid) else {
            debug!(pod_uid = %uid, "Removed pod has no runtime state");
            return;
        };
        let running_pod = status.to_running_pod();
        if running_pod.is_empty() {
            return;
        }
        let request = PodKillRequest {
            pod: Some(Arc::new(pod.clone())),
            running_pod,
        };
        if let Err(e) = self.pod_killer_tx.send(request).await {
            error!(pod_uid = %uid, error = %e, "Pod killer is not running");
        }
    }

    /// Spawn the task that kills pods removed from their source or found
    /// running without being desired.
    ///
    /// # Errors
    ///
    /// Returns [`KubeletError::Config`] if the pod killer was already started.
    pub fn start_pod_killer(&self) -> Result<JoinHandle<()>> {
        let mut requests = self
            .pod_killer_rx
            .lock()
            .take()
            .ok_or_else(|| KubeletError::Config("pod killer already started".into()))?;
        let syncer = Arc::clone(&self.syncer);
        let in_flight = Arc::clone(&self.pods_being_killed);
        Ok(tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let uid = request.running_pod.id.clone();
                if !in_flight.lock().insert(uid.clone()) {
                    debug!(pod_uid = %uid, "Pod is already being killed");
                    continue;
                }
                let syncer = Arc::clone(&syncer);
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    info!(pod = %pod::build_pod_full_name(&request.running_pod.name, &request.running_pod.namespace), "Killing unwanted pod");
                    if let Err(e) = syncer
                        .kill_pod(request.pod.as_deref(), &request.running_pod, None)
                        .await
                    {
                        error!(pod_uid = %uid, error = %e, "Failed killing the pod");
                    }
                    in_flight.lock().remove(&uid);
                });
            }
        }))
    }

    /// Kill a pod through its worker and wait for the kill to finish.
    ///
    /// The wait is bounded by one and a half times the grace period, and at
    /// least [`MIN_KILL_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`KubeletError::KillPod`] if the kill failed and
    /// [`KubeletError::Timeout`] if it did not finish in time.
    pub async fn kill_pod_now(
        &self,
        pod: Arc<Pod>,
        status_fn: PodStatusFn,
        grace_period_override: Option<i64>,
    ) -> Result<()> {
        let grace = grace_period_override
            .or_else(|| pod.spec.as_ref().and_then(|s| s.termination_grace_period_seconds))
            .unwrap_or(0)
            .max(0);
        let seconds = u64::try_from(grace + grace / 2).unwrap_or(0);
        let timeout = Duration::from_secs(seconds).max(MIN_KILL_TIMEOUT);

        let (tx, rx) = oneshot::channel();
        let mirror = self.pod_manager.get_mirror_pod_by_pod(&pod);
        let full_name = pod::pod_full_name(&pod);
        let mut options = UpdatePodOptions::new(pod, mirror, SyncPodType::Kill);
        options.kill_pod_options = Some(KillPodOptions {
            pod_status_fn: Some(status_fn),
            pod_termination_grace_period_seconds_override: grace_period_override,
        });
        options.on_complete = Some(Box::new(move |err: Option<&KubeletError>| {
            let _ = tx.send(err.map(ToString::to_string));
        }));
        self.pod_workers.update_pod(options);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(None)) => Ok(()),
            Ok(Ok(Some(message))) => Err(KubeletError::KillPod(message)),
            Ok(Err(_)) => Err(KubeletError::KillPod(format!(
                "worker for pod {full_name} dropped the kill request"
            ))),
            Err(_) => Err(KubeletError::Timeout(format!(
                "timeout waiting to kill pod {full_name}"
            ))),
        }
    }

    /// Whether every resource of a terminated pod has been released.
    pub async fn pod_resources_are_reclaimed(&self, pod: &Pod) -> bool {
        if !self.is_pod_terminated(pod) {
            return false;
        }
        let Ok(uid) = pod::pod_uid(pod) else {
            return true;
        };
        if self
            .pod_cache
            .get(&uid)
            .is_some_and(|(status, _)| status.has_running_containers())
        {
            debug!(pod_uid = %uid, "Pod is terminated, but some containers are still running");
            return false;
        }
        if self.volume_manager.pod_volumes_exist(&uid).await {
            debug!(pod_uid = %uid, "Pod is terminated, but some volumes have not been cleaned up");
            return false;
        }
        if self.container_manager.pod_cgroup_exists(pod).await {
            debug!(pod_uid = %uid, "Pod is terminated, but pod cgroup sandbox has not been cleaned up");
            return false;
        }
        true
    }

    /// Spawn the container and image GC tickers.
    pub fn start_garbage_collection(
        &self,
        container_gc: Arc<dyn ContainerGc>,
        image_gc: Arc<dyn ImageGc>,
    ) -> Vec<JoinHandle<()>> {
        gc::start_garbage_collection(
            container_gc,
            image_gc,
            Arc::clone(&self.recorder),
            self.config.container_gc_period,
            self.config.image_gc_period,
        )
    }

    /// Start the eviction manager with this agent's pod callbacks.
    pub fn start_eviction_manager(
        self: &Arc<Self>,
        manager: &dyn EvictionManager,
        stats: Arc<dyn StatsProvider>,
    ) -> JoinHandle<()> {
        let active = Arc::clone(self);
        let cleaned = Arc::clone(self);
        let killer = Arc::clone(self);
        let callbacks = EvictionCallbacks {
            active_pods: Arc::new(move || active.get_active_pods()),
            pod_cleaned_up: Arc::new(move |pod: Arc<Pod>| {
                let kubelet = Arc::clone(&cleaned);
                async move { kubelet.pod_resources_are_reclaimed(&pod).await }.boxed()
            }),
            kill_pod: Arc::new(move |pod: Arc<Pod>, status_fn: PodStatusFn, grace: Option<i64>| {
                let kubelet = Arc::clone(&killer);
                async move { kubelet.kill_pod_now(pod, status_fn, grace).await }.boxed()
            }),
        };
        manager.start(stats, callbacks, self.config.eviction_monitoring_period)
    }

    /// Check the runtime status once and record runtime and network health.
    pub async fn update_runtime_up(&self) {
        let status = match self.runtime.status().await {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "Container runtime sanity check failed");
                return;
            }
        };

        match status.condition(NETWORK_READY) {
            Some(c) if c.status => self.runtime_state.set_network_state(None),
            Some(c) => self.runtime_state.set_network_state(Some(format!(
                "runtime network not ready: {}: {}",
                c.reason, c.message
            ))),
            None => self
                .runtime_state
                .set_network_state(Some("runtime network not ready: no NetworkReady condition".into())),
        }

        match status.condition(RUNTIME_READY) {
            Some(c) if c.status => {
                self.runtime_state.set_runtime_state(None);
                self.runtime_state.set_runtime_sync(tokio::time::Instant::now());
            }
            other => {
                let message = other.map_or_else(
                    || "no RuntimeReady condition".to_string(),
                    |c| format!("{}: {}", c.reason, c.message),
                );
                error!(reason = %message, "Container runtime not ready");
                self.runtime_state
                    .set_runtime_state(Some(format!("container runtime not ready: {message}")));
            }
        }
    }

    fn start_runtime_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let kubelet = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(kubelet.config.runtime_check_period);
            loop {
                ticker.tick().await;
                kubelet.update_runtime_up().await;
            }
        })
    }

    /// Start the background tasks and run the sync loop until `updates`
    /// closes.
    ///
    /// # Errors
    ///
    /// Returns [`KubeletError::Config`] if the agent was already run.
    pub async fn run(
        self: Arc<Self>,
        updates: mpsc::Receiver<PodUpdate>,
        liveness: mpsc::Receiver<LivenessUpdate>,
        status_sink: Arc<dyn StatusSink>,
    ) -> Result<()> {
        let pleg_events = self
            .pleg
            .watch()
            .ok_or_else(|| KubeletError::Config("PLEG events already consumed".into()))?;
        let tasks = vec![
            self.start_pod_killer()?,
            self.start_runtime_monitor(),
            self.status_manager.start(status_sink),
            self.pleg.start(),
        ];
        info!(node = %self.config.node_name, "Starting node agent");

        run_sync_loop(
            Arc::clone(&self) as Arc<dyn SyncLoopHandler>,
            SyncLoopInputs {
                config: updates,
                pleg: pleg_events,
                liveness,
            },
            SyncLoopConfig {
                sync_period: self.config.sync_loop_period,
                housekeeping_period: self.config.housekeeping_period,
                backoff_base: self.config.loop_backoff_base,
                backoff_max: self.config.loop_backoff_max,
            },
            Arc::clone(&self.sync_loop_health),
            Arc::clone(&self.metrics),
        )
        .await;

        for task in tasks {
            task.abort();
        }
        Ok(())
    }

    async fn cleanup_orphaned_pod_dirs(&self, keep: &HashSet<PodUid>) {
        let on_disk = match self.pod_dirs.list_pods().await {
            Ok(uids) => uids,
            Err(e) => {
                error!(error = %e, "Failed listing pod directories");
                return;
            }
        };
        for uid in on_disk.into_iter().filter(|uid| !keep.contains(uid)) {
            if self.volume_manager.pod_volumes_exist(&uid).await {
                debug!(pod_uid = %uid, "Orphaned pod found, but volumes are not cleaned up");
                continue;
            }
            if let Err(e) = self.pod_dirs.remove_pod_dir(&uid).await {
                error!(pod_uid = %uid, error = %e, "Failed removing orphaned pod directory");
            }
        }
    }

    async fn cleanup_orphaned_pod_cgroups(&self, cgroup_pods: Vec<PodUid>, active: &HashSet<PodUid>) {
        for uid in cgroup_pods.into_iter().filter(|uid| !active.contains(uid)) {
            if self.volume_manager.pod_volumes_exist(&uid).await {
                debug!(pod_uid = %uid, "Orphaned pod found, but volumes not yet removed. Reducing cpu to minimum");
                continue;
            }
            if let Err(e) = self.container_manager.destroy_pod_cgroup(&uid).await {
                warn!(pod_uid = %uid, error = %e, "Failed deleting orphaned pod cgroup");
            }
        }
    }

    async fn reconcile_mirror_pods(&self, active_pods: &[Arc<Pod>]) {
        for full_name in self.pod_manager.get_orphaned_mirror_pod_names() {
            let Some((name, namespace)) = full_name.split_once('_') else {
                continue;
            };
            info!(pod = %full_name, "Deleting orphaned mirror pod");
            if let Err(e) = self.mirror_client.delete_mirror_pod(name, namespace, None).await {
                error!(pod = %full_name, error = %e, "Failed deleting orphaned mirror pod");
            }
        }
        for pod in active_pods.iter().filter(|p| pod::is_static_pod(p)) {
            if self.pod_manager.get_mirror_pod_by_pod(pod).is_none() {
                if let Err(e) = self.mirror_client.create_mirror_pod(pod).await {
                    error!(pod = %pod::pod_full_name(pod), error = %e, "Failed creating missing mirror pod");
                }
            }
        }
    }
}

#[async_trait]
impl SyncLoopHandler for Kubelet {
    async fn handle_pod_additions(&self, mut pods: Vec<Arc<Pod>>) {
        pods.sort_by(|a, b| {
            let created = |p: &Pod| p.metadata.creation_timestamp.as_ref().map(|t| t.0);
            created(a).cmp(&created(b))
        });
        for pod in pods {
            self.pod_manager.add_pod(Arc::clone(&pod));
            if pod::is_mirror_pod(&pod) {
                self.handle_mirror_pod(&pod);
                continue;
            }

            if !self.is_pod_terminated(&pod) {
                let candidate = pod.metadata.uid.as_deref();
                let others: Vec<Arc<Pod>> = self
                    .get_active_pods()
                    .into_iter()
                    .filter(|p| p.metadata.uid.as_deref() != candidate)
                    .collect();
                let verdict = self.admit_handlers.admit(&PodAdmitAttributes {
                    pod: &pod,
                    other_pods: &others,
                });
                if !verdict.admit {
                    self.reject_pod(&pod, &verdict.reason, &verdict.message).await;
                    continue;
                }
            }
            let mirror = self.pod_manager.get_mirror_pod_by_pod(&pod);
            self.dispatch_work(pod, SyncPodType::Create, mirror);
        }
    }

    async fn handle_pod_updates(&self, pods: Vec<Arc<Pod>>) {
        for pod in pods {
            self.pod_manager.update_pod(Arc::clone(&pod));
            if pod::is_mirror_pod(&pod) {
                self.handle_mirror_pod(&pod);
                continue;
            }
            let mirror = self.pod_manager.get_mirror_pod_by_pod(&pod);
            self.dispatch_work(pod, SyncPodType::Update, mirror);
        }
    }

    async fn handle_pod_removes(&self, pods: Vec<Arc<Pod>>) {
        for pod in pods {
            self.pod_manager.delete_pod(&pod);
            if pod::is_mirror_pod(&pod) {
                self.handle_mirror_pod(&pod);
                continue;
            }
            self.delete_pod(&pod).await;
        }
    }

    async fn handle_pod_reconcile(&self, pods: Vec<Arc<Pod>>) {
        for pod in pods {
            self.pod_manager.update_pod(pod);
        }
    }

    async fn handle_pod_syncs(&self, pods: Vec<Arc<Pod>>) {
        for pod in pods {
            let mirror = self.pod_manager.get_mirror_pod_by_pod(&pod);
            self.dispatch_work(pod, SyncPodType::Sync, mirror);
        }
    }

    async fn handle_pod_cleanups(&self) -> Result<()> {
        let cgroup_pods = match self.container_manager.pod_cgroups().await {
            Ok(uids) => uids,
            Err(e) => {
                warn!(error = %e, "Failed listing pod cgroups");
                Vec::new()
            }
        };

        let (all_pods, mirror_pods) = self.pod_manager.get_pods_and_mirror_pods();
        let active_pods = self.get_active_pods();
        let desired: HashSet<PodUid> = active_pods
            .iter()
            .filter_map(|p| pod::pod_uid(p).ok())
            .collect();
        self.pod_workers.forget_non_existing_pod_workers(&desired);

        let running_pods = self.runtime.get_pods(false).await?;
        for running_pod in running_pods {
            if desired.contains(&running_pod.id) || running_pod.is_empty() {
                continue;
            }
            let request = PodKillRequest {
                pod: None,
                running_pod,
            };
            if let Err(e) = self.pod_killer_tx.try_send(request) {
                warn!(error = %e, "Failed to queue unwanted pod for killing");
            }
        }

        let known: HashSet<PodUid> = all_pods
            .iter()
            .chain(mirror_pods.iter())
            .filter_map(|p| pod::pod_uid(p).ok())
            .collect();
        self.status_manager.remove_orphaned_statuses(&known);
        for uid in self.reason_cache.uids() {
            if !known.contains(&uid) {
                self.reason_cache.remove_pod(&uid);
            }
        }

        let all_runtime_pods = self.runtime.get_pods(true).await?;
        self.metrics.running_pod_count.set(
            i64::try_from(all_runtime_pods.iter().filter(|p| !p.is_empty()).count()).unwrap_or(i64::MAX),
        );
        let keep_dirs: HashSet<PodUid> = all_pods
            .iter()
            .filter_map(|p| pod::pod_uid(p).ok())
            .chain(all_runtime_pods.into_iter().map(|p| p.id))
            .collect();
        self.cleanup_orphaned_pod_dirs(&keep_dirs).await;

        self.reconcile_mirror_pods(&active_pods).await;
        self.cleanup_orphaned_pod_cgroups(cgroup_pods, &desired).await;
        self.backoff.gc();
        Ok(())
    }

    fn mark_source_seen(&self, source: &str) {
        self.sources_ready.add_source(source);
    }

    fn sources_ready(&self) -> bool {
        self.sources_ready.all_ready()
    }

    fn runtime_errors(&self) -> Vec<String> {
        self.runtime_state.runtime_errors()
    }

    fn get_pod_by_uid(&self, uid: &PodUid) -> Option<Arc<Pod>> {
        self.pod_manager.get_pod_by_uid(uid)
    }

    fn get_pods_to_sync(&self) -> Vec<Arc<Pod>> {
        let ready: HashSet<PodUid> = self.work_queue.get_work().into_iter().collect();
        self.pod_manager
            .get_pods()
            .into_iter()
            .filter(|pod| {
                pod::pod_uid(pod).is_ok_and(|uid| ready.contains(&uid))
                    || self.sync_loop_handlers.iter().any(|h| h.should_sync(pod))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::PodAdmitResult;
    use crate::runtime::ContainerState;
    use crate::testing::{self, FakeEvictionManager, FakeGc, FakeStatsProvider, TestHarness};

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn runtime_type_mismatch_is_fatal() {
        let harness = TestHarness::new();
        let mut config = harness.kubelet.config().clone();
        config.runtime_type = "docker".into();
        let err = Kubelet::new(config, harness.deps()).unwrap_err();
        assert!(err.is_process_fatal());
    }

    #[tokio::test]
    async fn runtime_up_tracks_conditions() {
        let harness = TestHarness::new();
        harness.kubelet.update_runtime_up().await;
        assert!(harness.runtime_state.runtime_errors().is_empty());
        assert!(harness.runtime_state.network_errors().is_empty());

        harness.runtime.set_network_ready(false);
        harness.kubelet.update_runtime_up().await;
        assert_eq!(harness.runtime_state.network_errors().len(), 1);

        harness.runtime.set_runtime_ready(false);
        harness.kubelet.update_runtime_up().await;
        assert!(!harness.runtime_state.runtime_errors().is_empty());
    }

    #[tokio::test]
    async fn removal_waits_for_sources() {
        let harness = TestHarness::new();
        let pod = testing::pod("uid-1", "web");
        let uid = PodUid::new("uid-1").unwrap();
        harness.runtime.set_container(&uid, "app", ContainerState::Running);
        let status = harness.runtime_status(&pod).await;
        harness
            .kubelet
            .pod_cache()
            .set(uid.clone(), status, None, tokio::time::Instant::now());
        harness.kubelet.start_pod_killer().unwrap();

        harness.kubelet.handle_pod_removes(vec![Arc::clone(&pod)]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(harness.runtime.kill_calls(), 0);

        harness.kubelet.mark_source_seen("api");
        harness.kubelet.handle_pod_removes(vec![pod]).await;
        wait_for("pod killer", || harness.runtime.kill_calls() == 1).await;
    }

    #[tokio::test]
    async fn removal_kills_through_a_busy_worker() {
        let harness = TestHarness::new();
        harness.kubelet.mark_source_seen("api");
        let pod = testing::seen_pod("uid-1", "web");
        let uid = PodUid::new("uid-1").unwrap();

        harness
            .kubelet
            .handle_pod_additions(vec![Arc::clone(&pod)])
            .await;
        assert!(harness.kubelet.pod_workers().is_working(&uid));
        harness.kubelet.handle_pod_removes(vec![pod]).await;

        wait_for("worker forgotten", || !harness.kubelet.pod_workers().has_worker(&uid)).await;
        assert_eq!(harness.runtime.sync_calls(), 1);
        assert_eq!(harness.runtime.killed(), vec![uid]);
        assert_eq!(
            harness
                .metrics
                .pod_worker_duration
                .with_label_values(&["kill"])
                .get_sample_count(),
            1
        );
    }

    #[derive(Default)]
    struct RecordingAdmitHandler {
        seen: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl PodAdmitHandler for RecordingAdmitHandler {
        fn admit(&self, attrs: &PodAdmitAttributes<'_>) -> PodAdmitResult {
            let uid = |p: &Pod| p.metadata.uid.clone().unwrap_or_default();
            self.seen.lock().push((
                uid(attrs.pod),
                attrs.other_pods.iter().map(|p| uid(p)).collect(),
            ));
            PodAdmitResult::admitted()
        }
    }

    #[tokio::test]
    async fn admit_handlers_see_only_other_pods() {
        let harness = TestHarness::new();
        let recorder = Arc::new(RecordingAdmitHandler::default());
        let kubelet = Kubelet::new(
            harness.kubelet.config().clone(),
            KubeletDeps {
                admit_handlers: vec![Arc::clone(&recorder) as Arc<dyn PodAdmitHandler>],
                ..harness.deps()
            },
        )
        .unwrap();

        kubelet
            .handle_pod_additions(vec![testing::pod("uid-1", "web")])
            .await;
        kubelet
            .handle_pod_additions(vec![testing::pod("uid-2", "db")])
            .await;

        assert_eq!(
            *recorder.seen.lock(),
            vec![
                ("uid-1".to_string(), Vec::new()),
                ("uid-2".to_string(), vec!["uid-1".to_string()]),
            ]
        );
    }

    #[tokio::test]
    async fn cleanups_kill_unwanted_pods_and_remove_orphans() {
        let harness = TestHarness::new();
        harness.kubelet.start_pod_killer().unwrap();

        let live = PodUid::new("live").unwrap();
        harness.kubelet.pod_manager().add_pod(testing::pod("live", "web"));
        harness.runtime.set_container(&live, "app", ContainerState::Running);
        harness.kubelet.pod_dirs.make_pod_data_dirs(&live).await.unwrap();

        let stray = PodUid::new("stray").unwrap();
        harness.runtime.set_container(&stray, "app", ContainerState::Running);

        let gone = PodUid::new("gone").unwrap();
        harness.container_manager.add_cgroup(&gone);
        harness.kubelet.pod_dirs.make_pod_data_dirs(&gone).await.unwrap();

        harness.kubelet.handle_pod_cleanups().await.unwrap();

        wait_for("stray pod kill", || harness.runtime.kill_calls() == 1).await;
        assert_eq!(harness.runtime.killed(), vec![stray]);
        assert!(!harness.kubelet.pod_dirs.pod_dir(&gone).exists());
        assert!(harness.kubelet.pod_dirs.pod_dir(&live).exists());
        assert_eq!(harness.container_manager.destroyed(), vec![gone]);
        assert_eq!(harness.kubelet.metrics().running_pod_count.get(), 2);
    }

    #[tokio::test]
    async fn kill_pod_now_waits_for_the_worker() {
        let harness = TestHarness::new();
        let pod = testing::pod("uid-1", "web");
        harness.kubelet.pod_manager().add_pod(Arc::clone(&pod));

        let status_fn: PodStatusFn = Arc::new(|status: &mut PodStatus| {
            status.phase = Some("Failed".into());
            status.reason = Some("Evicted".into());
        });
        harness
            .kubelet
            .kill_pod_now(Arc::clone(&pod), status_fn, Some(0))
            .await
            .unwrap();
        assert_eq!(harness.runtime.kill_calls(), 1);

        harness.runtime.fail_kills(true);
        let err = harness
            .kubelet
            .kill_pod_now(pod, Arc::new(|_: &mut PodStatus| {}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, KubeletError::KillPod(_)));
    }

    #[tokio::test]
    async fn eviction_manager_gets_working_callbacks() {
        let harness = TestHarness::new();
        let kubelet = Arc::clone(&harness.kubelet);
        let pod = testing::pod("uid-1", "web");
        kubelet.pod_manager().add_pod(Arc::clone(&pod));

        let manager = FakeEvictionManager::default();
        kubelet
            .start_eviction_manager(&manager, Arc::new(FakeStatsProvider::default()))
            .await
            .unwrap();
        let callbacks = manager.callbacks().unwrap();
        assert_eq!((callbacks.active_pods)().len(), 1);
        assert!(!(callbacks.pod_cleaned_up)(Arc::clone(&pod)).await);

        (callbacks.kill_pod)(pod, Arc::new(|_: &mut PodStatus| {}), Some(0))
            .await
            .unwrap();
        assert_eq!(harness.runtime.kill_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_collection_uses_configured_periods() {
        let harness = TestHarness::new();
        let container_gc = Arc::new(FakeGc::default());
        let image_gc = Arc::new(FakeGc::default());
        let handles = harness.kubelet.start_garbage_collection(
            Arc::clone(&container_gc) as Arc<dyn ContainerGc>,
            Arc::clone(&image_gc) as Arc<dyn ImageGc>,
        );
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(container_gc.calls(), 5);
        assert_eq!(image_gc.calls(), 1);
        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn deadline_passed_pods_are_synced_on_tick() {
        let harness = TestHarness::new();
        let mut pod = (*testing::pod("uid-1", "job")).clone();
        pod.spec.as_mut().unwrap().active_deadline_seconds = Some(1);
        pod.status = Some(PodStatus {
            start_time: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now() - chrono::Duration::seconds(30),
            )),
            ..Default::default()
        });
        harness.kubelet.pod_manager().add_pod(Arc::new(pod));
        harness.kubelet.pod_manager().add_pod(testing::pod("uid-2", "web"));

        let due = harness.kubelet.get_pods_to_sync();
        assert_eq!(due.len(), 1);
        assert_eq!(pod::pod_name(&due[0]), "job");
    }
}
