//! In-memory fakes of every collaborator, for tests.
//!
//! Enabled for this crate's own tests and, through the `test-utils` feature,
//! for downstream crates.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Container, Pod, PodSpec, PodStatus, ResourceRequirements, Secret,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use nodelet_core::{ContainerId, PodUid};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::admission::{PodAdmitAttributes, PodAdmitHandler, PodAdmitResult};
use crate::backoff::Backoff;
use crate::collaborators::{ContainerManager, MirrorClient, SecretProvider, VolumeManager};
use crate::error::{KubeletError, Result};
use crate::events::{EventRecorder, EventType};
use crate::eviction::{EvictionCallbacks, EvictionManager, NodeStats, StatsProvider};
use crate::gc::{ContainerGc, ImageGc};
use crate::kubelet::{Kubelet, KubeletDeps};
use crate::metrics::Metrics;
use crate::pod::{self, CONFIG_SEEN_ANNOTATION, CONFIG_SOURCE_ANNOTATION, FILE_SOURCE};
use crate::pod_manager::PodManager;
use crate::pod_workers::PodSyncer;
use crate::reason_cache::ReasonCache;
use crate::runtime::{
    ContainerRuntime, ContainerState, PodSyncResult, RunningPod, RuntimeContainer,
    RuntimeContainerStatus, RuntimePodStatus, RuntimeStatus, SyncAction, SyncError, SyncResult,
    NETWORK_READY, RUNTIME_READY,
};
use crate::runtime_state::RuntimeState;
use crate::status_manager::{StatusManager, StatusSink};
use crate::sync_pod::KubeletPodSyncer;
use crate::types::{KubeletConfig, SyncPodOptions, SyncPodType};

/// Install a test subscriber honouring `RUST_LOG`.
#[cfg(test)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A pod in the `default` namespace with one container named `app`.
#[must_use]
pub fn pod(uid: &str, name: &str) -> Arc<Pod> {
    Arc::new(Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(uid.to_string()),
            creation_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                Utc::now(),
            )),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some("nginx:1.27".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    })
}

fn with_annotations(pod: &Pod, annotations: &[(&str, String)]) -> Arc<Pod> {
    let mut pod = pod.clone();
    let map = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
    for (key, value) in annotations {
        map.insert((*key).to_string(), value.clone());
    }
    Arc::new(pod)
}

/// [`pod`] with an API source annotation and a first-seen time.
#[must_use]
pub fn seen_pod(uid: &str, name: &str) -> Arc<Pod> {
    let seen = (Utc::now() - chrono::Duration::seconds(2)).to_rfc3339();
    with_annotations(
        &pod(uid, name),
        &[
            (CONFIG_SOURCE_ANNOTATION, pod::API_SERVER_SOURCE.to_string()),
            (CONFIG_SEEN_ANNOTATION, seen),
        ],
    )
}

/// [`pod`] read from a manifest file.
#[must_use]
pub fn static_pod(uid: &str, name: &str) -> Arc<Pod> {
    with_annotations(
        &pod(uid, name),
        &[(CONFIG_SOURCE_ANNOTATION, FILE_SOURCE.to_string())],
    )
}

/// [`seen_pod`] whose container requests `count` of `resource`.
#[must_use]
pub fn pod_requesting(uid: &str, name: &str, resource: &str, count: &str) -> Arc<Pod> {
    let mut pod = (*seen_pod(uid, name)).clone();
    if let Some(container) = pod.spec.as_mut().and_then(|s| s.containers.first_mut()) {
        container.resources = Some(ResourceRequirements {
            requests: Some(BTreeMap::from([(
                resource.to_string(),
                Quantity(count.to_string()),
            )])),
            limits: Some(BTreeMap::from([(
                resource.to_string(),
                Quantity(count.to_string()),
            )])),
            ..Default::default()
        });
    }
    Arc::new(pod)
}

/// Options for one direct call of the sync transaction script.
#[must_use]
pub fn sync_options(pod: &Arc<Pod>, status: RuntimePodStatus, update_type: SyncPodType) -> SyncPodOptions {
    SyncPodOptions {
        pod: Arc::clone(pod),
        mirror_pod: None,
        pod_status: Arc::new(status),
        update_type,
        kill_pod_options: None,
    }
}

struct FakePod {
    name: String,
    namespace: String,
    containers: Vec<RuntimeContainerStatus>,
}

struct FakeRuntimeState {
    pods: HashMap<PodUid, FakePod>,
    status: RuntimeStatus,
    crash_looping: HashSet<String>,
    fail_kills: bool,
    sync_calls: usize,
    started: usize,
    killed: Vec<PodUid>,
    last_grace_override: Option<Option<i64>>,
}

impl Default for FakeRuntimeState {
    fn default() -> Self {
        Self {
            pods: HashMap::new(),
            status: RuntimeStatus::healthy(),
            crash_looping: HashSet::new(),
            fail_kills: false,
            sync_calls: 0,
            started: 0,
            killed: Vec::new(),
            last_grace_override: None,
        }
    }
}

fn fake_container(uid: &PodUid, name: &str, state: ContainerState) -> RuntimeContainerStatus {
    let now = Utc::now();
    RuntimeContainerStatus {
        id: ContainerId::new("fake", format!("{uid}-{name}")),
        name: name.to_string(),
        state,
        created_at: Some(now),
        started_at: Some(now),
        finished_at: (state == ContainerState::Exited).then_some(now),
        exit_code: 0,
        image: "nginx:1.27".to_string(),
        image_id: "sha256:fake".to_string(),
        restart_count: 0,
        reason: None,
        message: None,
    }
}

/// An in-memory container runtime.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeRuntimeState>,
}

impl FakeRuntime {
    /// Create or update a container of a pod.
    pub fn set_container(&self, uid: &PodUid, name: &str, state: ContainerState) {
        let mut guard = self.state.lock();
        let pod = guard.pods.entry(uid.clone()).or_insert_with(|| FakePod {
            name: uid.to_string(),
            namespace: "default".to_string(),
            containers: Vec::new(),
        });
        match pod.containers.iter_mut().find(|c| c.name == name) {
            Some(container) => {
                container.state = state;
                if state == ContainerState::Exited {
                    container.finished_at = Some(Utc::now());
                }
            }
            None => pod.containers.push(fake_container(uid, name, state)),
        }
    }

    /// Forget a pod entirely.
    pub fn remove_pod(&self, uid: &PodUid) {
        self.state.lock().pods.remove(uid);
    }

    /// Make `container` fail to start with a crash-loop backoff.
    pub fn crash_loop(&self, container: &str) {
        self.state.lock().crash_looping.insert(container.to_string());
    }

    /// Make kills fail.
    pub fn fail_kills(&self, fail: bool) {
        self.state.lock().fail_kills = fail;
    }

    fn set_condition(&self, type_: &str, ready: bool) {
        let mut state = self.state.lock();
        if let Some(c) = state.status.conditions.iter_mut().find(|c| c.type_ == type_) {
            c.status = ready;
            c.reason = if ready { String::new() } else { format!("{type_}False") };
        }
    }

    /// Set the `RuntimeReady` condition.
    pub fn set_runtime_ready(&self, ready: bool) {
        self.set_condition(RUNTIME_READY, ready);
    }

    /// Set the `NetworkReady` condition.
    pub fn set_network_ready(&self, ready: bool) {
        self.set_condition(NETWORK_READY, ready);
    }

    /// Number of `sync_pod` calls.
    #[must_use]
    pub fn sync_calls(&self) -> usize {
        self.state.lock().sync_calls
    }

    /// Number of containers started.
    #[must_use]
    pub fn started_containers(&self) -> usize {
        self.state.lock().started
    }

    /// Number of `kill_pod` calls.
    #[must_use]
    pub fn kill_calls(&self) -> usize {
        self.state.lock().killed.len()
    }

    /// Pods passed to `kill_pod`, in order.
    #[must_use]
    pub fn killed(&self) -> Vec<PodUid> {
        self.state.lock().killed.clone()
    }

    /// Grace period override of the last kill.
    #[must_use]
    pub fn last_grace_override(&self) -> Option<Option<i64>> {
        self.state.lock().last_grace_override
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn runtime_type(&self) -> &str {
        "remote"
    }

    async fn status(&self) -> Result<RuntimeStatus> {
        Ok(self.state.lock().status.clone())
    }

    async fn get_pods(&self, all: bool) -> Result<Vec<RunningPod>> {
        let state = self.state.lock();
        let pods = state
            .pods
            .iter()
            .map(|(uid, pod)| RunningPod {
                id: uid.clone(),
                name: pod.name.clone(),
                namespace: pod.namespace.clone(),
                containers: pod
                    .containers
                    .iter()
                    .filter(|c| all || c.state == ContainerState::Running)
                    .map(|c| RuntimeContainer {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        image: c.image.clone(),
                        state: c.state,
                    })
                    .collect(),
            })
            .filter(|p| all || !p.is_empty())
            .collect();
        Ok(pods)
    }

    async fn get_pod_status(&self, uid: &PodUid, name: &str, namespace: &str) -> Result<RuntimePodStatus> {
        let state = self.state.lock();
        let Some(pod) = state.pods.get(uid) else {
            return Ok(RuntimePodStatus::empty(uid.clone(), name, namespace));
        };
        Ok(RuntimePodStatus {
            id: uid.clone(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            ips: vec!["10.88.0.7".to_string()],
            container_statuses: pod.containers.clone(),
        })
    }

    async fn sync_pod(
        &self,
        pod: &Pod,
        status: &RuntimePodStatus,
        _pull_secrets: &[Secret],
        _backoff: &Backoff,
    ) -> PodSyncResult {
        let mut result = PodSyncResult::default();
        let mut state = self.state.lock();
        state.sync_calls += 1;
        for container in pod::containers(pod) {
            if state.crash_looping.contains(&container.name) {
                result.add(SyncResult::failed(
                    SyncAction::StartContainer,
                    &container.name,
                    SyncError::CrashLoopBackOff,
                    format!("back-off restarting failed container {}", container.name),
                ));
                continue;
            }
            let running = status
                .find_container_status(&container.name)
                .is_some_and(|c| c.state == ContainerState::Running);
            if running {
                continue;
            }
            let entry = state.pods.entry(status.id.clone()).or_insert_with(|| FakePod {
                name: status.name.clone(),
                namespace: status.namespace.clone(),
                containers: Vec::new(),
            });
            entry.containers.retain(|c| c.name != container.name);
            entry
                .containers
                .push(fake_container(&status.id, &container.name, ContainerState::Running));
            state.started += 1;
            result.add(SyncResult::ok(SyncAction::StartContainer, &container.name));
        }
        result
    }

    async fn kill_pod(
        &self,
        _pod: Option<&Pod>,
        running_pod: &RunningPod,
        grace_period_override: Option<i64>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.killed.push(running_pod.id.clone());
        state.last_grace_override = Some(grace_period_override);
        if state.fail_kills {
            return Err(KubeletError::Runtime("kill failed".into()));
        }
        if let Some(pod) = state.pods.get_mut(&running_pod.id) {
            for container in &mut pod.containers {
                if container.state == ContainerState::Running {
                    container.state = ContainerState::Exited;
                    container.finished_at = Some(Utc::now());
                }
            }
        }
        Ok(())
    }
}

/// Records every status pushed to the API server.
#[derive(Default)]
pub struct FakeStatusSink {
    updates: Mutex<Vec<(String, PodStatus)>>,
}

impl FakeStatusSink {
    /// Pushed statuses as `(pod full name, status)`.
    #[must_use]
    pub fn updates(&self) -> Vec<(String, PodStatus)> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl StatusSink for FakeStatusSink {
    async fn patch_pod_status(&self, pod: &Pod, status: &PodStatus) -> Result<()> {
        self.updates
            .lock()
            .push((pod::pod_full_name(pod), status.clone()));
        Ok(())
    }
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Pod full name, or `None` for node events.
    pub object: Option<String>,
    /// Event type.
    pub event_type: EventType,
    /// Reason.
    pub reason: String,
    /// Message.
    pub message: String,
}

/// Keeps every recorded event in memory.
#[derive(Default)]
pub struct FakeEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl FakeEventRecorder {
    /// Every recorded event.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Whether an event with `reason` was recorded.
    #[must_use]
    pub fn has_reason(&self, reason: &str) -> bool {
        self.events.lock().iter().any(|e| e.reason == reason)
    }
}

#[async_trait]
impl EventRecorder for FakeEventRecorder {
    async fn pod_event(&self, pod: &Pod, event_type: EventType, reason: &str, message: &str) {
        self.events.lock().push(RecordedEvent {
            object: Some(pod::pod_full_name(pod)),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }

    async fn node_event(&self, event_type: EventType, reason: &str, message: &str) {
        self.events.lock().push(RecordedEvent {
            object: None,
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Counts collections and optionally fails them.
#[derive(Default)]
pub struct FakeGc {
    calls: AtomicUsize,
    fail: bool,
}

impl FakeGc {
    /// A collector whose every run fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    /// Number of collections run.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn collect(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(KubeletError::Runtime("image filesystem stats unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContainerGc for FakeGc {
    async fn garbage_collect(&self) -> Result<()> {
        self.collect()
    }
}

#[async_trait]
impl ImageGc for FakeGc {
    async fn garbage_collect(&self) -> Result<()> {
        self.collect()
    }
}

#[derive(Default)]
struct SyncerProbe {
    in_flight: HashMap<PodUid, usize>,
    max: HashMap<PodUid, usize>,
    global_in_flight: usize,
    global_max: usize,
    calls: Vec<(PodUid, SyncPodType)>,
}

/// A [`PodSyncer`] that records calls and measures concurrency.
#[derive(Default)]
pub struct RecordingSyncer {
    delay: Duration,
    fail: bool,
    probe: Mutex<SyncerProbe>,
}

impl RecordingSyncer {
    /// A syncer whose every sync takes `delay`.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// A syncer whose every sync fails.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Highest number of concurrent syncs seen for one pod.
    #[must_use]
    pub fn max_concurrency(&self, uid: &PodUid) -> usize {
        self.probe.lock().max.get(uid).copied().unwrap_or(0)
    }

    /// Highest number of concurrent syncs seen overall.
    #[must_use]
    pub fn global_max_concurrency(&self) -> usize {
        self.probe.lock().global_max
    }

    /// Update types synced for one pod, in order.
    #[must_use]
    pub fn calls_for(&self, uid: &PodUid) -> Vec<SyncPodType> {
        self.probe
            .lock()
            .calls
            .iter()
            .filter(|(u, _)| u == uid)
            .map(|(_, t)| *t)
            .collect()
    }
}

#[async_trait]
impl PodSyncer for RecordingSyncer {
    async fn sync_pod(&self, options: SyncPodOptions) -> Result<()> {
        let uid = pod::pod_uid(&options.pod)?;
        {
            let mut probe = self.probe.lock();
            probe.calls.push((uid.clone(), options.update_type));
            let current = {
                let n = probe.in_flight.entry(uid.clone()).or_default();
                *n += 1;
                *n
            };
            let max = probe.max.entry(uid.clone()).or_default();
            *max = (*max).max(current);
            probe.global_in_flight += 1;
            probe.global_max = probe.global_max.max(probe.global_in_flight);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        {
            let mut probe = self.probe.lock();
            if let Some(n) = probe.in_flight.get_mut(&uid) {
                *n -= 1;
            }
            probe.global_in_flight -= 1;
        }
        if self.fail {
            Err(KubeletError::Runtime("sync failed".into()))
        } else {
            Ok(())
        }
    }
}

/// Volume manager whose mounts succeed unless told otherwise.
#[derive(Default)]
pub struct FakeVolumeManager {
    fail: AtomicBool,
    wait_calls: AtomicUsize,
    mounted: Mutex<HashSet<PodUid>>,
}

impl FakeVolumeManager {
    /// Make mounts fail.
    pub fn fail_mounts(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of mount waits.
    #[must_use]
    pub fn wait_calls(&self) -> usize {
        self.wait_calls.load(Ordering::SeqCst)
    }

    /// Unmount every volume of a pod.
    pub fn unmount(&self, uid: &PodUid) {
        self.mounted.lock().remove(uid);
    }
}

#[async_trait]
impl VolumeManager for FakeVolumeManager {
    async fn wait_for_attach_and_mount(&self, pod: &Pod) -> Result<()> {
        self.wait_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(KubeletError::Timeout("timeout expired waiting for volumes to attach or mount".into()));
        }
        self.mounted.lock().insert(pod::pod_uid(pod)?);
        Ok(())
    }

    async fn pod_volumes_exist(&self, uid: &PodUid) -> bool {
        self.mounted.lock().contains(uid)
    }
}

/// Cgroup manager tracking pod cgroups in memory.
#[derive(Default)]
pub struct FakeContainerManager {
    cgroups: Mutex<HashSet<PodUid>>,
    destroyed: Mutex<Vec<PodUid>>,
    fail: AtomicBool,
    ensure_calls: AtomicUsize,
}

impl FakeContainerManager {
    /// Make cgroup creation fail.
    pub fn fail_ensure(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Pretend a pod cgroup exists.
    pub fn add_cgroup(&self, uid: &PodUid) {
        self.cgroups.lock().insert(uid.clone());
    }

    /// Number of successful cgroup creations.
    #[must_use]
    pub fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    /// Destroyed cgroups, in order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<PodUid> {
        self.destroyed.lock().clone()
    }
}

#[async_trait]
impl ContainerManager for FakeContainerManager {
    async fn update_qos_cgroups(&self) -> Result<()> {
        Ok(())
    }

    async fn pod_cgroup_exists(&self, pod: &Pod) -> bool {
        pod::pod_uid(pod).is_ok_and(|uid| self.cgroups.lock().contains(&uid))
    }

    async fn ensure_pod_cgroup(&self, pod: &Pod) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(KubeletError::Runtime("failed to create cgroup: permission denied".into()));
        }
        self.cgroups.lock().insert(pod::pod_uid(pod)?);
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pod_cgroups(&self) -> Result<Vec<PodUid>> {
        Ok(self.cgroups.lock().iter().cloned().collect())
    }

    async fn destroy_pod_cgroup(&self, uid: &PodUid) -> Result<()> {
        self.cgroups.lock().remove(uid);
        self.destroyed.lock().push(uid.clone());
        Ok(())
    }
}

/// Secrets held in memory.
#[derive(Default)]
pub struct FakeSecretProvider {
    secrets: Mutex<HashMap<(String, String), Secret>>,
}

impl FakeSecretProvider {
    /// Store a secret.
    pub fn insert(&self, namespace: &str, name: &str, secret: Secret) {
        self.secrets
            .lock()
            .insert((namespace.to_string(), name.to_string()), secret);
    }
}

#[async_trait]
impl SecretProvider for FakeSecretProvider {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.secrets
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| KubeletError::PullSecret {
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: "not found".to_string(),
            })
    }
}

/// Records mirror pod operations.
#[derive(Default)]
pub struct FakeMirrorClient {
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeMirrorClient {
    /// Full names of the static pods whose mirror pod was created.
    #[must_use]
    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    /// Full names of the deleted mirror pods.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl MirrorClient for FakeMirrorClient {
    async fn create_mirror_pod(&self, pod: &Pod) -> Result<()> {
        self.created.lock().push(pod::pod_full_name(pod));
        Ok(())
    }

    async fn delete_mirror_pod(&self, name: &str, namespace: &str, _uid: Option<&PodUid>) -> Result<()> {
        self.deleted
            .lock()
            .push(pod::build_pod_full_name(name, namespace));
        Ok(())
    }
}

/// Keeps the callbacks it was started with.
#[derive(Default)]
pub struct FakeEvictionManager {
    callbacks: Mutex<Option<EvictionCallbacks>>,
}

impl FakeEvictionManager {
    /// Callbacks passed to `start`.
    #[must_use]
    pub fn callbacks(&self) -> Option<EvictionCallbacks> {
        self.callbacks.lock().clone()
    }
}

impl EvictionManager for FakeEvictionManager {
    fn start(
        &self,
        _stats: Arc<dyn StatsProvider>,
        callbacks: EvictionCallbacks,
        _monitoring_period: Duration,
    ) -> JoinHandle<()> {
        *self.callbacks.lock() = Some(callbacks);
        tokio::spawn(async {})
    }
}

/// Reports a fixed node usage.
#[derive(Default)]
pub struct FakeStatsProvider {
    stats: NodeStats,
}

#[async_trait]
impl StatsProvider for FakeStatsProvider {
    async fn node_stats(&self) -> Result<NodeStats> {
        Ok(self.stats)
    }
}

/// Rejects every pod with a fixed reason.
#[derive(Debug, Clone)]
pub struct RejectingAdmitHandler {
    reason: String,
    message: String,
}

impl RejectingAdmitHandler {
    /// Create a handler rejecting with `reason` and `message`.
    #[must_use]
    pub fn new(reason: &str, message: &str) -> Self {
        Self {
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }
}

impl PodAdmitHandler for RejectingAdmitHandler {
    fn admit(&self, _attrs: &PodAdmitAttributes<'_>) -> PodAdmitResult {
        PodAdmitResult::rejected(self.reason.clone(), self.message.clone())
    }
}

/// A fully wired [`Kubelet`] over fakes, with a temporary root directory.
pub struct TestHarness {
    /// The node agent.
    pub kubelet: Arc<Kubelet>,
    /// Its sync transaction script.
    pub syncer: Arc<KubeletPodSyncer>,
    /// Desired pods.
    pub pod_manager: Arc<PodManager>,
    /// Pod statuses.
    pub status_manager: Arc<StatusManager>,
    /// Runtime health.
    pub runtime_state: Arc<RuntimeState>,
    /// Container failure reasons.
    pub reason_cache: Arc<ReasonCache>,
    /// Metrics.
    pub metrics: Arc<Metrics>,
    /// Fake runtime.
    pub runtime: Arc<FakeRuntime>,
    /// Fake volume manager.
    pub volume_manager: Arc<FakeVolumeManager>,
    /// Fake cgroup manager.
    pub container_manager: Arc<FakeContainerManager>,
    /// Fake mirror client.
    pub mirror_client: Arc<FakeMirrorClient>,
    /// Fake secret store.
    pub secrets: Arc<FakeSecretProvider>,
    /// Fake event sink.
    pub recorder: Arc<FakeEventRecorder>,
    soft_admit_handlers: Vec<Arc<dyn PodAdmitHandler>>,
    _root: tempfile::TempDir,
}

impl TestHarness {
    /// A harness with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory or the agent cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self::with(|_| {}, Vec::new())
    }

    /// A harness whose soft admission rejects every pod.
    #[must_use]
    pub fn with_soft_rejection(reason: &str, message: &str) -> Self {
        Self::with(
            |_| {},
            vec![Arc::new(RejectingAdmitHandler::new(reason, message)) as Arc<dyn PodAdmitHandler>],
        )
    }

    /// A harness with an adjusted configuration and extra soft admit
    /// handlers.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory or the agent cannot be created.
    #[must_use]
    pub fn with(
        configure: impl FnOnce(&mut KubeletConfig),
        soft_admit_handlers: Vec<Arc<dyn PodAdmitHandler>>,
    ) -> Self {
        let root = tempfile::tempdir().expect("temporary root directory");
        let mut config = KubeletConfig::for_node("node-1");
        config.root_dir = root.path().to_path_buf();
        config.node_ip = Some("192.168.0.10".to_string());
        configure(&mut config);

        let runtime = Arc::new(FakeRuntime::default());
        let volume_manager = Arc::new(FakeVolumeManager::default());
        let container_manager = Arc::new(FakeContainerManager::default());
        let mirror_client = Arc::new(FakeMirrorClient::default());
        let secrets = Arc::new(FakeSecretProvider::default());
        let recorder = Arc::new(FakeEventRecorder::default());

        let kubelet = Kubelet::new(
            config,
            KubeletDeps {
                runtime: Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
                volume_manager: Arc::clone(&volume_manager) as Arc<dyn VolumeManager>,
                container_manager: Arc::clone(&container_manager) as Arc<dyn ContainerManager>,
                mirror_client: Arc::clone(&mirror_client) as Arc<dyn MirrorClient>,
                secrets: Arc::clone(&secrets) as Arc<dyn SecretProvider>,
                recorder: Arc::clone(&recorder) as Arc<dyn EventRecorder>,
                admit_handlers: Vec::new(),
                soft_admit_handlers: soft_admit_handlers.clone(),
            },
        )
        .expect("kubelet over fakes");

        Self {
            syncer: Arc::clone(kubelet.syncer()),
            pod_manager: Arc::clone(kubelet.pod_manager()),
            status_manager: Arc::clone(kubelet.status_manager()),
            runtime_state: Arc::clone(kubelet.runtime_state()),
            reason_cache: Arc::clone(kubelet.reason_cache()),
            metrics: Arc::clone(kubelet.metrics()),
            kubelet: Arc::new(kubelet),
            runtime,
            volume_manager,
            container_manager,
            mirror_client,
            secrets,
            recorder,
            soft_admit_handlers,
            _root: root,
        }
    }

    /// The collaborators the agent was built with.
    #[must_use]
    pub fn deps(&self) -> KubeletDeps {
        KubeletDeps {
            runtime: Arc::clone(&self.runtime) as Arc<dyn ContainerRuntime>,
            volume_manager: Arc::clone(&self.volume_manager) as Arc<dyn VolumeManager>,
            container_manager: Arc::clone(&self.container_manager) as Arc<dyn ContainerManager>,
            mirror_client: Arc::clone(&self.mirror_client) as Arc<dyn MirrorClient>,
            secrets: Arc::clone(&self.secrets) as Arc<dyn SecretProvider>,
            recorder: Arc::clone(&self.recorder) as Arc<dyn EventRecorder>,
            admit_handlers: Vec::new(),
            soft_admit_handlers: self.soft_admit_handlers.clone(),
        }
    }

    /// Current runtime status of a pod.
    ///
    /// # Panics
    ///
    /// Panics if the pod has no UID.
    pub async fn runtime_status(&self, pod: &Pod) -> RuntimePodStatus {
        let uid = pod::pod_uid(pod).expect("pod uid");
        self.runtime
            .get_pod_status(&uid, pod::pod_name(pod), pod::pod_namespace(pod))
            .await
            .expect("fake runtime status")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
