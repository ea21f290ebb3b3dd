//! The per-pod sync transaction script.
//!
//! [`KubeletPodSyncer`] converges one pod towards its desired state. The
//! script is re-run from the top on every sync; each step either checks
//! current state before acting or is idempotent, so a failure anywhere is
//! handled by simply running the whole script again later.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Container, ContainerState as ApiContainerState, ContainerStateRunning,
    ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, Pod, PodCondition, PodStatus,
    Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use nodelet_core::PodUid;
use tracing::{debug, error, info, warn};

use crate::active_deadline::PodSyncHandler;
use crate::admission::{AdmitHandlers, PodAdmitAttributes, PodAdmitResult};
use crate::backoff::Backoff;
use crate::collaborators::{ContainerManager, MirrorClient, SecretProvider, VolumeManager};
use crate::error::{KubeletError, Result};
use crate::events::{reasons, EventRecorder, EventType};
use crate::metrics::Metrics;
use crate::pod::{self, RestartPolicy};
use crate::pod_dirs::PodDirs;
use crate::pod_manager::PodManager;
use crate::pod_workers::PodSyncer;
use crate::reason_cache::ReasonCache;
use crate::runtime::{
    ContainerRuntime, ContainerState, RunningPod, RuntimeContainerStatus, RuntimePodStatus,
};
use crate::runtime_state::RuntimeState;
use crate::status_manager::StatusManager;
use crate::types::{PodPhase, SyncPodOptions, SyncPodType};

/// Waiting reason of containers in a pod blocked by a soft admit handler.
pub const BLOCKED_REASON: &str = "Blocked";
/// Waiting reason of containers that have not been created yet.
pub const CONTAINER_CREATING_REASON: &str = "ContainerCreating";

/// Collaborators of the sync transaction script.
#[derive(Clone)]
pub struct SyncerDeps {
    /// Container runtime.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Runtime and network health.
    pub runtime_state: Arc<RuntimeState>,
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
    /// Desired pods.
    pub pod_manager: Arc<PodManager>,
    /// Pod statuses.
    pub status_manager: Arc<StatusManager>,
    /// Container failure reasons.
    pub reason_cache: Arc<ReasonCache>,
    /// Container restart / image pull backoff.
    pub backoff: Arc<Backoff>,
    /// Metrics.
    pub metrics: Arc<Metrics>,
}

/// Runs the sync transaction script for the pod workers.
pub struct KubeletPodSyncer {
    node_ip: Option<String>,
    deps: SyncerDeps,
    soft_admit_handlers: AdmitHandlers,
    sync_handlers: Vec<Arc<dyn PodSyncHandler>>,
    pod_dirs: PodDirs,
}

impl std::fmt::Debug for KubeletPodSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeletPodSyncer")
            .field("node_ip", &self.node_ip)
            .field("soft_admit_handlers", &self.soft_admit_handlers)
            .field("pod_dirs", &self.pod_dirs)
            .finish_non_exhaustive()
    }
}

fn condition(type_: &str, ok: bool, reason: Option<&str>) -> PodCondition {
    PodCondition {
        type_: type_.to_string(),
        status: if ok { "True" } else { "False" }.to_string(),
        reason: reason.map(ToString::to_string),
        ..Default::default()
    }
}

fn waiting(reason: &str, message: Option<String>) -> ApiContainerState {
    ApiContainerState {
        waiting: Some(ContainerStateWaiting {
            reason: Some(reason.to_string()),
            message,
        }),
        ..Default::default()
    }
}

fn terminated_state(cs: &RuntimeContainerStatus) -> ApiContainerState {
    ApiContainerState {
        terminated: Some(ContainerStateTerminated {
            exit_code: cs.exit_code,
            reason: cs.reason.clone(),
            message: cs.message.clone(),
            started_at: cs.started_at.map(Time),
            finished_at: cs.finished_at.map(Time),
            container_id: Some(cs.id.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn will_restart(policy: RestartPolicy, exit_code: i32) -> bool {
    match policy {
        RestartPolicy::Always => true,
        RestartPolicy::OnFailure => exit_code != 0,
        RestartPolicy::Never => false,
    }
}

fn is_running(cs: &ContainerStatus) -> bool {
    cs.state.as_ref().is_some_and(|s| s.running.is_some())
}

fn is_terminated(cs: &ContainerStatus) -> bool {
    cs.state.as_ref().is_some_and(|s| s.terminated.is_some())
}

fn is_waiting(cs: &ContainerStatus) -> bool {
    cs.state.as_ref().is_some_and(|s| s.waiting.is_some())
}

/// Derive the pod phase from its container statuses.
#[must_use]
pub fn get_phase(pod: &Pod, init_statuses: &[ContainerStatus], statuses: &[ContainerStatus]) -> PodPhase {
    let policy = pod::restart_policy(pod);

    let mut pending_initialization = 0;
    for init in pod::init_containers(pod) {
        match init_statuses.iter().find(|cs| cs.name == init.name) {
            Some(cs) if is_terminated(cs) => {
                let exit_code = cs
                    .state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .map_or(0, |t| t.exit_code);
                if exit_code != 0 {
                    if policy == RestartPolicy::Never {
                        return PodPhase::Failed;
                    }
                    pending_initialization += 1;
                }
            }
            _ => pending_initialization += 1,
        }
    }

    let (mut running, mut waiting_count, mut stopped, mut succeeded, mut unknown) = (0, 0, 0, 0, 0);
    for container in pod::containers(pod) {
        match statuses.iter().find(|cs| cs.name == container.name) {
            Some(cs) if is_running(cs) => running += 1,
            Some(cs) if is_terminated(cs) => {
                stopped += 1;
                let exit_code = cs
                    .state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .map_or(-1, |t| t.exit_code);
                if exit_code == 0 {
                    succeeded += 1;
                }
            }
            Some(cs) if is_waiting(cs) => {
                let restarting = cs
                    .last_state
                    .as_ref()
                    .is_some_and(|s| s.terminated.is_some());
                if restarting {
                    stopped += 1;
                } else {
                    waiting_count += 1;
                }
            }
            _ => unknown += 1,
        }
    }

    if pending_initialization > 0 || waiting_count > 0 {
        return PodPhase::Pending;
    }
    if running > 0 && unknown == 0 {
        return PodPhase::Running;
    }
    if running == 0 && stopped > 0 && unknown == 0 {
        return match policy {
            RestartPolicy::Always => PodPhase::Running,
            _ if stopped == succeeded => PodPhase::Succeeded,
            RestartPolicy::Never => PodPhase::Failed,
            RestartPolicy::OnFailure => PodPhase::Running,
        };
    }
    PodPhase::Pending
}

impl KubeletPodSyncer {
    /// Create the syncer.
    #[must_use]
    pub fn new(
        node_ip: Option<String>,
        deps: SyncerDeps,
        soft_admit_handlers: AdmitHandlers,
        sync_handlers: Vec<Arc<dyn PodSyncHandler>>,
        pod_dirs: PodDirs,
    ) -> Self {
        Self {
            node_ip,
            deps,
            soft_admit_handlers,
            sync_handlers,
            pod_dirs,
        }
    }

    /// The collaborators of this syncer.
    #[must_use]
    pub fn deps(&self) -> &SyncerDeps {
        &self.deps
    }

    fn latest_status(&self, pod: &Pod) -> PodStatus {
        pod::pod_uid(pod)
            .ok()
            .and_then(|uid| self.deps.status_manager.get_pod_status(&uid))
            .or_else(|| pod.status.clone())
            .unwrap_or_default()
    }

    /// Whether the last known status of the pod is Succeeded or Failed.
    #[must_use]
    pub fn has_terminal_phase(&self, pod: &Pod) -> bool {
        PodPhase::of(&self.latest_status(pod)).is_terminal()
    }

    /// Whether the pod has finished: a terminal phase, or deleted with no
    /// running containers.
    #[must_use]
    pub fn is_pod_terminated(&self, pod: &Pod) -> bool {
        let status = self.latest_status(pod);
        if PodPhase::of(&status).is_terminal() {
            return true;
        }
        pod::is_deletion_requested(pod)
            && !status
                .container_statuses
                .iter()
                .flatten()
                .any(is_running)
    }

    /// Desired pods that have not terminated.
    #[must_use]
    pub fn active_pods(&self) -> Vec<Arc<Pod>> {
        self.deps
            .pod_manager
            .get_pods()
            .into_iter()
            .filter(|p| !self.is_pod_terminated(p))
            .collect()
    }

    /// Run the soft admit handlers against the currently active pods.
    #[must_use]
    pub fn can_run_pod(&self, pod: &Pod) -> PodAdmitResult {
        let candidate = pod.metadata.uid.as_deref();
        let others: Vec<Arc<Pod>> = self
            .active_pods()
            .into_iter()
            .filter(|p| p.metadata.uid.as_deref() != candidate)
            .collect();
        self.soft_admit_handlers.admit(&PodAdmitAttributes {
            pod,
            other_pods: &others,
        })
    }

    fn convert_container_status(
        &self,
        uid: &PodUid,
        container: &Container,
        runtime: Option<&RuntimeContainerStatus>,
        old: Option<&ContainerStatus>,
        policy: RestartPolicy,
    ) -> ContainerStatus {
        let mut status = ContainerStatus {
            name: container.name.clone(),
            image: container.image.clone().unwrap_or_default(),
            state: Some(waiting(CONTAINER_CREATING_REASON, None)),
            last_state: old.and_then(|o| o.last_state.clone()),
            restart_count: old.map_or(0, |o| o.restart_count),
            ..Default::default()
        };

        if let Some(cs) = runtime {
            status.image = cs.image.clone();
            status.image_id = cs.image_id.clone();
            status.container_id = Some(cs.id.to_string());
            status.restart_count = cs.restart_count;
            match cs.state {
                ContainerState::Running => {
                    status.state = Some(ApiContainerState {
                        running: Some(ContainerStateRunning {
                            started_at: cs.started_at.map(Time),
                        }),
                        ..Default::default()
                    });
                    status.ready = true;
                    status.started = Some(true);
                }
                ContainerState::Exited => {
                    status.state = Some(terminated_state(cs));
                    status.started = Some(false);
                }
                ContainerState::Created | ContainerState::Unknown => {}
            }
        }

        // Containers that are not running show their last failure reason.
        if !status.ready {
            if let Some(info) = self.deps.reason_cache.get(uid, &container.name) {
                let exited_for_good = runtime.is_some_and(|cs| {
                    cs.state == ContainerState::Exited && !will_restart(policy, cs.exit_code)
                });
                if !exited_for_good {
                    if let Some(cs) = runtime.filter(|cs| cs.state == ContainerState::Exited) {
                        status.last_state = Some(terminated_state(cs));
                    }
                    status.state = Some(waiting(&info.reason, Some(info.message)));
                }
            }
        }
        status
    }

    /// Build the API status of a pod from its runtime status and the cached
    /// API status.
    #[must_use]
    pub fn generate_api_pod_status(&self, pod: &Pod, runtime_status: &RuntimePodStatus) -> PodStatus {
        let uid = &runtime_status.id;
        let old = self
            .deps
            .status_manager
            .get_pod_status(uid)
            .or_else(|| pod.status.clone())
            .unwrap_or_default();
        let policy = pod::restart_policy(pod);

        let convert = |containers: &[Container], old_statuses: Option<&Vec<ContainerStatus>>| {
            containers
                .iter()
                .map(|c| {
                    let previous = old_statuses.and_then(|o| o.iter().find(|cs| cs.name == c.name));
                    self.convert_container_status(
                        uid,
                        c,
                        runtime_status.find_container_status(&c.name),
                        previous,
                        policy,
                    )
                })
                .collect::<Vec<_>>()
        };
        let init_statuses = convert(pod::init_containers(pod), old.init_container_statuses.as_ref());
        let container_statuses = convert(pod::containers(pod), old.container_statuses.as_ref());

        let mut phase = get_phase(pod, &init_statuses, &container_statuses);
        let old_phase = PodPhase::of(&old);
        if old_phase.is_terminal() && phase != old_phase {
            error!(
                pod = %pod::pod_full_name(pod),
                from = %old_phase,
                to = %phase,
                "Pod attempted illegal phase transition"
            );
            phase = old_phase;
        }

        let host_ip = self.node_ip.clone();
        let pod_ip = if pod::is_host_network(pod) {
            host_ip.clone()
        } else {
            runtime_status.ips.first().cloned().or_else(|| old.pod_ip.clone())
        };

        let mut status = PodStatus {
            phase: Some(phase.as_str().to_string()),
            host_ip,
            pod_ip,
            start_time: old.start_time.clone(),
            qos_class: Some(pod::qos_class(pod).as_str().to_string()),
            init_container_statuses: (!init_statuses.is_empty()).then(|| init_statuses.clone()),
            container_statuses: Some(container_statuses.clone()),
            ..Default::default()
        };

        for handler in &self.sync_handlers {
            let verdict = handler.should_evict(pod);
            if verdict.evict {
                status.phase = Some(PodPhase::Failed.as_str().to_string());
                status.reason = Some(verdict.reason);
                status.message = Some(verdict.message);
                return status;
            }
        }

        let initialized = init_statuses.iter().all(|cs| {
            cs.state
                .as_ref()
                .and_then(|s| s.terminated.as_ref())
                .is_some_and(|t| t.exit_code == 0)
        });
        let containers_ready =
            !container_statuses.is_empty() && container_statuses.iter().all(|cs| cs.ready);
        let not_ready_reason = (!containers_ready).then_some("ContainersNotReady");
        status.conditions = Some(vec![
            condition(
                "Initialized",
                initialized,
                (!initialized).then_some("ContainersNotInitialized"),
            ),
            condition(
                "Ready",
                containers_ready && phase == PodPhase::Running,
                not_ready_reason,
            ),
            condition("ContainersReady", containers_ready, not_ready_reason),
            condition("PodScheduled", true, None),
        ]);
        status
    }

    /// Kill every container of the pod through the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`KubeletError::KillPod`] if the runtime fails to kill the pod.
    pub async fn kill_pod(
        &self,
        pod: Option<&Pod>,
        running_pod: &RunningPod,
        grace_period_override: Option<i64>,
    ) -> Result<()> {
        self.deps
            .runtime
            .kill_pod(pod, running_pod, grace_period_override)
            .await
            .map_err(|e| KubeletError::KillPod(e.to_string()))?;
        if let Err(e) = self.deps.container_manager.update_qos_cgroups().await {
            debug!(error = %e, "Failed to update QoS cgroups while killing pod");
        }
        Ok(())
    }

    async fn get_pull_secrets(&self, pod: &Pod) -> Vec<Secret> {
        let namespace = pod::pod_namespace(pod);
        let mut secrets = Vec::new();
        for name in pod::image_pull_secret_names(pod) {
            match self.deps.secrets.get_secret(namespace, &name).await {
                Ok(secret) => secrets.push(secret),
                Err(e) => {
                    warn!(pod = %pod::pod_full_name(pod), secret = %name, error = %e, "Unable to retrieve pull secret, the image pull may not succeed");
                }
            }
        }
        secrets
    }

    async fn record_warning(&self, pod: &Pod, reason: &str, message: &str) {
        self.deps
            .recorder
            .pod_event(pod, EventType::Warning, reason, message)
            .await;
    }

    async fn reconcile_mirror_pod(&self, pod: &Pod, mirror: Option<&Pod>) {
        let full_name = pod::pod_full_name(pod);
        let mut missing = mirror.is_none();
        if let Some(mirror) = mirror {
            let stale = pod::is_deletion_requested(mirror) || !pod::is_mirror_pod_of(mirror, pod);
            if stale {
                info!(pod = %full_name, "Deleting mirror pod because it is outdated");
                let uid = pod::pod_uid(mirror).ok();
                if let Err(e) = self
                    .deps
                    .mirror_client
                    .delete_mirror_pod(pod::pod_name(mirror), pod::pod_namespace(mirror), uid.as_ref())
                    .await
                {
                    error!(pod = %full_name, error = %e, "Failed deleting mirror pod");
                } else {
                    missing = true;
                }
            }
        }
        if missing {
            info!(pod = %full_name, "Creating a mirror pod for static pod");
            if let Err(e) = self.deps.mirror_client.create_mirror_pod(pod).await {
                error!(pod = %full_name, error = %e, "Failed creating a mirror pod");
            }
        }
    }

    async fn sync_kill(&self, options: &SyncPodOptions) -> Result<()> {
        let pod = &options.pod;
        let kill_options = options.kill_pod_options.clone().unwrap_or_default();
        if let Some(status_fn) = &kill_options.pod_status_fn {
            let mut api_status = self.generate_api_pod_status(pod, &options.pod_status);
            status_fn(&mut api_status);
            self.deps.status_manager.set_pod_status(pod, api_status);
        }
        let running = options.pod_status.to_running_pod();
        if let Err(e) = self
            .kill_pod(
                Some(pod),
                &running,
                kill_options.pod_termination_grace_period_seconds_override,
            )
            .await
        {
            self.record_warning(pod, reasons::FAILED_TO_KILL_POD, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl PodSyncer for KubeletPodSyncer {
    async fn sync_pod(&self, options: SyncPodOptions) -> Result<()> {
        let pod = Arc::clone(&options.pod);
        let uid = pod::pod_uid(&pod)?;
        let full_name = pod::pod_full_name(&pod);

        if options.update_type == SyncPodType::Kill {
            return self.sync_kill(&options).await;
        }

        let pod_status = &options.pod_status;
        let previous = self.deps.status_manager.get_pod_status(&uid);

        let mut api_status = self.generate_api_pod_status(&pod, pod_status);
        let phase = PodPhase::of(&api_status);

        if phase == PodPhase::Running {
            let was_pending = previous
                .as_ref()
                .map_or(true, |s| PodPhase::of(s) == PodPhase::Pending);
            if was_pending {
                if let Some(first_seen) = pod::first_seen_time(&pod) {
                    let latency = Utc::now().signed_duration_since(first_seen);
                    let seconds = latency.to_std().map_or(0.0, |d| d.as_secs_f64());
                    self.deps.metrics.pod_start_duration.observe(seconds);
                }
            }
        }

        let runnable = self.can_run_pod(&pod);
        if !runnable.admit {
            api_status.reason = Some(runnable.reason.clone());
            api_status.message = Some(runnable.message.clone());
            for cs in api_status
                .init_container_statuses
                .iter_mut()
                .chain(api_status.container_statuses.iter_mut())
                .flatten()
            {
                if let Some(w) = cs.state.as_mut().and_then(|s| s.waiting.as_mut()) {
                    w.reason = Some(BLOCKED_REASON.to_string());
                }
            }
        }

        let first_sync = !api_status
            .container_statuses
            .iter()
            .flatten()
            .any(is_running);

        self.deps.status_manager.set_pod_status(&pod, api_status);

        if !runnable.admit || pod::is_deletion_requested(&pod) || phase == PodPhase::Failed {
            let running = pod_status.to_running_pod();
            if let Err(e) = self.kill_pod(Some(&pod), &running, None).await {
                self.record_warning(&pod, reasons::FAILED_TO_KILL_POD, &e.to_string()).await;
                return Err(e);
            }
            if !runnable.admit {
                return Err(KubeletError::PodNotRunnable(runnable.message));
            }
            return Ok(());
        }

        let network_errors = self.deps.runtime_state.network_errors();
        if !network_errors.is_empty() && !pod::is_host_network(&pod) {
            let message = network_errors.join("; ");
            self.record_warning(&pod, reasons::NETWORK_NOT_READY, &message).await;
            return Err(KubeletError::NetworkNotReady(message));
        }

        let cgroups = &self.deps.container_manager;
        let mut pod_killed = false;
        if !cgroups.pod_cgroup_exists(&pod).await && !first_sync {
            // Containers running outside their cgroup must be restarted in it.
            let running = pod_status.to_running_pod();
            match self.kill_pod(Some(&pod), &running, None).await {
                Ok(()) => pod_killed = true,
                Err(e) => error!(pod = %full_name, error = %e, "Failed to kill pod with missing cgroup"),
            }
        }
        if !(pod_killed && pod::restart_policy(&pod) == RestartPolicy::Never)
            && !cgroups.pod_cgroup_exists(&pod).await
        {
            if let Err(e) = cgroups.update_qos_cgroups().await {
                warn!(pod = %full_name, error = %e, "Failed to update QoS cgroups");
            }
            if let Err(e) = cgroups.ensure_pod_cgroup(&pod).await {
                let err = KubeletError::CgroupSetup {
                    uid: uid.clone(),
                    message: e.to_string(),
                };
                self.record_warning(&pod, reasons::FAILED_TO_CREATE_POD_CONTAINER, &err.to_string())
                    .await;
                return Err(err);
            }
        }

        if pod::is_static_pod(&pod) {
            self.reconcile_mirror_pod(&pod, options.mirror_pod.as_deref()).await;
        }

        if let Err(source) = self.pod_dirs.make_pod_data_dirs(&uid).await {
            let err = KubeletError::DataDirectories {
                uid: uid.clone(),
                source,
            };
            self.record_warning(&pod, reasons::FAILED_TO_MAKE_POD_DATA_DIRECTORIES, &err.to_string())
                .await;
            return Err(err);
        }

        if let Err(e) = self.deps.volume_manager.wait_for_attach_and_mount(&pod).await {
            let err = KubeletError::VolumeMount {
                uid: uid.clone(),
                message: e.to_string(),
            };
            self.record_warning(&pod, reasons::FAILED_MOUNT_VOLUME, &err.to_string()).await;
            error!(pod = %full_name, error = %e, "Unable to mount volumes for pod");
            return Err(err);
        }

        let pull_secrets = self.get_pull_secrets(&pod).await;
        let result = self
            .deps
            .runtime
            .sync_pod(&pod, pod_status, &pull_secrets, &self.deps.backoff)
            .await;
        self.deps.reason_cache.update(&uid, &result);

        match result.error_ignoring_backoff() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestHarness};
    use crate::types::{KillPodOptions, PodStatusFn};

    fn container_status(name: &str, state: ApiContainerState) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(state),
            ..Default::default()
        }
    }

    fn running() -> ApiContainerState {
        ApiContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        }
    }

    fn exited(code: i32) -> ApiContainerState {
        ApiContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: code,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn phase_from_container_states() {
        let pod = testing::pod("uid-1", "web");
        assert_eq!(get_phase(&pod, &[], &[]), PodPhase::Pending);
        assert_eq!(
            get_phase(&pod, &[], &[container_status("app", running())]),
            PodPhase::Running
        );
        assert_eq!(
            get_phase(&pod, &[], &[container_status("app", waiting("ContainerCreating", None))]),
            PodPhase::Pending
        );
        // Always restarts, so an exited container still means Running.
        assert_eq!(
            get_phase(&pod, &[], &[container_status("app", exited(1))]),
            PodPhase::Running
        );

        let mut never = (*pod).clone();
        never.spec.as_mut().unwrap().restart_policy = Some("Never".into());
        assert_eq!(
            get_phase(&never, &[], &[container_status("app", exited(1))]),
            PodPhase::Failed
        );
        assert_eq!(
            get_phase(&never, &[], &[container_status("app", exited(0))]),
            PodPhase::Succeeded
        );
    }

    #[tokio::test]
    async fn new_pod_runs_and_records_start_latency() {
        let harness = TestHarness::new();
        let pod = testing::seen_pod("uid-1", "web");
        harness.pod_manager.add_pod(Arc::clone(&pod));

        let status = harness.runtime_status(&pod).await;
        harness
            .syncer
            .sync_pod(testing::sync_options(&pod, status, SyncPodType::Create))
            .await
            .unwrap();
        assert_eq!(harness.runtime.sync_calls(), 1);
        assert!(harness.container_manager.pod_cgroup_exists(&pod).await);

        let status = harness.runtime_status(&pod).await;
        harness
            .syncer
            .sync_pod(testing::sync_options(&pod, status, SyncPodType::Sync))
            .await
            .unwrap();

        let uid = PodUid::new("uid-1").unwrap();
        let api = harness.status_manager.get_pod_status(&uid).unwrap();
        assert_eq!(api.phase.as_deref(), Some("Running"));
        assert_eq!(harness.metrics.pod_start_duration.get_sample_count(), 1);

        // A third sync with nothing changed is idempotent.
        let status = harness.runtime_status(&pod).await;
        harness
            .syncer
            .sync_pod(testing::sync_options(&pod, status, SyncPodType::Sync))
            .await
            .unwrap();
        assert_eq!(harness.runtime.started_containers(), 1);
        assert_eq!(harness.container_manager.ensure_calls(), 1);
        assert_eq!(harness.metrics.pod_start_duration.get_sample_count(), 1);
    }

    #[tokio::test]
    async fn deletion_kills_before_mounting() {
        let harness = TestHarness::new();
        let mut pod = (*testing::pod("uid-1", "web")).clone();
        pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let pod = Arc::new(pod);
        harness.pod_manager.add_pod(Arc::clone(&pod));

        let status = harness.runtime_status(&pod).await;
        harness
            .syncer
            .sync_pod(testing::sync_options(&pod, status, SyncPodType::Update))
            .await
            .unwrap();

        assert_eq!(harness.runtime.kill_calls(), 1);
        assert_eq!(harness.volume_manager.wait_calls(), 0);
        assert_eq!(harness.runtime.sync_calls(), 0);
    }

    #[tokio::test]
    async fn soft_rejection_blocks_and_kills() {
        let harness = TestHarness::with_soft_rejection("NoNewPrivs", "not supported");
        let pod = testing::pod("uid-1", "web");
        harness.pod_manager.add_pod(Arc::clone(&pod));

        let status = harness.runtime_status(&pod).await;
        let err = harness
            .syncer
            .sync_pod(testing::sync_options(&pod, status, SyncPodType::Create))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeletError::PodNotRunnable(_)));

        let uid = PodUid::new("uid-1").unwrap();
        let api = harness.status_manager.get_pod_status(&uid).unwrap();
        assert_eq!(api.phase.as_deref(), Some("Pending"));
        assert_eq!(api.reason.as_deref(), Some("NoNewPrivs"));
        let waiting_reason = api.container_statuses.unwrap()[0]
            .state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.clone());
        assert_eq!(waiting_reason.as_deref(), Some(BLOCKED_REASON));
        assert_eq!(harness.runtime.kill_calls(), 1);
        assert_eq!(harness.runtime.sync_calls(), 0);
    }

    #[tokio::test]
    async fn network_not_ready_aborts_before_runtime() {
        let harness = TestHarness::new();
        harness
            .runtime_state
            .set_network_state(Some("cni config uninitialized".into()));
        let pod = testing::pod("uid-1", "web");
        harness.pod_manager.add_pod(Arc::clone(&pod));

        let status = harness.runtime_status(&pod).await;
        let err = harness
            .syncer
            .sync_pod(testing::sync_options(&pod, status, SyncPodType::Create))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeletError::NetworkNotReady(_)));
        assert!(err.is_retriable());
        assert_eq!(harness.container_manager.ensure_calls(), 0);
        assert!(harness.recorder.has_reason(reasons::NETWORK_NOT_READY));

        let mut host = (*pod).clone();
        host.spec.as_mut().unwrap().host_network = Some(true);
        let host = Arc::new(host);
        let status = harness.runtime_status(&host).await;
        harness
            .syncer
            .sync_pod(testing::sync_options(&host, status, SyncPodType::Create))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cgroup_and_volume_failures_are_fatal_to_the_sync() {
        let harness = TestHarness::new();
        let pod = testing::pod("uid-1", "web");
        harness.pod_manager.add_pod(Arc::clone(&pod));

        harness.container_manager.fail_ensure(true);
        let status = harness.runtime_status(&pod).await;
        let err = harness
            .syncer
            .sync_pod(testing::sync_options(&pod, status.clone(), SyncPodType::Create))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeletError::CgroupSetup { .. }));
        assert!(harness.recorder.has_reason(reasons::FAILED_TO_CREATE_POD_CONTAINER));

        harness.container_manager.fail_ensure(false);
        harness.volume_manager.fail_mounts(true);
        let err = harness
            .syncer
            .sync_pod(testing::sync_options(&pod, status.clone(), SyncPodType::Create))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeletError::VolumeMount { .. }));
        assert!(harness.recorder.has_reason(reasons::FAILED_MOUNT_VOLUME));
        assert_eq!(harness.runtime.sync_calls(), 0);

        harness.volume_manager.fail_mounts(false);
        harness
            .syncer
            .sync_pod(testing::sync_options(&pod, status, SyncPodType::Create))
            .await
            .unwrap();
        assert_eq!(harness.runtime.sync_calls(), 1);
    }

    #[tokio::test]
    async fn crash_loop_is_recorded_but_not_an_error() {
        let harness = TestHarness::new();
        let pod = testing::pod("uid-1", "web");
        harness.pod_manager.add_pod(Arc::clone(&pod));
        harness.runtime.crash_loop("app");

        let status = harness.runtime_status(&pod).await;
        harness
            .syncer
            .sync_pod(testing::sync_options(&pod, status, SyncPodType::Create))
            .await
            .unwrap();

        let uid = PodUid::new("uid-1").unwrap();
        assert_eq!(
            harness.reason_cache.get(&uid, "app").unwrap().reason,
            "CrashLoopBackOff"
        );

        let status = harness.runtime_status(&pod).await;
        let api = harness.syncer.generate_api_pod_status(&pod, &status);
        let reason = api.container_statuses.unwrap()[0]
            .state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.clone());
        assert_eq!(reason.as_deref(), Some("CrashLoopBackOff"));
    }

    #[tokio::test]
    async fn kill_applies_status_fn() {
        let harness = TestHarness::new();
        let pod = testing::pod("uid-1", "web");
        harness.pod_manager.add_pod(Arc::clone(&pod));

        let status_fn: PodStatusFn = Arc::new(|status: &mut PodStatus| {
            status.phase = Some("Failed".into());
            status.reason = Some("Evicted".into());
        });
        let status = harness.runtime_status(&pod).await;
        let mut options = testing::sync_options(&pod, status, SyncPodType::Kill);
        options.kill_pod_options = Some(KillPodOptions {
            pod_status_fn: Some(status_fn),
            pod_termination_grace_period_seconds_override: Some(0),
        });
        harness.syncer.sync_pod(options).await.unwrap();

        let uid = PodUid::new("uid-1").unwrap();
        let api = harness.status_manager.get_pod_status(&uid).unwrap();
        assert_eq!(api.reason.as_deref(), Some("Evicted"));
        assert_eq!(harness.runtime.kill_calls(), 1);
        assert_eq!(harness.runtime.last_grace_override(), Some(Some(0)));
        assert_eq!(harness.volume_manager.wait_calls(), 0);
    }

    #[tokio::test]
    async fn static_pod_gets_a_mirror_pod() {
        let harness = TestHarness::new();
        let pod = testing::static_pod("uid-1", "etcd");
        harness.pod_manager.add_pod(Arc::clone(&pod));

        let status = harness.runtime_status(&pod).await;
        harness
            .syncer
            .sync_pod(testing::sync_options(&pod, status, SyncPodType::Create))
            .await
            .unwrap();
        assert_eq!(harness.mirror_client.created(), vec!["etcd_default".to_string()]);
    }
}
