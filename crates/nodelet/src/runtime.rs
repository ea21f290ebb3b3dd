//! The container runtime contract consumed by the sync core.
//!
//! Concrete shims (CRI, docker) implement [`ContainerRuntime`]; the core
//! never speaks a runtime wire protocol itself.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod, Secret};
use nodelet_core::{ContainerId, PodUid};

use crate::backoff::Backoff;
use crate::error::{KubeletError, Result};

/// Runtime condition reporting that the runtime can run containers.
pub const RUNTIME_READY: &str = "RuntimeReady";
/// Runtime condition reporting that the pod network is configured.
pub const NETWORK_READY: &str = "NetworkReady";

/// Coarse state of a container as seen by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContainerState {
    /// Created but not started.
    Created,
    /// Running.
    Running,
    /// Exited.
    Exited,
    /// State could not be determined.
    #[default]
    Unknown,
}

/// Runtime status of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContainerStatus {
    /// Runtime container ID.
    pub id: ContainerId,
    /// Container name from the pod spec.
    pub name: String,
    /// Current state.
    pub state: ContainerState,
    /// When the container was created.
    pub created_at: Option<DateTime<Utc>>,
    /// When the container started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the container exited.
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code of an exited container.
    pub exit_code: i32,
    /// Image reference.
    pub image: String,
    /// Resolved image ID.
    pub image_id: String,
    /// How many times this container has been restarted.
    pub restart_count: i32,
    /// Short machine-readable reason for the state.
    pub reason: Option<String>,
    /// Human-readable message for the state.
    pub message: Option<String>,
}

/// Runtime-observed status of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePodStatus {
    /// Pod UID.
    pub id: PodUid,
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Pod IPs, primary first.
    pub ips: Vec<String>,
    /// Container statuses, newest first for each container name.
    pub container_statuses: Vec<RuntimeContainerStatus>,
}

impl RuntimePodStatus {
    /// Status of a pod the runtime knows nothing about.
    #[must_use]
    pub fn empty(id: PodUid, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            namespace: namespace.into(),
            ips: Vec::new(),
            container_statuses: Vec::new(),
        }
    }

    /// The most recent status of the named container.
    #[must_use]
    pub fn find_container_status(&self, name: &str) -> Option<&RuntimeContainerStatus> {
        self.container_statuses.iter().find(|c| c.name == name)
    }

    /// Whether any container is running.
    #[must_use]
    pub fn has_running_containers(&self) -> bool {
        self.container_statuses
            .iter()
            .any(|c| c.state == ContainerState::Running)
    }

    /// The pod's running containers as a [`RunningPod`].
    #[must_use]
    pub fn to_running_pod(&self) -> RunningPod {
        RunningPod {
            id: self.id.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            containers: self
                .container_statuses
                .iter()
                .filter(|c| c.state == ContainerState::Running)
                .map(|c| RuntimeContainer {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    image: c.image.clone(),
                    state: c.state,
                })
                .collect(),
        }
    }
}

/// A container listed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContainer {
    /// Runtime container ID.
    pub id: ContainerId,
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Current state.
    pub state: ContainerState,
}

/// A pod listed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningPod {
    /// Pod UID.
    pub id: PodUid,
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Containers of the pod.
    pub containers: Vec<RuntimeContainer>,
}

impl RunningPod {
    /// Whether the pod has no containers left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

/// One runtime health condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCondition {
    /// Condition type, e.g. [`RUNTIME_READY`].
    pub type_: String,
    /// Whether the condition holds.
    pub status: bool,
    /// Short reason when the condition does not hold.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
}

/// Health conditions reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStatus {
    /// Reported conditions.
    pub conditions: Vec<RuntimeCondition>,
}

impl RuntimeStatus {
    /// A status where both the runtime and the network are ready.
    #[must_use]
    pub fn healthy() -> Self {
        let ready = |type_: &str| RuntimeCondition {
            type_: type_.to_string(),
            status: true,
            reason: String::new(),
            message: String::new(),
        };
        Self {
            conditions: vec![ready(RUNTIME_READY), ready(NETWORK_READY)],
        }
    }

    /// Look up a condition by type.
    #[must_use]
    pub fn condition(&self, type_: &str) -> Option<&RuntimeCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Step of a runtime pod sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncAction {
    /// Start a container.
    StartContainer,
    /// Kill a container.
    KillContainer,
    /// Create the pod sandbox.
    CreatePodSandbox,
    /// Configure the pod sandbox network.
    ConfigPodSandbox,
    /// Kill the pod sandbox.
    KillPodSandbox,
    /// Run an init container.
    InitContainer,
}

/// Failure of one sync step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The container is crash looping and is backing off.
    CrashLoopBackOff,
    /// The image pull is backing off.
    ImagePullBackOff,
    /// Pulling the image failed.
    ErrImagePull,
    /// Starting the container failed.
    RunContainer,
    /// Killing the container failed.
    KillContainer,
    /// Creating the sandbox failed.
    CreatePodSandbox,
    /// Any other failure, with its reason.
    Other(String),
}

impl SyncError {
    /// Machine-readable reason recorded in container statuses.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::CrashLoopBackOff => "CrashLoopBackOff",
            Self::ImagePullBackOff => "ImagePullBackOff",
            Self::ErrImagePull => "ErrImagePull",
            Self::RunContainer => "RunContainerError",
            Self::KillContainer => "KillContainerError",
            Self::CreatePodSandbox => "CreatePodSandboxError",
            Self::Other(reason) => reason,
        }
    }

    /// Whether the failure only reflects an active backoff.
    #[must_use]
    pub const fn is_backoff(&self) -> bool {
        matches!(self, Self::CrashLoopBackOff | Self::ImagePullBackOff)
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Result of one sync step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    /// Step performed.
    pub action: SyncAction,
    /// Container name (or pod full name for sandbox steps).
    pub target: String,
    /// Failure, if the step failed.
    pub error: Option<SyncError>,
    /// Failure details.
    pub message: String,
}

impl SyncResult {
    /// A successful step.
    #[must_use]
    pub fn ok(action: SyncAction, target: impl Into<String>) -> Self {
        Self {
            action,
            target: target.into(),
            error: None,
            message: String::new(),
        }
    }

    /// A failed step.
    #[must_use]
    pub fn failed(
        action: SyncAction,
        target: impl Into<String>,
        error: SyncError,
        message: impl Into<String>,
    ) -> Self {
        Self {
            action,
            target: target.into(),
            error: Some(error),
            message: message.into(),
        }
    }
}

/// Structured result of [`ContainerRuntime::sync_pod`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSyncResult {
    /// Per-step results.
    pub sync_results: Vec<SyncResult>,
    /// Error that aborted the sync before any step ran.
    pub sync_error: Option<String>,
}

impl PodSyncResult {
    /// Append a step result.
    pub fn add(&mut self, result: SyncResult) {
        self.sync_results.push(result);
    }

    /// Record an error that aborted the whole sync.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.sync_error = Some(message.into());
    }

    /// Aggregate every failure into a single error.
    #[must_use]
    pub fn error(&self) -> Option<KubeletError> {
        let mut messages: Vec<String> = self
            .sync_results
            .iter()
            .filter_map(|r| {
                r.error
                    .as_ref()
                    .map(|e| format!("failed to \"{:?}\" for \"{}\" with {e}: \"{}\"", r.action, r.target, r.message))
            })
            .collect();
        if let Some(err) = &self.sync_error {
            messages.push(err.clone());
        }
        if messages.is_empty() {
            None
        } else {
            Some(KubeletError::RuntimeSync(messages.join(", ")))
        }
    }

    /// The aggregate error, unless every failure is only a backoff.
    ///
    /// Backoff failures are expected while a container crash loops or an
    /// image pull is throttled and are surfaced through the reason cache
    /// instead.
    #[must_use]
    pub fn error_ignoring_backoff(&self) -> Option<KubeletError> {
        let err = self.error()?;
        let only_backoff = self.sync_error.is_none()
            && self
                .sync_results
                .iter()
                .filter_map(|r| r.error.as_ref())
                .all(SyncError::is_backoff);
        if only_backoff {
            None
        } else {
            Some(err)
        }
    }
}

/// The container runtime capability set.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type, e.g. `remote`.
    fn runtime_type(&self) -> &str;

    /// Report runtime health conditions.
    async fn status(&self) -> Result<RuntimeStatus>;

    /// List pods; with `all` exited containers are included.
    async fn get_pods(&self, all: bool) -> Result<Vec<RunningPod>>;

    /// Observe the status of one pod.
    async fn get_pod_status(&self, uid: &PodUid, name: &str, namespace: &str)
        -> Result<RuntimePodStatus>;

    /// Converge the pod's containers towards its spec.
    async fn sync_pod(
        &self,
        pod: &Pod,
        status: &RuntimePodStatus,
        pull_secrets: &[Secret],
        backoff: &Backoff,
    ) -> PodSyncResult;

    /// Kill every container of a pod.
    ///
    /// `pod` is `None` when only the runtime still knows the pod.
    async fn kill_pod(
        &self,
        pod: Option<&Pod>,
        running_pod: &RunningPod,
        grace_period_override: Option<i64>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(errors: &[SyncError]) -> PodSyncResult {
        let mut result = PodSyncResult::default();
        for (i, e) in errors.iter().enumerate() {
            result.add(SyncResult::failed(
                SyncAction::StartContainer,
                format!("c{i}"),
                e.clone(),
                "boom",
            ));
        }
        result.add(SyncResult::ok(SyncAction::StartContainer, "ok"));
        result
    }

    #[test]
    fn backoff_only_failures_are_not_errors() {
        let result = result_with(&[SyncError::CrashLoopBackOff, SyncError::ImagePullBackOff]);
        assert!(result.error().is_some());
        assert!(result.error_ignoring_backoff().is_none());

        let result = result_with(&[SyncError::CrashLoopBackOff, SyncError::RunContainer]);
        let err = result.error_ignoring_backoff().unwrap();
        assert!(err.to_string().contains("RunContainerError"));

        assert!(result_with(&[]).error().is_none());
    }

    #[test]
    fn runtime_status_conditions() {
        let status = RuntimeStatus::healthy();
        assert!(status.condition(RUNTIME_READY).unwrap().status);
        assert!(status.condition(NETWORK_READY).unwrap().status);
        assert!(status.condition("Other").is_none());
    }
}
