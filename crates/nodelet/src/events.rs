//! Recorder events emitted on failure paths.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Informational.
    Normal,
    /// Something went wrong.
    Warning,
}

impl EventType {
    /// Kubernetes string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Event reasons.
pub mod reasons {
    /// The pod's containers could not be killed.
    pub const FAILED_TO_KILL_POD: &str = "FailedKillPod";
    /// The pod network is not ready.
    pub const NETWORK_NOT_READY: &str = "NetworkNotReady";
    /// The pod cgroups could not be created.
    pub const FAILED_TO_CREATE_POD_CONTAINER: &str = "FailedCreatePodContainer";
    /// The pod data directories could not be created.
    pub const FAILED_TO_MAKE_POD_DATA_DIRECTORIES: &str = "Failed";
    /// Volumes did not attach or mount.
    pub const FAILED_MOUNT_VOLUME: &str = "FailedMount";
    /// A sync of the pod failed.
    pub const FAILED_SYNC: &str = "FailedSync";
    /// Image garbage collection keeps failing.
    pub const IMAGE_GC_FAILED: &str = "ImageGCFailed";
    /// Container garbage collection failed.
    pub const CONTAINER_GC_FAILED: &str = "ContainerGCFailed";
    /// The pod was killed after exceeding its active deadline.
    pub const DEADLINE_EXCEEDED: &str = "DeadlineExceeded";
}

/// Sink for events about pods and the node.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Record an event about a pod.
    async fn pod_event(&self, pod: &Pod, event_type: EventType, reason: &str, message: &str);

    /// Record an event about the node itself.
    async fn node_event(&self, event_type: EventType, reason: &str, message: &str);
}
