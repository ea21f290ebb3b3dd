//! Error types for the node agent sync core.

use nodelet_core::{CoreError, IdError, PodUid};
use thiserror::Error;

/// Message prefix used when the pod network is not ready.
pub const NETWORK_NOT_READY_ERROR_MSG: &str = "network is not ready";

/// Errors that can occur while syncing pods on this node.
#[derive(Error, Debug)]
pub enum KubeletError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// The container runtime returned an error.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// The runtime reported aggregate per-container failures for a pod sync.
    #[error("failed to sync pod: {0}")]
    RuntimeSync(String),

    /// The pod network is not ready and the pod does not use the host network.
    #[error("{NETWORK_NOT_READY_ERROR_MSG}: {0}")]
    NetworkNotReady(String),

    /// A soft admit handler blocked the pod from running.
    #[error("pod cannot be run: {0}")]
    PodNotRunnable(String),

    /// Killing the pod's containers failed.
    #[error("error killing pod: {0}")]
    KillPod(String),

    /// The pod's cgroup sandbox could not be created.
    #[error("failed to ensure that the pod {uid} cgroups exist and are correctly applied: {message}")]
    CgroupSetup {
        /// The pod whose cgroups could not be created.
        uid: PodUid,
        /// Error reported by the container manager.
        message: String,
    },

    /// The pod's data directories could not be created.
    #[error("unable to make pod data directories for pod {uid}: {source}")]
    DataDirectories {
        /// The pod whose directories could not be created.
        uid: PodUid,
        /// Underlying filesystem error.
        #[source]
        source: std::io::Error,
    },

    /// Volumes did not attach or mount.
    #[error("unable to attach or mount volumes for pod {uid}: {message}")]
    VolumeMount {
        /// The pod whose volumes failed.
        uid: PodUid,
        /// Error reported by the volume manager.
        message: String,
    },

    /// An image pull secret could not be read.
    #[error("failed to get image pull secret {namespace}/{name}: {message}")]
    PullSecret {
        /// Namespace of the secret.
        namespace: String,
        /// Name of the secret.
        name: String,
        /// Error reported by the API server.
        message: String,
    },

    /// The runtime status of a pod could not be determined.
    #[error("unable to get pod status: {0}")]
    PodStatus(String),

    /// The pod could not be represented with the fields the core needs.
    #[error("invalid pod: {0}")]
    InvalidPod(String),

    /// The configured container runtime is not supported.
    #[error("unsupported container runtime: {0}")]
    UnsupportedRuntime(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A metric could not be registered.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Timed out waiting for an operation.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Filesystem error outside of a pod sync.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core error.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<IdError> for KubeletError {
    fn from(err: IdError) -> Self {
        Self::Core(CoreError::InvalidId(err))
    }
}

impl KubeletError {
    /// Check if this error is retried by a later sync of the same pod.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        !self.is_process_fatal() && !matches!(self, Self::InvalidPod(_) | Self::Core(_))
    }

    /// Check if this error indicates a misconfiguration the process cannot
    /// recover from.
    #[must_use]
    pub const fn is_process_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedRuntime(_) | Self::Config(_) | Self::Metrics(_)
        )
    }
}

/// A specialized Result type for sync core operations.
pub type Result<T> = std::result::Result<T, KubeletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        let uid = PodUid::new("pod-1").unwrap();

        assert!(KubeletError::NetworkNotReady("cni".into()).is_retriable());
        assert!(KubeletError::VolumeMount {
            uid: uid.clone(),
            message: "timeout".into()
        }
        .is_retriable());
        assert!(KubeletError::CgroupSetup {
            uid,
            message: "eperm".into()
        }
        .is_retriable());

        let fatal = KubeletError::UnsupportedRuntime("rkt".into());
        assert!(fatal.is_process_fatal());
        assert!(!fatal.is_retriable());
    }

    #[test]
    fn network_error_message_has_prefix() {
        let err = KubeletError::NetworkNotReady("cni config uninitialized".into());
        assert!(err.to_string().starts_with(NETWORK_NOT_READY_ERROR_MSG));
    }
}
