//! Capability traits for the subsystems a pod sync calls into.
//!
//! Each trait is implemented by a concrete subsystem (volume plugins, the
//! cgroup manager, the API server clients in [`crate::k8s`]) and by the fakes
//! in `testing`.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use nodelet_core::PodUid;

use crate::error::Result;

/// Attaches and mounts pod volumes.
#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Wait until every volume the pod needs is attached and mounted.
    ///
    /// The implementation owns the timeout.
    async fn wait_for_attach_and_mount(&self, pod: &Pod) -> Result<()>;

    /// Whether any volume of the pod is still mounted.
    async fn pod_volumes_exist(&self, uid: &PodUid) -> bool;
}

/// Manages the QoS and per-pod cgroup hierarchy.
#[async_trait]
pub trait ContainerManager: Send + Sync {
    /// Reconcile the QoS-level cgroups.
    async fn update_qos_cgroups(&self) -> Result<()>;

    /// Whether the pod's cgroup exists.
    async fn pod_cgroup_exists(&self, pod: &Pod) -> bool;

    /// Create the pod's cgroup if missing and apply its limits.
    async fn ensure_pod_cgroup(&self, pod: &Pod) -> Result<()>;

    /// UIDs of every pod cgroup present on the node.
    async fn pod_cgroups(&self) -> Result<Vec<PodUid>>;

    /// Remove the cgroup of a pod that is gone.
    async fn destroy_pod_cgroup(&self, uid: &PodUid) -> Result<()>;
}

/// Resolves image pull secrets.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Fetch a secret.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;
}

/// Creates and deletes mirror pods in the API server.
#[async_trait]
pub trait MirrorClient: Send + Sync {
    /// Create the mirror pod of a static pod.
    async fn create_mirror_pod(&self, pod: &Pod) -> Result<()>;

    /// Delete the mirror pod with the given name and namespace.
    ///
    /// With `uid` set, only that exact mirror pod is deleted.
    async fn delete_mirror_pod(&self, name: &str, namespace: &str, uid: Option<&PodUid>)
        -> Result<()>;
}
