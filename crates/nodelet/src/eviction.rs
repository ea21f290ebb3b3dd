//! Contract of the eviction manager.
//!
//! The eviction manager monitors node resources on its own loop and kills
//! pods through the callbacks the sync core hands it at start-up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Pod;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::types::PodStatusFn;

/// Node resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Available memory in bytes.
    pub memory_available_bytes: Option<u64>,
    /// Available bytes on the node root filesystem.
    pub fs_available_bytes: Option<u64>,
    /// Available inodes on the node root filesystem.
    pub fs_inodes_free: Option<u64>,
}

/// Supplies node resource usage.
#[async_trait]
pub trait StatsProvider: Send + Sync {
    /// Current node usage.
    async fn node_stats(&self) -> Result<NodeStats>;
}

/// Returns the pods that are admitted and not terminated.
pub type ActivePodsFn = Arc<dyn Fn() -> Vec<Arc<Pod>> + Send + Sync>;

/// Reports whether every resource of a pod has been reclaimed.
pub type PodCleanedUpFn = Arc<dyn Fn(Arc<Pod>) -> BoxFuture<'static, bool> + Send + Sync>;

/// Kills a pod, publishing the status adjusted by the status function, with
/// an optional grace period override in seconds.
pub type KillPodFn =
    Arc<dyn Fn(Arc<Pod>, PodStatusFn, Option<i64>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Callbacks the eviction manager drives.
#[derive(Clone)]
pub struct EvictionCallbacks {
    /// Active pods.
    pub active_pods: ActivePodsFn,
    /// Cleanup predicate.
    pub pod_cleaned_up: PodCleanedUpFn,
    /// Kill primitive.
    pub kill_pod: KillPodFn,
}

impl std::fmt::Debug for EvictionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionCallbacks").finish_non_exhaustive()
    }
}

/// Proactively kills pods to relieve node resource pressure.
pub trait EvictionManager: Send + Sync {
    /// Spawn the monitoring loop.
    fn start(
        &self,
        stats: Arc<dyn StatsProvider>,
        callbacks: EvictionCallbacks,
        monitoring_period: Duration,
    ) -> JoinHandle<()>;
}
