//! Configuration and the value objects passed between the sync loop and the
//! pod workers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use serde::{Deserialize, Serialize};

use crate::error::{KubeletError, Result};
use crate::runtime::RuntimePodStatus;

/// Container runtime types the node agent can drive.
pub const SUPPORTED_RUNTIMES: &[&str] = &["remote", "docker"];

/// Phase of the pod lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PodPhase {
    /// Pod has been accepted but containers are not yet running.
    #[default]
    Pending,
    /// Pod is running with at least one container.
    Running,
    /// All containers terminated successfully.
    Succeeded,
    /// At least one container failed.
    Failed,
    /// Pod status cannot be determined.
    Unknown,
}

impl PodPhase {
    /// Parse a pod phase from a Kubernetes phase string.
    #[must_use]
    pub fn from_k8s_phase(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Phase of an API status, `Pending` when unset.
    #[must_use]
    pub fn of(status: &PodStatus) -> Self {
        status
            .phase
            .as_deref()
            .map_or(Self::Pending, Self::from_k8s_phase)
    }

    /// Kubernetes string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if the pod is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources the node offers to pods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeAllocatable {
    /// Allocatable CPU in millicores.
    pub cpu_millicores: u64,
    /// Allocatable memory in bytes.
    pub memory_bytes: u64,
    /// Maximum number of pods.
    pub max_pods: usize,
    /// Extended resources such as `example.com/gpu`.
    pub extended: BTreeMap<String, i64>,
}

impl Default for NodeAllocatable {
    fn default() -> Self {
        Self {
            cpu_millicores: 4000,
            memory_bytes: 8 * 1024 * 1024 * 1024,
            max_pods: 110,
            extended: BTreeMap::new(),
        }
    }
}

/// Configuration for the node agent sync core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeletConfig {
    /// Name of this node.
    pub node_name: String,
    /// Primary IP of this node, used as the host IP in pod statuses.
    pub node_ip: Option<String>,
    /// Root directory for per-pod state.
    pub root_dir: PathBuf,
    /// How often a healthy pod is re-synced.
    pub sync_frequency: Duration,
    /// Period of the sync-loop ticker.
    pub sync_loop_period: Duration,
    /// Period of the housekeeping ticker.
    pub housekeeping_period: Duration,
    /// How often runtime health is checked.
    pub runtime_check_period: Duration,
    /// Initial sleep when the runtime is unhealthy.
    pub loop_backoff_base: Duration,
    /// Maximum sleep when the runtime is unhealthy.
    pub loop_backoff_max: Duration,
    /// Base requeue delay after a failed pod sync.
    pub worker_error_backoff: Duration,
    /// Container garbage collection period.
    pub container_gc_period: Duration,
    /// Image garbage collection period.
    pub image_gc_period: Duration,
    /// Eviction monitoring period.
    pub eviction_monitoring_period: Duration,
    /// Initial container restart / image pull backoff.
    pub restart_backoff_initial: Duration,
    /// Maximum container restart / image pull backoff.
    pub restart_backoff_max: Duration,
    /// Config sources that must report before housekeeping runs.
    pub config_sources: Vec<String>,
    /// Configured container runtime type.
    pub runtime_type: String,
    /// PLEG relist period.
    pub pleg_relist_period: Duration,
    /// Capacity of the PLEG event channel.
    pub pleg_channel_capacity: usize,
    /// Capacity of the reason cache.
    pub reason_cache_capacity: usize,
    /// Node allocatable resources.
    pub allocatable: NodeAllocatable,
    /// Whether the runtime honours `no_new_privs`.
    pub no_new_privs_supported: bool,
}

impl Default for KubeletConfig {
    fn default() -> Self {
        Self {
            node_name: "localhost".to_string(),
            node_ip: None,
            root_dir: PathBuf::from("/var/lib/nodelet"),
            sync_frequency: Duration::from_secs(60),
            sync_loop_period: Duration::from_secs(1),
            housekeeping_period: Duration::from_secs(2),
            runtime_check_period: Duration::from_secs(5),
            loop_backoff_base: Duration::from_millis(100),
            loop_backoff_max: Duration::from_secs(5),
            worker_error_backoff: Duration::from_secs(10),
            container_gc_period: Duration::from_secs(60),
            image_gc_period: Duration::from_secs(300),
            eviction_monitoring_period: Duration::from_secs(10),
            restart_backoff_initial: Duration::from_secs(10),
            restart_backoff_max: Duration::from_secs(300),
            config_sources: vec![crate::pod::API_SERVER_SOURCE.to_string()],
            runtime_type: "remote".to_string(),
            pleg_relist_period: Duration::from_secs(1),
            pleg_channel_capacity: 1000,
            reason_cache_capacity: 1000,
            allocatable: NodeAllocatable::default(),
            no_new_privs_supported: true,
        }
    }
}

fn env_duration_secs(name: &str, target: &mut Duration) {
    if let Some(secs) = std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok()) {
        *target = Duration::from_secs(secs);
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Some(val) = std::env::var(name).ok().and_then(|v| v.parse::<T>().ok()) {
        *target = val;
    }
}

impl KubeletConfig {
    /// Create a config for the given node.
    #[must_use]
    pub fn for_node(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `NODELET_NODE_NAME`, `NODELET_NODE_IP`, `NODELET_ROOT_DIR`
    /// - `NODELET_SYNC_FREQUENCY_SECS`, `NODELET_HOUSEKEEPING_PERIOD_SECS`
    /// - `NODELET_CONTAINER_GC_PERIOD_SECS`, `NODELET_IMAGE_GC_PERIOD_SECS`
    /// - `NODELET_EVICTION_PERIOD_SECS`
    /// - `NODELET_CONFIG_SOURCES`: comma separated list, e.g. `api,file`
    /// - `NODELET_RUNTIME_TYPE`
    /// - `NODELET_MAX_PODS`, `NODELET_ALLOCATABLE_CPU_MILLICORES`,
    ///   `NODELET_ALLOCATABLE_MEMORY_BYTES`
    /// - `NODELET_EXTENDED_RESOURCES`: `name=count` pairs, comma separated
    /// - `NODELET_NO_NEW_PRIVS_SUPPORTED`
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("NODELET_NODE_NAME") {
            config.node_name = val;
        }
        if let Ok(val) = std::env::var("NODELET_NODE_IP") {
            config.node_ip = Some(val);
        }
        if let Ok(val) = std::env::var("NODELET_ROOT_DIR") {
            config.root_dir = PathBuf::from(val);
        }
        env_duration_secs("NODELET_SYNC_FREQUENCY_SECS", &mut config.sync_frequency);
        env_duration_secs("NODELET_HOUSEKEEPING_PERIOD_SECS", &mut config.housekeeping_period);
        env_duration_secs("NODELET_CONTAINER_GC_PERIOD_SECS", &mut config.container_gc_period);
        env_duration_secs("NODELET_IMAGE_GC_PERIOD_SECS", &mut config.image_gc_period);
        env_duration_secs("NODELET_EVICTION_PERIOD_SECS", &mut config.eviction_monitoring_period);
        if let Ok(val) = std::env::var("NODELET_CONFIG_SOURCES") {
            config.config_sources = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Ok(val) = std::env::var("NODELET_RUNTIME_TYPE") {
            config.runtime_type = val.to_lowercase();
        }
        env_parse("NODELET_MAX_PODS", &mut config.allocatable.max_pods);
        env_parse(
            "NODELET_ALLOCATABLE_CPU_MILLICORES",
            &mut config.allocatable.cpu_millicores,
        );
        env_parse(
            "NODELET_ALLOCATABLE_MEMORY_BYTES",
            &mut config.allocatable.memory_bytes,
        );
        if let Ok(val) = std::env::var("NODELET_EXTENDED_RESOURCES") {
            for pair in val.split(',') {
                if let Some((name, count)) = pair.split_once('=') {
                    if let Ok(count) = count.trim().parse() {
                        config.allocatable.extended.insert(name.trim().to_string(), count);
                    }
                }
            }
        }
        env_parse(
            "NODELET_NO_NEW_PRIVS_SUPPORTED",
            &mut config.no_new_privs_supported,
        );

        config
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`KubeletError::UnsupportedRuntime`] for an unknown runtime type
    /// and [`KubeletError::Config`] for inconsistent periods.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_RUNTIMES.contains(&self.runtime_type.as_str()) {
            return Err(KubeletError::UnsupportedRuntime(self.runtime_type.clone()));
        }
        if self.node_name.is_empty() {
            return Err(KubeletError::Config("node name must not be empty".into()));
        }
        if self.sync_loop_period.is_zero() || self.housekeeping_period.is_zero() {
            return Err(KubeletError::Config(
                "sync loop and housekeeping periods must be non-zero".into(),
            ));
        }
        if self.loop_backoff_base > self.loop_backoff_max {
            return Err(KubeletError::Config(format!(
                "loop backoff base {:?} exceeds maximum {:?}",
                self.loop_backoff_base, self.loop_backoff_max
            )));
        }
        if self.restart_backoff_initial > self.restart_backoff_max {
            return Err(KubeletError::Config(format!(
                "restart backoff {:?} exceeds maximum {:?}",
                self.restart_backoff_initial, self.restart_backoff_max
            )));
        }
        if self.pleg_channel_capacity == 0 || self.reason_cache_capacity == 0 {
            return Err(KubeletError::Config(
                "PLEG channel and reason cache capacities must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Kind of work a pod update requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPodType {
    /// The pod is new to this node.
    Create,
    /// The pod's desired spec changed.
    Update,
    /// Periodic or event-driven re-sync.
    Sync,
    /// The pod must be torn down.
    Kill,
}

impl SyncPodType {
    /// Label used for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Sync => "sync",
            Self::Kill => "kill",
        }
    }
}

impl fmt::Display for SyncPodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutates the API status published for a pod that is being killed.
pub type PodStatusFn = Arc<dyn Fn(&mut PodStatus) + Send + Sync>;

/// Invoked once a pod update has been processed, with the sync error if any.
pub type OnCompleteFn = Box<dyn FnOnce(Option<&KubeletError>) + Send>;

/// Options for a KILL update.
#[derive(Clone, Default)]
pub struct KillPodOptions {
    /// Adjusts the status published while killing, e.g. for eviction.
    pub pod_status_fn: Option<PodStatusFn>,
    /// Overrides the pod's termination grace period, in seconds.
    pub pod_termination_grace_period_seconds_override: Option<i64>,
}

impl fmt::Debug for KillPodOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KillPodOptions")
            .field("pod_status_fn", &self.pod_status_fn.is_some())
            .field(
                "grace_period_override",
                &self.pod_termination_grace_period_seconds_override,
            )
            .finish()
    }
}

/// A unit of work handed to a pod worker.
pub struct UpdatePodOptions {
    /// Desired pod.
    pub pod: Arc<Pod>,
    /// Mirror pod of a static pod, if any.
    pub mirror_pod: Option<Arc<Pod>>,
    /// Kind of update.
    pub update_type: SyncPodType,
    /// Options for KILL updates.
    pub kill_pod_options: Option<KillPodOptions>,
    /// Completion callback.
    pub on_complete: Option<OnCompleteFn>,
}

impl UpdatePodOptions {
    /// Create an update without kill options or a completion callback.
    #[must_use]
    pub fn new(pod: Arc<Pod>, mirror_pod: Option<Arc<Pod>>, update_type: SyncPodType) -> Self {
        Self {
            pod,
            mirror_pod,
            update_type,
            kill_pod_options: None,
            on_complete: None,
        }
    }
}

impl fmt::Debug for UpdatePodOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdatePodOptions")
            .field("pod", &crate::pod::pod_full_name(&self.pod))
            .field("update_type", &self.update_type)
            .field("kill_pod_options", &self.kill_pod_options)
            .field("on_complete", &self.on_complete.is_some())
            .finish_non_exhaustive()
    }
}

/// Arguments of a single sync invocation.
#[derive(Debug, Clone)]
pub struct SyncPodOptions {
    /// Desired pod.
    pub pod: Arc<Pod>,
    /// Mirror pod of a static pod, if any.
    pub mirror_pod: Option<Arc<Pod>>,
    /// Runtime-observed status.
    pub pod_status: Arc<RuntimePodStatus>,
    /// Kind of update.
    pub update_type: SyncPodType,
    /// Options for KILL updates.
    pub kill_pod_options: Option<KillPodOptions>,
}
