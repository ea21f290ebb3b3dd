//! Helpers for reading the pod fields the sync core depends on.
//!
//! Pods are `k8s-openapi` objects owned by their config source. Everything in
//! this module is a read-only view over them, plus the constructor for the
//! mirror pod that represents a static pod in the API server.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use nodelet_core::PodUid;

use crate::error::{KubeletError, Result};

/// Annotation naming the config source a pod came from.
pub const CONFIG_SOURCE_ANNOTATION: &str = "kubernetes.io/config.source";
/// Annotation holding the RFC 3339 time the pod was first seen by this node.
pub const CONFIG_SEEN_ANNOTATION: &str = "kubernetes.io/config.seen";
/// Annotation marking a pod as the mirror of a static pod.
pub const CONFIG_MIRROR_ANNOTATION: &str = "kubernetes.io/config.mirror";
/// Annotation holding the content hash of a static pod.
pub const CONFIG_HASH_ANNOTATION: &str = "kubernetes.io/config.hash";

/// Pods coming from the API server.
pub const API_SERVER_SOURCE: &str = "api";
/// Pods read from a manifest directory.
pub const FILE_SOURCE: &str = "file";
/// Pods fetched from a manifest URL.
pub const HTTP_SOURCE: &str = "http";

/// Resource name for CPU.
pub const RESOURCE_CPU: &str = "cpu";
/// Resource name for memory.
pub const RESOURCE_MEMORY: &str = "memory";
/// Resource name for the pod count.
pub const RESOURCE_PODS: &str = "pods";

/// Restart policy of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Always restart containers.
    #[default]
    Always,
    /// Restart containers that exited non-zero.
    OnFailure,
    /// Never restart containers.
    Never,
}

impl RestartPolicy {
    /// Parse a restart policy, defaulting to `Always`.
    #[must_use]
    pub fn from_k8s(policy: Option<&str>) -> Self {
        match policy {
            Some("OnFailure") => Self::OnFailure,
            Some("Never") => Self::Never,
            _ => Self::Always,
        }
    }
}

/// Quality of service class of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosClass {
    /// Every container has equal CPU and memory requests and limits.
    Guaranteed,
    /// At least one container has a request or limit.
    Burstable,
    /// No container sets any request or limit.
    BestEffort,
}

impl QosClass {
    /// Kubernetes string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Guaranteed => "Guaranteed",
            Self::Burstable => "Burstable",
            Self::BestEffort => "BestEffort",
        }
    }
}

/// Aggregate resource requests of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodRequests {
    /// Requested CPU in millicores.
    pub cpu_millicores: u64,
    /// Requested memory in bytes.
    pub memory_bytes: u64,
    /// Requested extended resources (e.g. `example.com/gpu`) by name.
    pub extended: BTreeMap<String, i64>,
}

impl PodRequests {
    /// Add `other` to these totals, saturating at the integer bounds.
    pub fn add(&mut self, other: &PodRequests) {
        self.cpu_millicores = self.cpu_millicores.saturating_add(other.cpu_millicores);
        self.memory_bytes = self.memory_bytes.saturating_add(other.memory_bytes);
        for (name, count) in &other.extended {
            let entry = self.extended.entry(name.clone()).or_default();
            *entry = entry.saturating_add(*count);
        }
    }
}

/// Return the UID of a pod.
///
/// # Errors
///
/// Returns an error if the pod has no UID or the UID is malformed.
pub fn pod_uid(pod: &Pod) -> Result<PodUid> {
    let raw = pod
        .metadata
        .uid
        .as_deref()
        .ok_or_else(|| KubeletError::InvalidPod(format!("pod {} has no UID", pod_full_name(pod))))?;
    Ok(PodUid::new(raw)?)
}

/// The pod name, or an empty string.
#[must_use]
pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

/// The pod namespace, or `default`.
#[must_use]
pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("default")
}

/// Build the node-unique full name of a pod from its name and namespace.
#[must_use]
pub fn build_pod_full_name(name: &str, namespace: &str) -> String {
    format!("{name}_{namespace}")
}

/// The node-unique full name of a pod, `<name>_<namespace>`.
#[must_use]
pub fn pod_full_name(pod: &Pod) -> String {
    build_pod_full_name(pod_name(pod), pod_namespace(pod))
}

fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// The config source recorded on the pod.
#[must_use]
pub fn pod_source(pod: &Pod) -> Option<&str> {
    annotation(pod, CONFIG_SOURCE_ANNOTATION)
}

/// Whether the pod came from a node-local source rather than the API server.
#[must_use]
pub fn is_static_pod(pod: &Pod) -> bool {
    pod_source(pod).is_some_and(|source| source != API_SERVER_SOURCE)
}

/// Whether the pod is the API representation of a static pod.
#[must_use]
pub fn is_mirror_pod(pod: &Pod) -> bool {
    annotation(pod, CONFIG_MIRROR_ANNOTATION).is_some()
}

/// The hash identifying the static pod a mirror pod represents.
#[must_use]
pub fn static_pod_hash(pod: &Pod) -> Option<String> {
    annotation(pod, CONFIG_HASH_ANNOTATION)
        .map(ToString::to_string)
        .or_else(|| pod.metadata.uid.clone())
}

/// Whether `mirror` represents the current version of the static pod `pod`.
#[must_use]
pub fn is_mirror_pod_of(mirror: &Pod, pod: &Pod) -> bool {
    if pod_full_name(mirror) != pod_full_name(pod) {
        return false;
    }
    match (annotation(mirror, CONFIG_MIRROR_ANNOTATION), static_pod_hash(pod)) {
        (Some(mirror_hash), Some(hash)) => mirror_hash == hash,
        _ => false,
    }
}

/// Build the mirror pod for a static pod.
#[must_use]
pub fn build_mirror_pod(pod: &Pod, node_name: &str) -> Pod {
    let mut annotations = pod.metadata.annotations.clone().unwrap_or_default();
    annotations.insert(
        CONFIG_MIRROR_ANNOTATION.to_string(),
        static_pod_hash(pod).unwrap_or_default(),
    );

    let mut spec = pod.spec.clone().unwrap_or_default();
    spec.node_name = Some(node_name.to_string());

    Pod {
        metadata: ObjectMeta {
            name: pod.metadata.name.clone(),
            namespace: Some(pod_namespace(pod).to_string()),
            labels: pod.metadata.labels.clone(),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

/// The time the pod was first seen by its config source.
#[must_use]
pub fn first_seen_time(pod: &Pod) -> Option<DateTime<Utc>> {
    annotation(pod, CONFIG_SEEN_ANNOTATION)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Whether deletion of the pod was requested.
#[must_use]
pub fn is_deletion_requested(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Whether the pod uses the host network namespace.
#[must_use]
pub fn is_host_network(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.host_network)
        .unwrap_or(false)
}

/// The pod restart policy.
#[must_use]
pub fn restart_policy(pod: &Pod) -> RestartPolicy {
    RestartPolicy::from_k8s(pod.spec.as_ref().and_then(|s| s.restart_policy.as_deref()))
}

/// The regular containers of a pod.
#[must_use]
pub fn containers(pod: &Pod) -> &[Container] {
    pod.spec.as_ref().map_or(&[], |s| s.containers.as_slice())
}

/// The init containers of a pod.
#[must_use]
pub fn init_containers(pod: &Pod) -> &[Container] {
    pod.spec
        .as_ref()
        .and_then(|s| s.init_containers.as_deref())
        .unwrap_or(&[])
}

/// Names of the image pull secrets referenced by the pod.
#[must_use]
pub fn image_pull_secret_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .and_then(|s| s.image_pull_secrets.as_ref())
        .map(|refs| refs.iter().map(|r| r.name.clone()).collect())
        .unwrap_or_default()
}

/// Parse a CPU quantity into millicores.
#[must_use]
pub fn parse_cpu_millicores(quantity: &Quantity) -> Option<u64> {
    let raw = quantity.0.trim();
    if let Some(millis) = raw.strip_suffix('m') {
        return millis.parse::<f64>().ok().map(|m| to_u64(m.ceil()));
    }
    parse_scaled(raw).map(|cores| to_u64((cores * 1000.0).ceil()))
}

/// Parse a memory quantity into bytes.
#[must_use]
pub fn parse_memory_bytes(quantity: &Quantity) -> Option<u64> {
    parse_scaled(quantity.0.trim()).map(|bytes| to_u64(bytes.ceil()))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u64(value: f64) -> u64 {
    if value <= 0.0 {
        0
    } else {
        value as u64
    }
}

fn parse_scaled(raw: &str) -> Option<f64> {
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
        ("m", 1e-3),
    ];

    for (suffix, scale) in SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * scale);
        }
    }
    raw.parse::<f64>().ok()
}

fn container_requests(container: &Container) -> PodRequests {
    let mut requests = PodRequests::default();
    let Some(resources) = container.resources.as_ref() else {
        return requests;
    };
    // Limits stand in for missing requests, as the API server defaults them.
    let mut merged = resources.limits.clone().unwrap_or_default();
    merged.extend(resources.requests.clone().unwrap_or_default());

    for (name, quantity) in &merged {
        match name.as_str() {
            RESOURCE_CPU => requests.cpu_millicores = parse_cpu_millicores(quantity).unwrap_or(0),
            RESOURCE_MEMORY => requests.memory_bytes = parse_memory_bytes(quantity).unwrap_or(0),
            other if is_extended_resource(other) => {
                let count = quantity.0.trim().parse::<i64>().unwrap_or(0);
                requests.extended.insert(other.to_string(), count);
            }
            _ => {}
        }
    }
    requests
}

/// Whether a resource name is an extended (vendor-domain) resource.
#[must_use]
pub fn is_extended_resource(name: &str) -> bool {
    name.contains('/') && !name.starts_with("kubernetes.io/")
}

/// Compute the effective resource requests of a pod.
///
/// Regular containers are summed; each init container runs alone, so the
/// effective request is the maximum of that sum and any single init container.
#[must_use]
pub fn pod_requests(pod: &Pod) -> PodRequests {
    let mut total = PodRequests::default();
    for container in containers(pod) {
        let r = container_requests(container);
        total.add(&r);
    }

    for init in init_containers(pod) {
        let r = container_requests(init);
        total.cpu_millicores = total.cpu_millicores.max(r.cpu_millicores);
        total.memory_bytes = total.memory_bytes.max(r.memory_bytes);
        for (name, count) in r.extended {
            let entry = total.extended.entry(name).or_default();
            *entry = (*entry).max(count);
        }
    }
    total
}

/// Compute the QoS class of a pod.
#[must_use]
pub fn qos_class(pod: &Pod) -> QosClass {
    let mut any_set = false;
    let mut guaranteed = true;

    for container in init_containers(pod).iter().chain(containers(pod)) {
        let resources = container.resources.as_ref();
        let requests = resources.and_then(|r| r.requests.as_ref());
        let limits = resources.and_then(|r| r.limits.as_ref());

        if requests.is_some_and(|r| !r.is_empty()) || limits.is_some_and(|l| !l.is_empty()) {
            any_set = true;
        }

        for name in [RESOURCE_CPU, RESOURCE_MEMORY] {
            let limit = limits.and_then(|l| l.get(name));
            let request = requests.and_then(|r| r.get(name));
            match (limit, request) {
                (Some(limit), Some(request)) if limit != request => guaranteed = false,
                (None, _) => guaranteed = false,
                _ => {}
            }
        }
    }

    if !any_set {
        QosClass::BestEffort
    } else if guaranteed {
        QosClass::Guaranteed
    } else {
        QosClass::Burstable
    }
}
