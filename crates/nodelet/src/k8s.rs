//! Collaborators backed by the Kubernetes API server.
//!
//! Each type wraps a [`kube::Client`] and implements one of the seams the
//! sync core talks to: pod status patches, mirror pods, events, image pull
//! secrets, and the `api` pod config source.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, Pod, PodStatus, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams, Preconditions};
use kube::runtime::watcher::{self, watcher, Config as WatcherConfig};
use kube::Client;
use serde_json::json;
use tracing::{debug, error, info, warn};

use nodelet_core::PodUid;

use crate::collaborators::{MirrorClient, SecretProvider};
use crate::error::{KubeletError, Result};
use crate::events::{EventRecorder, EventType};
use crate::pod::{self, API_SERVER_SOURCE};
use crate::pod_config::{PodConfig, PodOperation, PodUpdate};
use crate::status_manager::StatusSink;

/// Component name reported on events.
pub const COMPONENT: &str = "nodelet";

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

/// Pushes pod statuses with merge patches on the status subresource.
#[derive(Clone)]
pub struct KubeStatusSink {
    client: Client,
}

impl KubeStatusSink {
    /// Create a sink over `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Body of a status merge patch.
#[must_use]
pub fn status_patch(status: &PodStatus) -> serde_json::Value {
    json!({ "status": status })
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn patch_pod_status(&self, pod: &Pod, status: &PodStatus) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), pod::pod_namespace(pod));
        let name = pod::pod_name(pod);
        match pods
            .patch_status(name, &PatchParams::default(), &Patch::Merge(status_patch(status)))
            .await
        {
            Ok(_) => {
                debug!(pod = %pod::pod_full_name(pod), "Patched pod status");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(pod = %pod::pod_full_name(pod), "Pod no longer exists, dropping status");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Creates and deletes mirror pods for static pods.
#[derive(Clone)]
pub struct KubeMirrorClient {
    client: Client,
    node_name: String,
}

impl KubeMirrorClient {
    /// Create a client binding mirror pods to `node_name`.
    #[must_use]
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl MirrorClient for KubeMirrorClient {
    async fn create_mirror_pod(&self, pod: &Pod) -> Result<()> {
        let mirror = pod::build_mirror_pod(pod, &self.node_name);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), pod::pod_namespace(pod));
        match pods.create(&PostParams::default(), &mirror).await {
            Ok(_) => {
                info!(pod = %pod::pod_full_name(pod), "Created mirror pod");
                Ok(())
            }
            Err(e) if is_conflict(&e) => {
                debug!(pod = %pod::pod_full_name(pod), "Mirror pod already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_mirror_pod(&self, name: &str, namespace: &str, uid: Option<&PodUid>) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..DeleteParams::default()
        };
        match pods.delete(name, &params).await {
            Ok(_) => {
                info!(pod = %pod::build_pod_full_name(name, namespace), "Deleted mirror pod");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                warn!(pod = %pod::build_pod_full_name(name, namespace), "Mirror pod not found, already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Records core/v1 events.
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    node_name: String,
}

impl KubeEventRecorder {
    /// Create a recorder reporting from `node_name`.
    #[must_use]
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }

    async fn create(&self, event: Event) {
        let namespace = event
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(e) = events.create(&PostParams::default(), &event).await {
            warn!(
                reason = event.reason.as_deref().unwrap_or_default(),
                error = %e,
                "Failed to record event"
            );
        }
    }
}

/// Build an event about `involved_object` reported by `node_name`.
#[must_use]
pub fn build_event(
    involved_object: ObjectReference,
    node_name: &str,
    event_type: EventType,
    reason: &str,
    message: &str,
) -> Event {
    let now = Time(Utc::now());
    let namespace = involved_object
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let prefix = involved_object.name.clone().unwrap_or_else(|| node_name.to_string());
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{prefix}.")),
            namespace: Some(namespace),
            ..ObjectMeta::default()
        },
        involved_object,
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        type_: Some(event_type.as_str().to_string()),
        source: Some(EventSource {
            component: Some(COMPONENT.to_string()),
            host: Some(node_name.to_string()),
        }),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        count: Some(1),
        ..Event::default()
    }
}

fn pod_reference(pod: &Pod) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Pod".to_string()),
        name: pod.metadata.name.clone(),
        namespace: Some(pod::pod_namespace(pod).to_string()),
        uid: pod.metadata.uid.clone(),
        ..ObjectReference::default()
    }
}

fn node_reference(node_name: &str) -> ObjectReference {
    ObjectReference {
        kind: Some("Node".to_string()),
        name: Some(node_name.to_string()),
        uid: Some(node_name.to_string()),
        ..ObjectReference::default()
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn pod_event(&self, pod: &Pod, event_type: EventType, reason: &str, message: &str) {
        self.create(build_event(pod_reference(pod), &self.node_name, event_type, reason, message))
            .await;
    }

    async fn node_event(&self, event_type: EventType, reason: &str, message: &str) {
        self.create(build_event(
            node_reference(&self.node_name),
            &self.node_name,
            event_type,
            reason,
            message,
        ))
        .await;
    }
}

/// Reads image pull secrets.
#[derive(Clone)]
pub struct KubeSecretProvider {
    client: Client,
}

impl KubeSecretProvider {
    /// Create a provider over `client`.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretProvider for KubeSecretProvider {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        secrets.get(name).await.map_err(|e| KubeletError::PullSecret {
            namespace: namespace.to_string(),
            name: name.to_string(),
            message: e.to_string(),
        })
    }
}

/// Feeds the pods bound to this node into [`PodConfig`] as the `api` source.
pub struct KubePodSource {
    client: Client,
    node_name: String,
    config: Arc<PodConfig>,
}

impl KubePodSource {
    /// Create a source for pods scheduled to `node_name`.
    #[must_use]
    pub fn new(client: Client, node_name: impl Into<String>, config: Arc<PodConfig>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            config,
        }
    }

    /// Watch the pods of this node until the watch stream ends.
    ///
    /// Every (re)list is delivered as one SET, later changes as UPDATE or
    /// REMOVE.
    pub async fn run(&self) {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let watch_config = WatcherConfig::default().fields(&format!("spec.nodeName={}", self.node_name));
        let watch = watcher(pods, watch_config);
        futures::pin_mut!(watch);

        info!(node = %self.node_name, "Starting API server pod source");

        let mut listed: Vec<Arc<Pod>> = Vec::new();
        while let Some(event) = watch.next().await {
            let update = match event {
                Ok(watcher::Event::Init) => {
                    listed.clear();
                    continue;
                }
                Ok(watcher::Event::InitApply(pod)) => {
                    listed.push(Arc::new(pod));
                    continue;
                }
                Ok(watcher::Event::InitDone) => {
                    debug!(count = listed.len(), "Pod list complete");
                    PodUpdate::new(API_SERVER_SOURCE, PodOperation::Set, std::mem::take(&mut listed))
                }
                Ok(watcher::Event::Apply(pod)) => {
                    PodUpdate::new(API_SERVER_SOURCE, PodOperation::Update, vec![Arc::new(pod)])
                }
                Ok(watcher::Event::Delete(pod)) => {
                    PodUpdate::new(API_SERVER_SOURCE, PodOperation::Remove, vec![Arc::new(pod)])
                }
                Err(e) => {
                    error!(error = %e, "Pod watch error, will retry");
                    continue;
                }
            };
            if let Err(e) = self.config.merge(API_SERVER_SOURCE, update).await {
                error!(error = %e, "Pod config closed, stopping API server pod source");
                return;
            }
        }

        warn!("API server pod source exited unexpectedly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn pod_event_references_the_pod() {
        let pod = testing::pod("uid-1", "web");
        let event = build_event(
            pod_reference(&pod),
            "node-1",
            EventType::Warning,
            "FailedMount",
            "timed out",
        );

        assert_eq!(event.metadata.generate_name.as_deref(), Some("web."));
        assert_eq!(event.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(event.involved_object.kind.as_deref(), Some("Pod"));
        assert_eq!(event.involved_object.uid.as_deref(), Some("uid-1"));
        assert_eq!(event.type_.as_deref(), Some("Warning"));
        assert_eq!(event.reason.as_deref(), Some("FailedMount"));
        assert_eq!(
            event.source.and_then(|s| s.host).as_deref(),
            Some("node-1")
        );
        assert_eq!(event.count, Some(1));
    }

    #[test]
    fn node_event_lands_in_default_namespace() {
        let event = build_event(
            node_reference("node-1"),
            "node-1",
            EventType::Normal,
            "NodeReady",
            "ready",
        );
        assert_eq!(event.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(event.metadata.generate_name.as_deref(), Some("node-1."));
        assert_eq!(event.involved_object.kind.as_deref(), Some("Node"));
    }

    #[test]
    fn status_patch_wraps_status() {
        let status = PodStatus {
            phase: Some("Running".to_string()),
            ..PodStatus::default()
        };
        let patch = status_patch(&status);
        assert_eq!(patch["status"]["phase"], "Running");
    }
}
