//! Merging of pod config sources.
//!
//! Every source (API server, manifest directory, manifest URL) reports its
//! pods independently. [`PodConfig`] keeps a per-source snapshot and turns raw
//! source updates into the incremental operations the sync loop consumes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use nodelet_core::{CoreError, PodUid};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::pod;

/// Kind of a config update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodOperation {
    /// The pods are the complete state of the source.
    Set,
    /// The pods are new.
    Add,
    /// The pods changed.
    Update,
    /// The pods are gone from the source.
    Remove,
    /// The pods were marked for graceful deletion.
    Delete,
    /// Only the pods' status differs from what the node reported.
    Reconcile,
    /// The pods were restored from a checkpoint.
    Restore,
}

impl fmt::Display for PodOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Set => "SET",
            Self::Add => "ADD",
            Self::Update => "UPDATE",
            Self::Remove => "REMOVE",
            Self::Delete => "DELETE",
            Self::Reconcile => "RECONCILE",
            Self::Restore => "RESTORE",
        };
        f.write_str(op)
    }
}

/// A set of pods from one source with the operation applied to them.
#[derive(Debug, Clone)]
pub struct PodUpdate {
    /// Pods affected.
    pub pods: Vec<Arc<Pod>>,
    /// Operation.
    pub op: PodOperation,
    /// Source name.
    pub source: String,
}

impl PodUpdate {
    /// Create an update.
    #[must_use]
    pub fn new(source: impl Into<String>, op: PodOperation, pods: Vec<Arc<Pod>>) -> Self {
        Self {
            pods,
            op,
            source: source.into(),
        }
    }
}

/// Tracks which config sources have delivered at least one update.
#[derive(Debug)]
pub struct SourcesReady {
    expected: HashSet<String>,
    seen: RwLock<HashSet<String>>,
}

impl SourcesReady {
    /// Create a tracker waiting for `expected` sources.
    #[must_use]
    pub fn new<I, S>(expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            expected: expected.into_iter().map(Into::into).collect(),
            seen: RwLock::new(HashSet::new()),
        }
    }

    /// Record that `source` delivered an update.
    pub fn add_source(&self, source: &str) {
        if !self.seen.read().contains(source) {
            self.seen.write().insert(source.to_string());
        }
    }

    /// Whether every expected source has been seen.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        let seen = self.seen.read();
        self.expected.iter().all(|s| seen.contains(s))
    }
}

#[derive(Debug, Default)]
struct Changes {
    adds: Vec<Arc<Pod>>,
    updates: Vec<Arc<Pod>>,
    deletes: Vec<Arc<Pod>>,
    removes: Vec<Arc<Pod>>,
    reconciles: Vec<Arc<Pod>>,
    restores: Vec<Arc<Pod>>,
}

fn annotate(pod: &Pod, source: &str, seen: Option<String>) -> Pod {
    let mut pod = pod.clone();
    let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(pod::CONFIG_SOURCE_ANNOTATION.to_string(), source.to_string());
    let seen = seen.unwrap_or_else(|| Utc::now().to_rfc3339());
    annotations.insert(pod::CONFIG_SEEN_ANNOTATION.to_string(), seen);
    pod
}

fn seen_annotation(pod: &Pod) -> Option<String> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(pod::CONFIG_SEEN_ANNOTATION))
        .cloned()
}

/// Whether the two versions differ in anything but status.
fn spec_changed(old: &Pod, new: &Pod) -> bool {
    old.spec != new.spec
        || old.metadata.labels != new.metadata.labels
        || old.metadata.annotations != new.metadata.annotations
        || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
        || old.metadata.deletion_grace_period_seconds != new.metadata.deletion_grace_period_seconds
}

/// Per-source pod store producing incremental updates.
#[derive(Debug)]
pub struct PodConfig {
    sender: mpsc::Sender<PodUpdate>,
    pods: Mutex<HashMap<String, HashMap<PodUid, Arc<Pod>>>>,
    sources_seen: RwLock<HashSet<String>>,
}

impl PodConfig {
    /// Create a merger emitting updates on `sender`.
    #[must_use]
    pub fn new(sender: mpsc::Sender<PodUpdate>) -> Self {
        Self {
            sender,
            pods: Mutex::new(HashMap::new()),
            sources_seen: RwLock::new(HashSet::new()),
        }
    }

    /// Sources that have delivered at least one update.
    #[must_use]
    pub fn seen_sources(&self) -> HashSet<String> {
        self.sources_seen.read().clone()
    }

    /// Merge an update from `source` and emit the resulting operations.
    ///
    /// Operations are emitted in the order REMOVE, ADD, UPDATE, DELETE,
    /// RECONCILE, RESTORE; empty ones are skipped, except that the first SET
    /// from a source always emits an ADD so the source is marked seen.
    ///
    /// # Errors
    ///
    /// Returns an error if the update channel is closed.
    pub async fn merge(&self, source: &str, update: PodUpdate) -> Result<()> {
        let first_set = update.op == PodOperation::Set
            && self.sources_seen.write().insert(source.to_string());
        if update.op != PodOperation::Set {
            self.sources_seen.write().insert(source.to_string());
        }

        let changes = self.apply(source, update);

        let ordered = [
            (PodOperation::Remove, changes.removes),
            (PodOperation::Add, changes.adds),
            (PodOperation::Update, changes.updates),
            (PodOperation::Delete, changes.deletes),
            (PodOperation::Reconcile, changes.reconciles),
            (PodOperation::Restore, changes.restores),
        ];
        for (op, pods) in ordered {
            if pods.is_empty() && !(op == PodOperation::Add && first_set) {
                continue;
            }
            debug!(source, op = %op, count = pods.len(), "Emitting config update");
            self.sender
                .send(PodUpdate::new(source, op, pods))
                .await
                .map_err(|_| CoreError::Internal("pod config channel closed".into()))?;
        }
        Ok(())
    }

    fn apply(&self, source: &str, update: PodUpdate) -> Changes {
        let mut all = self.pods.lock();
        let pods = all.entry(source.to_string()).or_default();
        let mut changes = Changes::default();

        match update.op {
            PodOperation::Add | PodOperation::Update | PodOperation::Delete => {
                for pod in &update.pods {
                    Self::update_pod(source, pods, pod, &mut changes);
                }
            }
            PodOperation::Remove => {
                for pod in &update.pods {
                    let Ok(uid) = pod::pod_uid(pod) else { continue };
                    if let Some(existing) = pods.remove(&uid) {
                        changes.removes.push(existing);
                    }
                }
            }
            PodOperation::Set => {
                let mut present = HashSet::new();
                for pod in &update.pods {
                    if let Ok(uid) = pod::pod_uid(pod) {
                        present.insert(uid);
                    }
                    Self::update_pod(source, pods, pod, &mut changes);
                }
                let missing: Vec<PodUid> = pods
                    .keys()
                    .filter(|uid| !present.contains(*uid))
                    .cloned()
                    .collect();
                for uid in missing {
                    if let Some(existing) = pods.remove(&uid) {
                        changes.removes.push(existing);
                    }
                }
            }
            PodOperation::Restore => {
                for pod in &update.pods {
                    let Ok(uid) = pod::pod_uid(pod) else { continue };
                    let restored = Arc::new(annotate(pod, source, seen_annotation(pod)));
                    pods.insert(uid, Arc::clone(&restored));
                    changes.restores.push(restored);
                }
            }
            PodOperation::Reconcile => {
                warn!(source, "Sources may not send RECONCILE, ignoring update");
            }
        }
        changes
    }

    fn update_pod(
        source: &str,
        pods: &mut HashMap<PodUid, Arc<Pod>>,
        pod: &Arc<Pod>,
        changes: &mut Changes,
    ) {
        let uid = match pod::pod_uid(pod) {
            Ok(uid) => uid,
            Err(e) => {
                warn!(source, error = %e, "Dropping pod from config source");
                return;
            }
        };

        let Some(existing) = pods.get(&uid) else {
            let added = Arc::new(annotate(pod, source, None));
            pods.insert(uid, Arc::clone(&added));
            changes.adds.push(added);
            return;
        };

        let updated = Arc::new(annotate(pod, source, seen_annotation(existing)));
        if spec_changed(existing, &updated) {
            if pod::is_deletion_requested(&updated) {
                changes.deletes.push(Arc::clone(&updated));
            } else {
                changes.updates.push(Arc::clone(&updated));
            }
        } else if existing.status != updated.status {
            changes.reconciles.push(Arc::clone(&updated));
        } else {
            return;
        }
        pods.insert(uid, updated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn ops(rx: &mut mpsc::Receiver<PodUpdate>) -> Vec<(PodOperation, usize)> {
        let mut out = Vec::new();
        while let Ok(u) = rx.try_recv() {
            out.push((u.op, u.pods.len()));
        }
        out
    }

    #[tokio::test]
    async fn first_set_marks_source_seen() {
        let (tx, mut rx) = mpsc::channel(16);
        let config = PodConfig::new(tx);

        config
            .merge("file", PodUpdate::new("file", PodOperation::Set, vec![]))
            .await
            .unwrap();
        assert_eq!(ops(&mut rx), vec![(PodOperation::Add, 0)]);
        assert!(config.seen_sources().contains("file"));

        config
            .merge("file", PodUpdate::new("file", PodOperation::Set, vec![]))
            .await
            .unwrap();
        assert!(ops(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn add_update_reconcile_delete() {
        let (tx, mut rx) = mpsc::channel(16);
        let config = PodConfig::new(tx);
        let pod = testing::pod("uid-1", "web");

        config
            .merge("api", PodUpdate::new("api", PodOperation::Add, vec![Arc::clone(&pod)]))
            .await
            .unwrap();
        let added = rx.try_recv().unwrap();
        assert_eq!(added.op, PodOperation::Add);
        assert_eq!(pod::pod_source(&added.pods[0]), Some("api"));
        let seen = seen_annotation(&added.pods[0]).unwrap();

        // Identical resend is a no-op.
        config
            .merge("api", PodUpdate::new("api", PodOperation::Update, vec![Arc::clone(&pod)]))
            .await
            .unwrap();
        assert!(ops(&mut rx).is_empty());

        let mut status_only = (*pod).clone();
        status_only.status = Some(PodStatus {
            phase: Some("Running".into()),
            ..Default::default()
        });
        config
            .merge("api", PodUpdate::new("api", PodOperation::Update, vec![Arc::new(status_only.clone())]))
            .await
            .unwrap();
        assert_eq!(ops(&mut rx), vec![(PodOperation::Reconcile, 1)]);

        let mut labelled = status_only.clone();
        labelled.metadata.labels = Some(BTreeMap::from([("tier".into(), "web".into())]));
        config
            .merge("api", PodUpdate::new("api", PodOperation::Update, vec![Arc::new(labelled.clone())]))
            .await
            .unwrap();
        let update = rx.try_recv().unwrap();
        assert_eq!(update.op, PodOperation::Update);
        assert_eq!(seen_annotation(&update.pods[0]), Some(seen));

        let mut deleting = labelled;
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
        config
            .merge("api", PodUpdate::new("api", PodOperation::Delete, vec![Arc::new(deleting)]))
            .await
            .unwrap();
        assert_eq!(ops(&mut rx), vec![(PodOperation::Delete, 1)]);
    }

    #[tokio::test]
    async fn set_emits_removes_first() {
        let (tx, mut rx) = mpsc::channel(16);
        let config = PodConfig::new(tx);
        let a = testing::pod("uid-a", "a");
        let b = testing::pod("uid-b", "b");

        config
            .merge("api", PodUpdate::new("api", PodOperation::Set, vec![Arc::clone(&a)]))
            .await
            .unwrap();
        assert_eq!(ops(&mut rx), vec![(PodOperation::Add, 1)]);

        config
            .merge("api", PodUpdate::new("api", PodOperation::Set, vec![Arc::clone(&b)]))
            .await
            .unwrap();
        assert_eq!(
            ops(&mut rx),
            vec![(PodOperation::Remove, 1), (PodOperation::Add, 1)]
        );

        config
            .merge("api", PodUpdate::new("api", PodOperation::Remove, vec![b]))
            .await
            .unwrap();
        assert_eq!(ops(&mut rx), vec![(PodOperation::Remove, 1)]);
    }

    #[tokio::test]
    async fn restore_is_emitted_as_restore() {
        let (tx, mut rx) = mpsc::channel(16);
        let config = PodConfig::new(tx);
        config
            .merge(
                "file",
                PodUpdate::new("file", PodOperation::Restore, vec![testing::pod("uid-1", "web")]),
            )
            .await
            .unwrap();
        assert_eq!(ops(&mut rx), vec![(PodOperation::Restore, 1)]);
    }

    #[test]
    fn sources_ready() {
        let ready = SourcesReady::new(["api", "file"]);
        assert!(!ready.all_ready());
        ready.add_source("api");
        assert!(!ready.all_ready());
        ready.add_source("file");
        assert!(ready.all_ready());

        assert!(SourcesReady::new(Vec::<String>::new()).all_ready());
    }
}
