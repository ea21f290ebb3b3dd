//! Desired pods on this node.
//!
//! The [`PodManager`] is the authoritative in-memory map from pod identity to
//! the latest desired spec. Mirror pods are stored separately and paired with
//! their static pod by full name.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use nodelet_core::PodUid;
use parking_lot::RwLock;
use tracing::warn;

use crate::pod;

#[derive(Debug, Default)]
struct Inner {
    pod_by_uid: HashMap<PodUid, Arc<Pod>>,
    pod_by_full_name: HashMap<String, Arc<Pod>>,
    mirror_pod_by_uid: HashMap<PodUid, Arc<Pod>>,
    mirror_pod_by_full_name: HashMap<String, Arc<Pod>>,
    // Mirror pod UID to static pod UID.
    translation_by_uid: HashMap<PodUid, PodUid>,
}

impl Inner {
    fn update(&mut self, pod: Arc<Pod>) {
        let uid = match pod::pod_uid(&pod) {
            Ok(uid) => uid,
            Err(e) => {
                warn!(pod = %pod::pod_full_name(&pod), error = %e, "Ignoring pod without a usable UID");
                return;
            }
        };
        let full_name = pod::pod_full_name(&pod);

        if pod::is_mirror_pod(&pod) {
            if let Some(static_pod) = self.pod_by_full_name.get(&full_name) {
                if let Ok(static_uid) = pod::pod_uid(static_pod) {
                    self.translation_by_uid.insert(uid.clone(), static_uid);
                }
            }
            self.mirror_pod_by_uid.insert(uid, Arc::clone(&pod));
            self.mirror_pod_by_full_name.insert(full_name, pod);
        } else {
            if let Some(mirror) = self.mirror_pod_by_full_name.get(&full_name) {
                if let Ok(mirror_uid) = pod::pod_uid(mirror) {
                    self.translation_by_uid.insert(mirror_uid, uid.clone());
                }
            }
            self.pod_by_uid.insert(uid, Arc::clone(&pod));
            self.pod_by_full_name.insert(full_name, pod);
        }
    }
}

/// Thread-safe store of the desired pods and mirror pods.
#[derive(Debug, Default)]
pub struct PodManager {
    inner: RwLock<Inner>,
}

impl PodManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every pod.
    pub fn set_pods(&self, pods: Vec<Arc<Pod>>) {
        let mut inner = self.inner.write();
        *inner = Inner::default();
        for pod in pods {
            inner.update(pod);
        }
    }

    /// Add a pod, or a mirror pod.
    pub fn add_pod(&self, pod: Arc<Pod>) {
        self.update_pod(pod);
    }

    /// Store the latest version of a pod, or a mirror pod.
    pub fn update_pod(&self, pod: Arc<Pod>) {
        self.inner.write().update(pod);
    }

    /// Forget a pod, or a mirror pod.
    pub fn delete_pod(&self, pod: &Pod) {
        let Ok(uid) = pod::pod_uid(pod) else {
            return;
        };
        let full_name = pod::pod_full_name(pod);
        let mut inner = self.inner.write();
        if pod::is_mirror_pod(pod) {
            inner.mirror_pod_by_uid.remove(&uid);
            inner.mirror_pod_by_full_name.remove(&full_name);
            inner.translation_by_uid.remove(&uid);
        } else {
            inner.pod_by_uid.remove(&uid);
            inner.pod_by_full_name.remove(&full_name);
            inner.translation_by_uid.retain(|_, static_uid| *static_uid != uid);
        }
    }

    /// Every regular and static pod.
    #[must_use]
    pub fn get_pods(&self) -> Vec<Arc<Pod>> {
        self.inner.read().pod_by_uid.values().cloned().collect()
    }

    /// Every regular and static pod, plus every mirror pod.
    #[must_use]
    pub fn get_pods_and_mirror_pods(&self) -> (Vec<Arc<Pod>>, Vec<Arc<Pod>>) {
        let inner = self.inner.read();
        (
            inner.pod_by_uid.values().cloned().collect(),
            inner.mirror_pod_by_uid.values().cloned().collect(),
        )
    }

    /// Look up a pod by UID.
    #[must_use]
    pub fn get_pod_by_uid(&self, uid: &PodUid) -> Option<Arc<Pod>> {
        self.inner.read().pod_by_uid.get(uid).cloned()
    }

    /// Look up a pod by `<name>_<namespace>`.
    #[must_use]
    pub fn get_pod_by_full_name(&self, full_name: &str) -> Option<Arc<Pod>> {
        self.inner.read().pod_by_full_name.get(full_name).cloned()
    }

    /// Look up a pod by namespace and name.
    #[must_use]
    pub fn get_pod_by_name(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.get_pod_by_full_name(&pod::build_pod_full_name(name, namespace))
    }

    /// The mirror pod of a static pod.
    #[must_use]
    pub fn get_mirror_pod_by_pod(&self, pod: &Pod) -> Option<Arc<Pod>> {
        self.inner
            .read()
            .mirror_pod_by_full_name
            .get(&pod::pod_full_name(pod))
            .cloned()
    }

    /// The static pod a mirror pod represents.
    #[must_use]
    pub fn get_pod_by_mirror_pod(&self, mirror: &Pod) -> Option<Arc<Pod>> {
        self.inner
            .read()
            .pod_by_full_name
            .get(&pod::pod_full_name(mirror))
            .cloned()
    }

    /// Translate a mirror pod UID into its static pod UID.
    ///
    /// Any other UID is returned unchanged.
    #[must_use]
    pub fn translate_pod_uid(&self, uid: &PodUid) -> PodUid {
        self.inner
            .read()
            .translation_by_uid
            .get(uid)
            .cloned()
            .unwrap_or_else(|| uid.clone())
    }

    /// Full names of mirror pods whose static pod is gone.
    #[must_use]
    pub fn get_orphaned_mirror_pod_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .mirror_pod_by_full_name
            .keys()
            .filter(|name| !inner.pod_by_full_name.contains_key(*name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Whether the stored mirror pod of `pod` matches its current version.
    #[must_use]
    pub fn is_mirror_pod_of(&self, mirror: &Pod, pod: &Pod) -> bool {
        pod::is_mirror_pod_of(mirror, pod)
    }

    /// UIDs of every regular and static pod.
    #[must_use]
    pub fn get_uids(&self) -> Vec<PodUid> {
        self.inner.read().pod_by_uid.keys().cloned().collect()
    }

    /// Number of regular and static pods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().pod_by_uid.len()
    }

    /// Whether no pod is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().pod_by_uid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use kube::api::ObjectMeta;

    fn make_pod(uid: &str, name: &str, annotations: &[(&str, &str)]) -> Arc<Pod> {
        Arc::new(Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kube-system".to_string()),
                uid: Some(uid.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn static_pod() -> Arc<Pod> {
        make_pod(
            "static-uid",
            "etcd",
            &[
                (pod::CONFIG_SOURCE_ANNOTATION, pod::FILE_SOURCE),
                (pod::CONFIG_HASH_ANNOTATION, "static-uid"),
            ],
        )
    }

    fn mirror_pod() -> Arc<Pod> {
        make_pod(
            "mirror-uid",
            "etcd",
            &[(pod::CONFIG_MIRROR_ANNOTATION, "static-uid")],
        )
    }

    #[test]
    fn add_get_delete() {
        let manager = PodManager::new();
        let pod = make_pod("uid-1", "web", &[]);
        manager.add_pod(Arc::clone(&pod));

        let uid = PodUid::new("uid-1").unwrap();
        assert!(manager.get_pod_by_uid(&uid).is_some());
        assert!(manager.get_pod_by_name("kube-system", "web").is_some());
        assert_eq!(manager.len(), 1);

        manager.delete_pod(&pod);
        assert!(manager.get_pod_by_uid(&uid).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn update_replaces_spec() {
        let manager = PodManager::new();
        manager.add_pod(make_pod("uid-1", "web", &[]));
        manager.update_pod(make_pod("uid-1", "web", &[("version", "2")]));

        let uid = PodUid::new("uid-1").unwrap();
        let stored = manager.get_pod_by_uid(&uid).unwrap();
        assert_eq!(
            stored.metadata.annotations.as_ref().unwrap().get("version"),
            Some(&"2".to_string())
        );
    }

    #[test]
    fn mirror_pods_pair_with_static_pods() {
        let manager = PodManager::new();
        manager.set_pods(vec![mirror_pod(), static_pod()]);

        let (pods, mirrors) = manager.get_pods_and_mirror_pods();
        assert_eq!(pods.len(), 1);
        assert_eq!(mirrors.len(), 1);

        let mirror = manager.get_mirror_pod_by_pod(&static_pod()).unwrap();
        assert!(manager.is_mirror_pod_of(&mirror, &static_pod()));
        assert!(manager.get_pod_by_mirror_pod(&mirror).is_some());

        let mirror_uid = PodUid::new("mirror-uid").unwrap();
        assert_eq!(manager.translate_pod_uid(&mirror_uid).as_str(), "static-uid");
        assert!(manager.get_orphaned_mirror_pod_names().is_empty());

        manager.delete_pod(&static_pod());
        assert_eq!(
            manager.get_orphaned_mirror_pod_names(),
            vec!["etcd_kube-system".to_string()]
        );
        assert_eq!(manager.translate_pod_uid(&mirror_uid), mirror_uid);
    }
}
