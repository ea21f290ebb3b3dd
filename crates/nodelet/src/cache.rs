//! Runtime pod status cache.
//!
//! The PLEG and the pod workers both write observed runtime statuses here.
//! Entries only move forward in time: a write carrying an older observation
//! timestamp than the cached one is ignored.

use std::collections::HashMap;
use std::sync::Arc;

use nodelet_core::PodUid;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::runtime::RuntimePodStatus;

#[derive(Debug, Clone)]
struct CacheEntry {
    status: Arc<RuntimePodStatus>,
    error: Option<String>,
    modified: Instant,
}

/// A cache of runtime pod statuses keyed by pod UID.
#[derive(Debug, Default)]
pub struct PodCache {
    entries: RwLock<HashMap<PodUid, CacheEntry>>,
    timestamp: RwLock<Option<Instant>>,
}

impl PodCache {
    /// Create a new empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a status observed at `observed_at`.
    ///
    /// Returns `false` when the cache already holds a newer observation.
    pub fn set(
        &self,
        uid: PodUid,
        status: RuntimePodStatus,
        error: Option<String>,
        observed_at: Instant,
    ) -> bool {
        let mut entries = self.entries.write();
        if entries.get(&uid).is_some_and(|e| e.modified > observed_at) {
            return false;
        }
        entries.insert(
            uid,
            CacheEntry {
                status: Arc::new(status),
                error,
                modified: observed_at,
            },
        );
        true
    }

    /// Get the cached status and the error recorded with it.
    #[must_use]
    pub fn get(&self, uid: &PodUid) -> Option<(Arc<RuntimePodStatus>, Option<String>)> {
        self.entries
            .read()
            .get(uid)
            .map(|e| (Arc::clone(&e.status), e.error.clone()))
    }

    /// Get the cached status if it was observed at or after `min_time`.
    #[must_use]
    pub fn get_newer_than(&self, uid: &PodUid, min_time: Instant) -> Option<Arc<RuntimePodStatus>> {
        self.entries
            .read()
            .get(uid)
            .filter(|e| e.modified >= min_time)
            .map(|e| Arc::clone(&e.status))
    }

    /// Time the cached entry for `uid` was observed.
    #[must_use]
    pub fn modified(&self, uid: &PodUid) -> Option<Instant> {
        self.entries.read().get(uid).map(|e| e.modified)
    }

    /// Remove the entry for `uid`.
    pub fn delete(&self, uid: &PodUid) {
        self.entries.write().remove(uid);
    }

    /// Record that every entry is current as of `timestamp`.
    pub fn update_time(&self, timestamp: Instant) {
        let mut current = self.timestamp.write();
        if current.map_or(true, |t| t < timestamp) {
            *current = Some(timestamp);
        }
    }

    /// Last global update time.
    #[must_use]
    pub fn timestamp(&self) -> Option<Instant> {
        *self.timestamp.read()
    }

    /// UIDs with a cached entry.
    #[must_use]
    pub fn uids(&self) -> Vec<PodUid> {
        self.entries.read().keys().cloned().collect()
    }

    /// Get the number of cached pods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status(uid: &PodUid, ip: &str) -> RuntimePodStatus {
        let mut status = RuntimePodStatus::empty(uid.clone(), "web", "default");
        status.ips.push(ip.to_string());
        status
    }

    #[tokio::test(start_paused = true)]
    async fn cache_never_regresses() {
        let cache = PodCache::new();
        let uid = PodUid::new("pod-1").unwrap();
        let older = Instant::now();
        tokio::time::advance(Duration::from_secs(1)).await;
        let newer = Instant::now();

        assert!(cache.set(uid.clone(), status(&uid, "10.0.0.2"), None, newer));
        assert!(!cache.set(uid.clone(), status(&uid, "10.0.0.1"), None, older));

        let (cached, err) = cache.get(&uid).unwrap();
        assert_eq!(cached.ips, vec!["10.0.0.2".to_string()]);
        assert!(err.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_get_newer_than() {
        let cache = PodCache::new();
        let uid = PodUid::new("pod-1").unwrap();
        let observed = Instant::now();
        cache.set(uid.clone(), status(&uid, "10.0.0.1"), Some("boom".into()), observed);

        assert!(cache.get_newer_than(&uid, observed).is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get_newer_than(&uid, Instant::now()).is_none());
        assert_eq!(cache.get(&uid).unwrap().1.as_deref(), Some("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_delete_and_timestamp() {
        let cache = PodCache::new();
        let uid = PodUid::new("pod-1").unwrap();
        cache.set(uid.clone(), status(&uid, "10.0.0.1"), None, Instant::now());
        assert_eq!(cache.len(), 1);

        cache.delete(&uid);
        assert!(cache.is_empty());

        let t1 = Instant::now();
        cache.update_time(t1);
        cache.update_time(t1 - Duration::from_secs(0));
        assert_eq!(cache.timestamp(), Some(t1));
    }
}
