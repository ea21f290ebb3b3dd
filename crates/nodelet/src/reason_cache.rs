//! Last failure reason per container.
//!
//! Runtime sync failures are recorded here and read back when the API status
//! of a pod is generated, so a container that failed to start shows why.

use std::num::NonZeroUsize;

use lru::LruCache;
use nodelet_core::PodUid;
use parking_lot::Mutex;

use crate::runtime::{PodSyncResult, SyncAction};

/// Reason and message of the last failure of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonInfo {
    /// Machine-readable reason, e.g. `CrashLoopBackOff`.
    pub reason: String,
    /// Human-readable details.
    pub message: String,
}

/// Bounded LRU of container failure reasons keyed by `(uid, container)`.
pub struct ReasonCache {
    cache: Mutex<LruCache<(PodUid, String), ReasonInfo>>,
}

impl std::fmt::Debug for ReasonCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasonCache")
            .field("len", &self.cache.lock().len())
            .finish()
    }
}

impl ReasonCache {
    /// Create a cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record the start-container outcomes of a runtime sync.
    ///
    /// Failures are added and successes clear any previous reason.
    pub fn update(&self, uid: &PodUid, result: &PodSyncResult) {
        let mut cache = self.cache.lock();
        for r in &result.sync_results {
            if r.action != SyncAction::StartContainer {
                continue;
            }
            let key = (uid.clone(), r.target.clone());
            match &r.error {
                Some(err) => {
                    cache.put(
                        key,
                        ReasonInfo {
                            reason: err.reason().to_string(),
                            message: r.message.clone(),
                        },
                    );
                }
                None => {
                    cache.pop(&key);
                }
            }
        }
    }

    /// Look up the last failure of a container.
    #[must_use]
    pub fn get(&self, uid: &PodUid, container: &str) -> Option<ReasonInfo> {
        self.cache
            .lock()
            .get(&(uid.clone(), container.to_string()))
            .cloned()
    }

    /// Forget every container of a pod.
    pub fn remove_pod(&self, uid: &PodUid) {
        let mut cache = self.cache.lock();
        let keys: Vec<_> = cache
            .iter()
            .filter(|((u, _), _)| u == uid)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            cache.pop(&key);
        }
    }

    /// UIDs with at least one recorded reason.
    #[must_use]
    pub fn uids(&self) -> Vec<PodUid> {
        let mut uids: Vec<PodUid> = self.cache.lock().iter().map(|((u, _), _)| u.clone()).collect();
        uids.sort();
        uids.dedup();
        uids
    }
}
