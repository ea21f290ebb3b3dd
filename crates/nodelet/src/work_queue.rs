//! Delayed queue of pods due for a periodic sync.

use std::collections::HashMap;
use std::time::Duration;

use nodelet_core::PodUid;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Per-UID delayed work queue.
///
/// Enqueuing a UID that is already queued replaces its due time.
#[derive(Debug, Default)]
pub struct WorkQueue {
    queue: Mutex<HashMap<PodUid, Instant>>,
}

impl WorkQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `uid` to become due after `delay`.
    pub fn enqueue(&self, uid: PodUid, delay: Duration) {
        self.queue.lock().insert(uid, Instant::now() + delay);
    }

    /// Remove and return every UID that is due.
    pub fn get_work(&self) -> Vec<PodUid> {
        let now = Instant::now();
        let mut queue = self.queue.lock();
        let due: Vec<PodUid> = queue
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in &due {
            queue.remove(uid);
        }
        due
    }

    /// Number of queued UIDs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
