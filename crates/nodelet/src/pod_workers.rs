//! Per-pod serialized workers.
//!
//! Every pod UID gets one worker task, spawned on its first update and fed
//! through a capacity-one channel. While a worker is busy, new updates for its
//! pod are held in a single undelivered slot: a newer update replaces an older
//! one, except that a pending KILL is never replaced by a non-KILL update.
//! When the worker finishes a sync it either takes the undelivered update or
//! marks itself idle, so at most one sync per UID is ever in flight.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use nodelet_core::PodUid;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::cache::PodCache;
use crate::error::{KubeletError, Result};
use crate::events::{reasons, EventRecorder, EventType};
use crate::metrics::Metrics;
use crate::pod;
use crate::runtime::{ContainerRuntime, RuntimePodStatus};
use crate::types::{OnCompleteFn, SyncPodOptions, SyncPodType, UpdatePodOptions};
use crate::work_queue::WorkQueue;

/// Jitter factor applied to the resync and error backoff periods.
pub const WORKER_JITTER_FACTOR: f64 = 0.5;

/// Runs the sync transaction script for one pod.
#[async_trait]
pub trait PodSyncer: Send + Sync {
    /// Converge the pod towards its desired state.
    async fn sync_pod(&self, options: SyncPodOptions) -> Result<()>;
}

/// Timing configuration of the workers.
#[derive(Debug, Clone, Copy)]
pub struct PodWorkersConfig {
    /// Requeue delay after a successful sync.
    pub resync_interval: Duration,
    /// Requeue delay after a failed sync.
    pub backoff_period: Duration,
}

struct WorkerEntry {
    sender: mpsc::Sender<QueuedUpdate>,
    is_working: bool,
    forgotten: bool,
}

struct QueuedUpdate {
    options: UpdatePodOptions,
    dispatched_at: Instant,
}

#[derive(Default)]
struct WorkersState {
    workers: HashMap<PodUid, WorkerEntry>,
    last_undelivered: HashMap<PodUid, QueuedUpdate>,
}

fn chain_on_complete(
    first: Option<OnCompleteFn>,
    second: Option<OnCompleteFn>,
) -> Option<OnCompleteFn> {
    match (first, second) {
        (Some(a), Some(b)) => Some(Box::new(move |err: Option<&KubeletError>| {
            a(err);
            b(err);
        })),
        (a, b) => a.or(b),
    }
}

fn jitter(duration: Duration, factor: f64) -> Duration {
    let extra = rand::thread_rng().gen_range(0.0..=factor);
    duration + duration.mul_f64(extra)
}

/// Manager of the per-pod worker tasks.
pub struct PodWorkers {
    state: Mutex<WorkersState>,
    syncer: Arc<dyn PodSyncer>,
    runtime: Arc<dyn ContainerRuntime>,
    cache: Arc<PodCache>,
    work_queue: Arc<WorkQueue>,
    recorder: Arc<dyn EventRecorder>,
    metrics: Arc<Metrics>,
    config: PodWorkersConfig,
}

impl std::fmt::Debug for PodWorkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodWorkers")
            .field("workers", &self.state.lock().workers.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PodWorkers {
    /// Create the manager.
    #[must_use]
    pub fn new(
        syncer: Arc<dyn PodSyncer>,
        runtime: Arc<dyn ContainerRuntime>,
        cache: Arc<PodCache>,
        work_queue: Arc<WorkQueue>,
        recorder: Arc<dyn EventRecorder>,
        metrics: Arc<Metrics>,
        config: PodWorkersConfig,
    ) -> Self {
        Self {
            state: Mutex::new(WorkersState::default()),
            syncer,
            runtime,
            cache,
            work_queue,
            recorder,
            metrics,
            config,
        }
    }

    /// Queue work for the pod in `options`, spawning its worker if needed.
    ///
    /// An in-flight sync is never preempted.
    pub fn update_pod(self: &Arc<Self>, options: UpdatePodOptions) {
        let uid = match pod::pod_uid(&options.pod) {
            Ok(uid) => uid,
            Err(e) => {
                error!(pod = %pod::pod_full_name(&options.pod), error = %e, "Cannot dispatch pod without a UID");
                return;
            }
        };
        let queued = QueuedUpdate {
            options,
            dispatched_at: Instant::now(),
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.workers.contains_key(&uid) {
            // One slot is enough: a send only happens while the worker is idle.
            let (sender, receiver) = mpsc::channel(1);
            state.workers.insert(
                uid.clone(),
                WorkerEntry {
                    sender,
                    is_working: false,
                    forgotten: false,
                },
            );
            let workers = Arc::clone(self);
            let worker_uid = uid.clone();
            tokio::spawn(async move {
                workers.manage_pod_loop(worker_uid, receiver).await;
            });
        }

        let Some(entry) = state.workers.get_mut(&uid) else {
            return;
        };
        entry.forgotten = false;
        if entry.is_working {
            let previous = state.last_undelivered.remove(&uid);
            let next = match previous {
                Some(mut kept) if kept.options.update_type == SyncPodType::Kill
                    && queued.options.update_type != SyncPodType::Kill =>
                {
                    kept.options.on_complete = chain_on_complete(
                        kept.options.on_complete.take(),
                        queued.options.on_complete,
                    );
                    kept
                }
                Some(mut replaced) => {
                    let mut queued = queued;
                    queued.options.on_complete = chain_on_complete(
                        replaced.options.on_complete.take(),
                        queued.options.on_complete.take(),
                    );
                    queued
                }
                None => queued,
            };
            state.last_undelivered.insert(uid, next);
        } else {
            entry.is_working = true;
            if let Err(e) = entry.sender.try_send(queued) {
                error!(pod_uid = %uid, error = %e, "Failed to hand update to idle pod worker");
                entry.is_working = false;
            }
        }
    }

    /// Stop tracking a pod.
    ///
    /// A worker in the middle of a sync finishes it and then exits without
    /// requeueing.
    pub fn forget_worker(&self, uid: &PodUid) {
        let mut state = self.state.lock();
        state.last_undelivered.remove(uid);
        let working = state.workers.get(uid).is_some_and(|e| e.is_working);
        if working {
            if let Some(entry) = state.workers.get_mut(uid) {
                entry.forgotten = true;
            }
        } else {
            state.workers.remove(uid);
        }
    }

    /// Forget every worker whose pod is not in `desired`.
    pub fn forget_non_existing_pod_workers(&self, desired: &HashSet<PodUid>) {
        let stale: Vec<PodUid> = self
            .state
            .lock()
            .workers
            .keys()
            .filter(|uid| !desired.contains(*uid))
            .cloned()
            .collect();
        for uid in stale {
            self.forget_worker(&uid);
        }
    }

    /// Whether a worker is currently syncing the pod.
    #[must_use]
    pub fn is_working(&self, uid: &PodUid) -> bool {
        self.state.lock().workers.get(uid).is_some_and(|e| e.is_working)
    }

    /// Whether a worker exists for the pod.
    #[must_use]
    pub fn has_worker(&self, uid: &PodUid) -> bool {
        self.state.lock().workers.contains_key(uid)
    }

    /// Number of tracked workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().workers.len()
    }

    /// Whether no worker is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().workers.is_empty()
    }

    async fn manage_pod_loop(self: Arc<Self>, uid: PodUid, mut updates: mpsc::Receiver<QueuedUpdate>) {
        let mut last_sync_time: Option<Instant> = None;
        while let Some(QueuedUpdate {
            options,
            dispatched_at,
        }) = updates.recv().await
        {
            self.metrics
                .pod_worker_start_duration
                .observe(dispatched_at.elapsed().as_secs_f64());

            let started = Instant::now();
            let update_type = options.update_type;
            let pod = options.pod;
            let mut on_complete = options.on_complete;

            let result = match self.fetch_status(&uid, &pod, last_sync_time).await {
                Ok(status) => {
                    self.syncer
                        .sync_pod(SyncPodOptions {
                            pod: Arc::clone(&pod),
                            mirror_pod: options.mirror_pod,
                            pod_status: status,
                            update_type,
                            kill_pod_options: options.kill_pod_options,
                        })
                        .await
                }
                Err(e) => Err(e),
            };
            last_sync_time = Some(started);

            self.metrics
                .pod_worker_duration
                .with_label_values(&[update_type.as_str()])
                .observe(started.elapsed().as_secs_f64());

            if let Some(callback) = on_complete.take() {
                callback(result.as_ref().err());
            }
            if let Err(e) = &result {
                error!(pod = %pod::pod_full_name(&pod), pod_uid = %uid, error = %e, "Error syncing pod, skipping");
                self.recorder
                    .pod_event(&pod, EventType::Warning, reasons::FAILED_SYNC, &format!("error syncing pod: {e}"))
                    .await;
            }

            if !self.wrap_up(&uid, result.is_err()) {
                break;
            }
        }
        debug!(pod_uid = %uid, "Pod worker exiting");
    }

    async fn fetch_status(
        &self,
        uid: &PodUid,
        pod: &Pod,
        last_sync_time: Option<Instant>,
    ) -> Result<Arc<RuntimePodStatus>> {
        if let Some(since) = last_sync_time {
            if let Some(status) = self.cache.get_newer_than(uid, since) {
                return Ok(status);
            }
        } else if let Some((status, _)) = self.cache.get(uid) {
            return Ok(status);
        }

        let observed_at = Instant::now();
        let status = self
            .runtime
            .get_pod_status(uid, pod::pod_name(pod), pod::pod_namespace(pod))
            .await
            .map_err(|e| KubeletError::PodStatus(e.to_string()))?;
        self.cache.set(uid.clone(), status, None, observed_at);
        self.cache
            .get(uid)
            .map(|(status, _)| status)
            .ok_or_else(|| KubeletError::PodStatus("status vanished from cache".into()))
    }

    // Returns whether the worker should keep running.
    fn wrap_up(&self, uid: &PodUid, failed: bool) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.workers.get(uid) else {
            return false;
        };
        if entry.forgotten {
            state.workers.remove(uid);
            state.last_undelivered.remove(uid);
            return false;
        }

        let delay = if failed {
            jitter(self.config.backoff_period, WORKER_JITTER_FACTOR)
        } else {
            jitter(self.config.resync_interval, WORKER_JITTER_FACTOR)
        };
        self.work_queue.enqueue(uid.clone(), delay);

        match state.last_undelivered.remove(uid) {
            Some(next) => {
                if let Some(entry) = state.workers.get_mut(uid) {
                    if let Err(e) = entry.sender.try_send(next) {
                        warn!(pod_uid = %uid, error = %e, "Failed to deliver queued pod update");
                        entry.is_working = false;
                    }
                }
            }
            None => {
                if let Some(entry) = state.workers.get_mut(uid) {
                    entry.is_working = false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, FakeEventRecorder, FakeRuntime, RecordingSyncer};

    fn build(syncer: &Arc<RecordingSyncer>) -> (Arc<PodWorkers>, Arc<WorkQueue>) {
        let work_queue = Arc::new(WorkQueue::new());
        let workers = Arc::new(PodWorkers::new(
            Arc::clone(syncer) as Arc<dyn PodSyncer>,
            Arc::new(FakeRuntime::default()),
            Arc::new(PodCache::new()),
            Arc::clone(&work_queue),
            Arc::new(FakeEventRecorder::default()),
            Arc::new(Metrics::new().unwrap()),
            PodWorkersConfig {
                resync_interval: Duration::from_secs(60),
                backoff_period: Duration::from_secs(10),
            },
        ));
        (workers, work_queue)
    }

    async fn settle(workers: &PodWorkers, uid: &PodUid) {
        for _ in 0..200 {
            if !workers.is_working(uid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker for {uid} never became idle");
    }

    #[tokio::test]
    async fn syncs_for_one_uid_never_overlap() {
        let syncer = Arc::new(RecordingSyncer::with_delay(Duration::from_millis(20)));
        let (workers, _) = build(&syncer);
        let pod = testing::pod("uid-1", "web");
        let uid = PodUid::new("uid-1").unwrap();

        for _ in 0..10 {
            workers.update_pod(UpdatePodOptions::new(Arc::clone(&pod), None, SyncPodType::Update));
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        settle(&workers, &uid).await;

        assert_eq!(syncer.max_concurrency(&uid), 1);
        assert!(syncer.calls_for(&uid).len() >= 2);
        assert!(syncer.calls_for(&uid).len() <= 10);
    }

    #[tokio::test]
    async fn different_pods_sync_in_parallel() {
        let syncer = Arc::new(RecordingSyncer::with_delay(Duration::from_millis(50)));
        let (workers, _) = build(&syncer);

        for i in 0..4 {
            let pod = testing::pod(&format!("uid-{i}"), &format!("web-{i}"));
            workers.update_pod(UpdatePodOptions::new(pod, None, SyncPodType::Create));
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(syncer.global_max_concurrency() > 1);
    }

    #[tokio::test]
    async fn latest_update_is_processed_and_kill_is_kept() {
        let syncer = Arc::new(RecordingSyncer::with_delay(Duration::from_millis(30)));
        let (workers, _) = build(&syncer);
        let uid = PodUid::new("uid-1").unwrap();
        let pod = testing::pod("uid-1", "web");

        workers.update_pod(UpdatePodOptions::new(Arc::clone(&pod), None, SyncPodType::Create));
        tokio::time::sleep(Duration::from_millis(5)).await;
        workers.update_pod(UpdatePodOptions::new(Arc::clone(&pod), None, SyncPodType::Update));
        workers.update_pod(UpdatePodOptions::new(Arc::clone(&pod), None, SyncPodType::Kill));
        workers.update_pod(UpdatePodOptions::new(Arc::clone(&pod), None, SyncPodType::Sync));
        settle(&workers, &uid).await;

        assert_eq!(
            syncer.calls_for(&uid),
            vec![SyncPodType::Create, SyncPodType::Kill]
        );
    }

    #[tokio::test]
    async fn completion_callback_and_requeue() {
        let syncer = Arc::new(RecordingSyncer::default());
        let (workers, work_queue) = build(&syncer);
        let uid = PodUid::new("uid-1").unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut options = UpdatePodOptions::new(testing::pod("uid-1", "web"), None, SyncPodType::Kill);
        options.on_complete = Some(Box::new(move |err: Option<&KubeletError>| {
            let _ = tx.send(err.is_none());
        }));
        workers.update_pod(options);

        assert!(rx.await.unwrap());
        settle(&workers, &uid).await;
        assert_eq!(work_queue.len(), 1);
    }

    #[tokio::test]
    async fn failed_sync_records_event() {
        let syncer = Arc::new(RecordingSyncer::failing());
        let recorder = Arc::new(FakeEventRecorder::default());
        let workers = Arc::new(PodWorkers::new(
            Arc::clone(&syncer) as Arc<dyn PodSyncer>,
            Arc::new(FakeRuntime::default()),
            Arc::new(PodCache::new()),
            Arc::new(WorkQueue::new()),
            Arc::clone(&recorder) as Arc<dyn EventRecorder>,
            Arc::new(Metrics::new().unwrap()),
            PodWorkersConfig {
                resync_interval: Duration::from_secs(60),
                backoff_period: Duration::from_secs(10),
            },
        ));
        let uid = PodUid::new("uid-1").unwrap();
        workers.update_pod(UpdatePodOptions::new(testing::pod("uid-1", "web"), None, SyncPodType::Sync));
        settle(&workers, &uid).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(recorder.has_reason(reasons::FAILED_SYNC));
    }

    #[tokio::test]
    async fn forgotten_worker_finishes_and_does_not_requeue() {
        let syncer = Arc::new(RecordingSyncer::with_delay(Duration::from_millis(30)));
        let (workers, work_queue) = build(&syncer);
        let uid = PodUid::new("uid-1").unwrap();

        workers.update_pod(UpdatePodOptions::new(testing::pod("uid-1", "web"), None, SyncPodType::Sync));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(workers.is_working(&uid));

        workers.forget_non_existing_pod_workers(&HashSet::new());
        assert!(workers.has_worker(&uid));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(syncer.calls_for(&uid).len(), 1);
        assert!(!workers.has_worker(&uid));
        assert!(work_queue.is_empty());
    }
}
