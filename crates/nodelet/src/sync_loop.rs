//! The single-consumer event loop driving pod syncs.
//!
//! Every iteration waits on exactly one of: a config update, a PLEG event,
//! the periodic sync tick, a liveness failure or the housekeeping tick. The
//! loop itself never runs pod work in parallel; it only dispatches to the
//! pod workers through a [`SyncLoopHandler`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use nodelet_core::PodUid;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::backoff::LoopBackoff;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::pleg::PodLifecycleEvent;
use crate::pod_config::{PodOperation, PodUpdate};

/// Lower bound of the sync loop health threshold.
pub const MIN_SYNC_LOOP_HEALTH_THRESHOLD: Duration = Duration::from_secs(120);

/// Result of a liveness probe, as delivered to the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessUpdate {
    /// Pod the probed container belongs to.
    pub pod_uid: PodUid,
    /// Probed container name.
    pub container: String,
    /// Whether the probe succeeded.
    pub healthy: bool,
}

/// Entry points the loop dispatches into.
#[async_trait]
pub trait SyncLoopHandler: Send + Sync {
    /// Pods added by a source (ADD and RESTORE).
    async fn handle_pod_additions(&self, pods: Vec<Arc<Pod>>);
    /// Pods changed by a source (UPDATE and DELETE).
    async fn handle_pod_updates(&self, pods: Vec<Arc<Pod>>);
    /// Pods removed from a source.
    async fn handle_pod_removes(&self, pods: Vec<Arc<Pod>>);
    /// Pods whose status changed in the API server.
    async fn handle_pod_reconcile(&self, pods: Vec<Arc<Pod>>);
    /// Pods that need a plain sync.
    async fn handle_pod_syncs(&self, pods: Vec<Arc<Pod>>);
    /// Periodic cleanup of resources of pods that are gone.
    async fn handle_pod_cleanups(&self) -> Result<()>;

    /// Record that a source delivered an update.
    fn mark_source_seen(&self, source: &str);
    /// Whether every configured source has been seen.
    fn sources_ready(&self) -> bool;
    /// Errors that keep the runtime from being used, empty when healthy.
    fn runtime_errors(&self) -> Vec<String>;
    /// Look up a desired pod.
    fn get_pod_by_uid(&self, uid: &PodUid) -> Option<Arc<Pod>>;
    /// Pods due for a periodic sync.
    fn get_pods_to_sync(&self) -> Vec<Arc<Pod>>;
}

/// Receivers the loop multiplexes.
#[derive(Debug)]
pub struct SyncLoopInputs {
    /// Merged config updates.
    pub config: mpsc::Receiver<PodUpdate>,
    /// PLEG events.
    pub pleg: mpsc::Receiver<PodLifecycleEvent>,
    /// Liveness probe results.
    pub liveness: mpsc::Receiver<LivenessUpdate>,
}

/// Periods of the loop.
#[derive(Debug, Clone, Copy)]
pub struct SyncLoopConfig {
    /// Periodic sync ticker.
    pub sync_period: Duration,
    /// Housekeeping ticker.
    pub housekeeping_period: Duration,
    /// First sleep while the runtime is unhealthy.
    pub backoff_base: Duration,
    /// Longest sleep while the runtime is unhealthy.
    pub backoff_max: Duration,
}

/// Tracks when the loop last made progress.
#[derive(Debug)]
pub struct SyncLoopHealth {
    last_iteration: RwLock<Option<Instant>>,
    threshold: Duration,
}

impl SyncLoopHealth {
    /// Create a tracker for a loop ticking every `sync_period`.
    #[must_use]
    pub fn new(sync_period: Duration) -> Self {
        Self {
            last_iteration: RwLock::new(None),
            threshold: (sync_period * 5).max(MIN_SYNC_LOOP_HEALTH_THRESHOLD),
        }
    }

    /// Record the start of an iteration.
    pub fn record_iteration(&self, at: Instant) {
        *self.last_iteration.write() = Some(at);
    }

    /// How long the loop may go without an iteration.
    #[must_use]
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Fails if the loop started but has not iterated within the threshold.
    ///
    /// # Errors
    ///
    /// Returns a description of how long the loop has been stuck.
    pub fn healthy(&self, now: Instant) -> std::result::Result<(), String> {
        match *self.last_iteration.read() {
            Some(at) if now.saturating_duration_since(at) > self.threshold => Err(format!(
                "sync loop took longer than expected: last iteration {:?} ago, threshold {:?}",
                now.saturating_duration_since(at),
                self.threshold
            )),
            _ => Ok(()),
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Run the loop until the config channel closes.
///
/// While the runtime reports errors no work is dispatched and the loop
/// sleeps with exponential backoff, resetting on the first healthy check.
pub async fn run_sync_loop(
    handler: Arc<dyn SyncLoopHandler>,
    mut inputs: SyncLoopInputs,
    config: SyncLoopConfig,
    health: Arc<SyncLoopHealth>,
    metrics: Arc<Metrics>,
) {
    info!("Starting kubelet main sync loop");
    let mut sync_ticker = ticker(config.sync_period);
    let mut housekeeping_ticker = ticker(config.housekeeping_period);
    let mut backoff = LoopBackoff::new(config.backoff_base, config.backoff_max);

    loop {
        let errors = handler.runtime_errors();
        if !errors.is_empty() {
            let delay = backoff.next_delay();
            error!(errors = %errors.join(", "), delay_ms = delay.as_millis(), "Skipping pod synchronization - container runtime is down");
            metrics.sync_loop_runtime_unhealthy.inc();
            tokio::time::sleep(delay).await;
            continue;
        }
        backoff.reset();

        health.record_iteration(Instant::now());
        let keep_going = sync_loop_iteration(
            handler.as_ref(),
            &mut inputs,
            &mut sync_ticker,
            &mut housekeeping_ticker,
        )
        .await;
        if !keep_going {
            break;
        }
        health.record_iteration(Instant::now());
    }
    info!("Sync loop exited");
}

/// Wait for one event and dispatch it. Returns `false` once the config
/// channel is closed.
pub async fn sync_loop_iteration(
    handler: &dyn SyncLoopHandler,
    inputs: &mut SyncLoopInputs,
    sync_ticker: &mut Interval,
    housekeeping_ticker: &mut Interval,
) -> bool {
    tokio::select! {
        update = inputs.config.recv() => {
            let Some(update) = update else {
                error!("Update channel is closed. Exiting the sync loop.");
                return false;
            };
            debug!(source = %update.source, op = %update.op, pods = update.pods.len(), "SyncLoop: config update");
            match update.op {
                PodOperation::Add | PodOperation::Restore => handler.handle_pod_additions(update.pods).await,
                // DELETE is an update because deletion is graceful.
                PodOperation::Update | PodOperation::Delete => handler.handle_pod_updates(update.pods).await,
                PodOperation::Remove => handler.handle_pod_removes(update.pods).await,
                PodOperation::Reconcile => handler.handle_pod_reconcile(update.pods).await,
                PodOperation::Set => error!(source = %update.source, "Kubelet does not support snapshot update"),
            }
            handler.mark_source_seen(&update.source);
        }
        Some(event) = inputs.pleg.recv() => {
            if event.is_sync_worthy() {
                match handler.get_pod_by_uid(&event.id) {
                    Some(pod) => {
                        debug!(pod_uid = %event.id, event_type = ?event.event_type, "SyncLoop: PLEG event");
                        handler.handle_pod_syncs(vec![pod]).await;
                    }
                    None => debug!(pod_uid = %event.id, "Pod does not exist on the server"),
                }
            }
        }
        _ = sync_ticker.tick() => {
            let pods = handler.get_pods_to_sync();
            if !pods.is_empty() {
                debug!(pods = pods.len(), "SyncLoop: periodic sync");
                handler.handle_pod_syncs(pods).await;
            }
        }
        Some(update) = inputs.liveness.recv() => {
            if !update.healthy {
                match handler.get_pod_by_uid(&update.pod_uid) {
                    Some(pod) => {
                        info!(pod_uid = %update.pod_uid, container = %update.container, "SyncLoop: container failed liveness probe");
                        handler.handle_pod_syncs(vec![pod]).await;
                    }
                    None => debug!(pod_uid = %update.pod_uid, "Liveness update for unknown pod"),
                }
            }
        }
        _ = housekeeping_ticker.tick() => {
            if handler.sources_ready() {
                if let Err(e) = handler.handle_pod_cleanups().await {
                    error!(error = %e, "Failed cleaning pods");
                }
            } else {
                debug!("SyncLoop: skipping housekeeping, sources aren't ready yet");
            }
        }
    }
    true
}
