//! Last-known-good API status of every pod.
//!
//! Pod workers publish the status they generate on every sync. The manager
//! keeps a versioned copy per UID and a background task pushes changed
//! versions to the API server through a [`StatusSink`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use k8s_openapi::api::core::v1::{
    ContainerState as ApiContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use nodelet_core::PodUid;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::pod;
use crate::pod_manager::PodManager;
use crate::types::PodPhase;

/// How often every cached status is compared against the API server copy.
pub const STATUS_SYNC_PERIOD: Duration = Duration::from_secs(10);

/// Writes pod statuses to the API server.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Replace the status of `pod` with `status`.
    async fn patch_pod_status(&self, pod: &Pod, status: &PodStatus) -> Result<()>;
}

#[derive(Debug, Clone)]
struct VersionedStatus {
    status: PodStatus,
    version: u64,
}

/// Versioned per-UID cache of generated pod statuses.
#[derive(Debug)]
pub struct StatusManager {
    statuses: RwLock<HashMap<PodUid, VersionedStatus>>,
    api_versions: Mutex<HashMap<PodUid, u64>>,
    pod_manager: Arc<PodManager>,
    notify: Notify,
}

fn truncate(time: &mut Option<Time>) {
    if let Some(t) = time.as_mut() {
        t.0 = t.0.trunc_subsecs(0);
    }
}

fn normalize_container_state(state: Option<&mut ApiContainerState>) {
    let Some(state) = state else { return };
    if let Some(running) = state.running.as_mut() {
        truncate(&mut running.started_at);
    }
    if let Some(terminated) = state.terminated.as_mut() {
        truncate(&mut terminated.started_at);
        truncate(&mut terminated.finished_at);
    }
}

fn normalize_container_statuses(statuses: Option<&mut Vec<ContainerStatus>>) {
    let Some(statuses) = statuses else { return };
    for cs in statuses.iter_mut() {
        normalize_container_state(cs.state.as_mut());
        normalize_container_state(cs.last_state.as_mut());
    }
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
}

/// Truncate timestamps to seconds and sort container statuses, so statuses
/// compare equal after a round trip through the API server.
pub fn normalize_status(status: &mut PodStatus) {
    truncate(&mut status.start_time);
    for condition in status.conditions.iter_mut().flatten() {
        truncate(&mut condition.last_probe_time);
        truncate(&mut condition.last_transition_time);
    }
    normalize_container_statuses(status.container_statuses.as_mut());
    normalize_container_statuses(status.init_container_statuses.as_mut());
}

impl StatusManager {
    /// Create a manager that resolves pods through `pod_manager`.
    #[must_use]
    pub fn new(pod_manager: Arc<PodManager>) -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            api_versions: Mutex::new(HashMap::new()),
            pod_manager,
            notify: Notify::new(),
        }
    }

    /// Cached status of a pod; mirror pod UIDs resolve to their static pod.
    #[must_use]
    pub fn get_pod_status(&self, uid: &PodUid) -> Option<PodStatus> {
        let uid = self.pod_manager.translate_pod_uid(uid);
        self.statuses.read().get(&uid).map(|v| v.status.clone())
    }

    /// Record a newly generated status for `pod`.
    ///
    /// Condition transition times and the start time are carried over from
    /// the previous status. A terminal pod never returns to a non-terminal
    /// phase, and a status identical to the cached one is not re-versioned.
    /// Returns whether the cache changed.
    pub fn set_pod_status(&self, pod: &Pod, status: PodStatus) -> bool {
        let Ok(uid) = pod::pod_uid(pod) else {
            return false;
        };
        self.update_status_internal(pod, &uid, status)
    }

    fn update_status_internal(&self, pod: &Pod, uid: &PodUid, mut status: PodStatus) -> bool {
        let mut statuses = self.statuses.write();
        let cached = statuses.get(uid);
        let old = cached.map(|v| &v.status).or(pod.status.as_ref());

        if let Some(old) = old {
            let old_phase = PodPhase::of(old);
            let new_phase = PodPhase::of(&status);
            if old_phase.is_terminal() && !new_phase.is_terminal() {
                warn!(
                    pod = %pod::pod_full_name(pod),
                    from = %old_phase,
                    to = %new_phase,
                    "Refusing illegal pod phase transition"
                );
                return false;
            }
        }

        let now = Time(Utc::now());
        for condition in status.conditions.iter_mut().flatten() {
            let previous = old
                .and_then(|o| o.conditions.as_ref())
                .and_then(|cs| cs.iter().find(|c| c.type_ == condition.type_));
            condition.last_transition_time = match previous {
                Some(p) if p.status == condition.status => p.last_transition_time.clone(),
                _ => Some(now.clone()),
            };
        }

        match old.and_then(|o| o.start_time.clone()) {
            Some(start) => status.start_time = Some(start),
            None if status.start_time.is_none() => status.start_time = Some(now),
            None => {}
        }

        normalize_status(&mut status);

        if let Some(cached) = cached {
            if cached.status == status {
                debug!(pod = %pod::pod_full_name(pod), "Ignoring same status");
                return false;
            }
        }

        let version = cached.map_or(1, |v| v.version + 1);
        statuses.insert(uid.clone(), VersionedStatus { status, version });
        drop(statuses);
        self.notify.notify_one();
        true
    }

    /// Mark every container of the pod that has not terminated as terminated.
    pub fn terminate_pod(&self, pod: &Pod) {
        let Ok(uid) = pod::pod_uid(pod) else {
            return;
        };
        let mut status = self
            .statuses
            .read()
            .get(&uid)
            .map(|v| v.status.clone())
            .or_else(|| pod.status.clone())
            .unwrap_or_default();

        let terminate = |statuses: Option<&mut Vec<ContainerStatus>>| {
            for cs in statuses.into_iter().flatten() {
                let terminated = cs.state.as_ref().is_some_and(|s| s.terminated.is_some());
                if !terminated {
                    cs.state = Some(ApiContainerState {
                        terminated: Some(ContainerStateTerminated::default()),
                        ..Default::default()
                    });
                    cs.ready = false;
                }
            }
        };
        terminate(status.container_statuses.as_mut());
        terminate(status.init_container_statuses.as_mut());

        self.update_status_internal(pod, &uid, status);
    }

    /// Drop the cached status of a pod.
    pub fn delete_pod_status(&self, uid: &PodUid) {
        self.statuses.write().remove(uid);
        self.api_versions.lock().remove(uid);
    }

    /// Drop every cached status whose UID is not in `pod_uids`.
    pub fn remove_orphaned_statuses(&self, pod_uids: &HashSet<PodUid>) {
        self.statuses.write().retain(|uid, _| pod_uids.contains(uid));
        self.api_versions.lock().retain(|uid, _| pod_uids.contains(uid));
    }

    /// Whether the API server copy of the pod's status differs from the
    /// cached one.
    #[must_use]
    pub fn needs_reconcile(&self, pod: &Pod) -> bool {
        let Ok(uid) = pod::pod_uid(pod) else {
            return false;
        };
        let Some(cached) = self.get_pod_status(&uid) else {
            return false;
        };
        let mut api_status = pod.status.clone().unwrap_or_default();
        normalize_status(&mut api_status);
        api_status != cached
    }

    fn needs_update(&self, uid: &PodUid, version: u64) -> bool {
        self.api_versions
            .lock()
            .get(uid)
            .map_or(true, |pushed| *pushed < version)
    }

    /// Push statuses to the API server.
    ///
    /// Only versions newer than the last pushed one are sent, unless `all`
    /// is set, in which case statuses that drifted from the API server copy
    /// are sent too. Returns the number of statuses pushed.
    pub async fn sync_batch(&self, sink: &dyn StatusSink, all: bool) -> usize {
        let snapshot: Vec<(PodUid, VersionedStatus)> = self
            .statuses
            .read()
            .iter()
            .map(|(uid, v)| (uid.clone(), v.clone()))
            .collect();

        let mut pushed = 0;
        for (uid, versioned) in snapshot {
            let Some(pod) = self.pod_manager.get_pod_by_uid(&uid) else {
                debug!(pod_uid = %uid, "Pod not found, skipping status update");
                continue;
            };
            // Static pods report through their mirror pod.
            let target = if pod::is_static_pod(&pod) {
                match self.pod_manager.get_mirror_pod_by_pod(&pod) {
                    Some(mirror) => mirror,
                    None => {
                        debug!(pod = %pod::pod_full_name(&pod), "Static pod has no mirror pod yet");
                        continue;
                    }
                }
            } else {
                pod
            };

            let update = self.needs_update(&uid, versioned.version)
                || (all && self.needs_reconcile(&target));
            if !update {
                continue;
            }

            match sink.patch_pod_status(&target, &versioned.status).await {
                Ok(()) => {
                    self.api_versions.lock().insert(uid, versioned.version);
                    pushed += 1;
                }
                Err(e) => {
                    warn!(pod = %pod::pod_full_name(&target), error = %e, "Failed to update status for pod");
                }
            }
        }
        pushed
    }

    /// Spawn the background task pushing statuses through `sink`.
    pub fn start(self: &Arc<Self>, sink: Arc<dyn StatusSink>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_SYNC_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let all = tokio::select! {
                    () = manager.notify.notified() => false,
                    _ = ticker.tick() => true,
                };
                manager.sync_batch(sink.as_ref(), all).await;
            }
        })
    }
}
