//! Pod lifecycle event generator.
//!
//! The generic PLEG periodically relists every pod the runtime knows about,
//! compares each container's coarse state with the previous relist and turns
//! differences into [`PodLifecycleEvent`]s for the sync loop. Pods with events
//! get their runtime status refreshed in the [`PodCache`] first, so the worker
//! woken by the event sees the new state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use nodelet_core::{ContainerId, PodUid};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::cache::PodCache;
use crate::runtime::{ContainerRuntime, ContainerState, RunningPod};

/// A relist older than this makes the PLEG unhealthy.
pub const RELIST_THRESHOLD: Duration = Duration::from_secs(3 * 60);

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodLifecycleEventType {
    /// A container started running.
    ContainerStarted,
    /// A container exited.
    ContainerDied,
    /// A container was removed from the runtime.
    ContainerRemoved,
    /// The pod needs a sync for another reason.
    PodSync,
    /// A container moved to an unknown state.
    ContainerChanged,
}

/// A pod lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodLifecycleEvent {
    /// UID of the pod.
    pub id: PodUid,
    /// What happened.
    pub event_type: PodLifecycleEventType,
    /// The container the event is about.
    pub data: Option<ContainerId>,
}

impl PodLifecycleEvent {
    /// Whether the event should trigger a pod sync.
    #[must_use]
    pub fn is_sync_worthy(&self) -> bool {
        self.event_type != PodLifecycleEventType::ContainerRemoved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlegContainerState {
    Running,
    Exited,
    Unknown,
    NonExistent,
}

impl From<ContainerState> for PlegContainerState {
    fn from(state: ContainerState) -> Self {
        match state {
            ContainerState::Running => Self::Running,
            ContainerState::Exited => Self::Exited,
            ContainerState::Created | ContainerState::Unknown => Self::Unknown,
        }
    }
}

fn generate_events(
    uid: &PodUid,
    cid: &ContainerId,
    old: PlegContainerState,
    new: PlegContainerState,
) -> Vec<PodLifecycleEvent> {
    if old == new {
        return Vec::new();
    }
    let event = |event_type| PodLifecycleEvent {
        id: uid.clone(),
        event_type,
        data: Some(cid.clone()),
    };
    match new {
        PlegContainerState::Running => vec![event(PodLifecycleEventType::ContainerStarted)],
        PlegContainerState::Exited => vec![event(PodLifecycleEventType::ContainerDied)],
        PlegContainerState::Unknown => vec![event(PodLifecycleEventType::ContainerChanged)],
        PlegContainerState::NonExistent => match old {
            PlegContainerState::Exited => vec![event(PodLifecycleEventType::ContainerRemoved)],
            _ => vec![
                event(PodLifecycleEventType::ContainerDied),
                event(PodLifecycleEventType::ContainerRemoved),
            ],
        },
    }
}

fn container_state(pod: Option<&RunningPod>, cid: &ContainerId) -> PlegContainerState {
    pod.and_then(|p| p.containers.iter().find(|c| &c.id == cid))
        .map_or(PlegContainerState::NonExistent, |c| c.state.into())
}

#[derive(Debug, Default)]
struct PodRecord {
    old: Option<RunningPod>,
    current: Option<RunningPod>,
}

/// Relisting lifecycle event generator.
pub struct GenericPleg {
    runtime: Arc<dyn ContainerRuntime>,
    cache: Arc<PodCache>,
    relist_period: Duration,
    sender: mpsc::Sender<PodLifecycleEvent>,
    receiver: Mutex<Option<mpsc::Receiver<PodLifecycleEvent>>>,
    records: Mutex<HashMap<PodUid, PodRecord>>,
    relist_time: RwLock<Option<Instant>>,
}

impl std::fmt::Debug for GenericPleg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericPleg")
            .field("relist_period", &self.relist_period)
            .field("relist_time", &*self.relist_time.read())
            .finish_non_exhaustive()
    }
}

impl GenericPleg {
    /// Create a PLEG with an event channel of `capacity`.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        cache: Arc<PodCache>,
        relist_period: Duration,
        capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            runtime,
            cache,
            relist_period,
            sender,
            receiver: Mutex::new(Some(receiver)),
            records: Mutex::new(HashMap::new()),
            relist_time: RwLock::new(None),
        }
    }

    /// Take the event receiver. Only the first call gets it.
    pub fn watch(&self) -> Option<mpsc::Receiver<PodLifecycleEvent>> {
        self.receiver.lock().take()
    }

    /// Spawn the relist loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let pleg = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pleg.relist_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pleg.relist().await;
            }
        })
    }

    /// Check that relisting is making progress.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when no relist completed recently.
    pub fn healthy(&self) -> std::result::Result<(), String> {
        match *self.relist_time.read() {
            None => Err("pleg has yet to be successful".to_string()),
            Some(at) if at.elapsed() > RELIST_THRESHOLD => Err(format!(
                "pleg was last seen active {:?} ago; threshold is {RELIST_THRESHOLD:?}",
                at.elapsed()
            )),
            Some(_) => Ok(()),
        }
    }

    /// List every pod, emit events for state changes and refresh the cache.
    pub async fn relist(&self) {
        let timestamp = Instant::now();
        let pods = match self.runtime.get_pods(true).await {
            Ok(pods) => pods,
            Err(e) => {
                error!(error = %e, "GenericPLEG: Unable to retrieve pods");
                return;
            }
        };
        *self.relist_time.write() = Some(timestamp);

        let events_by_pod: Vec<(PodUid, Option<(String, String)>, Vec<PodLifecycleEvent>)> = {
            let mut records = self.records.lock();
            for pod in pods {
                let id = pod.id.clone();
                records.entry(id).or_default().current = Some(pod);
            }

            let mut out = Vec::new();
            for (uid, record) in records.iter() {
                let mut ids: Vec<&ContainerId> = Vec::new();
                let mut seen = HashSet::new();
                for pod in [record.old.as_ref(), record.current.as_ref()].into_iter().flatten() {
                    for c in &pod.containers {
                        if seen.insert(&c.id) {
                            ids.push(&c.id);
                        }
                    }
                }
                let events: Vec<PodLifecycleEvent> = ids
                    .into_iter()
                    .flat_map(|cid| {
                        generate_events(
                            uid,
                            cid,
                            container_state(record.old.as_ref(), cid),
                            container_state(record.current.as_ref(), cid),
                        )
                    })
                    .collect();
                let names = record
                    .current
                    .as_ref()
                    .or(record.old.as_ref())
                    .map(|p| (p.name.clone(), p.namespace.clone()));
                out.push((uid.clone(), names, events));
            }
            out
        };

        for (uid, names, events) in events_by_pod {
            if !events.is_empty() {
                let (name, namespace) = names.unwrap_or_default();
                match self.runtime.get_pod_status(&uid, &name, &namespace).await {
                    Ok(status) => {
                        self.cache.set(uid.clone(), status, None, timestamp);
                    }
                    Err(e) => {
                        error!(pod_uid = %uid, error = %e, "PLEG: Ignoring events for pod");
                        continue;
                    }
                }
            }

            {
                let mut records = self.records.lock();
                if let Some(record) = records.get_mut(&uid) {
                    record.old = record.current.take();
                    if record.old.is_none() {
                        records.remove(&uid);
                    }
                }
            }

            for event in events {
                debug!(pod_uid = %event.id, event_type = ?event.event_type, "PLEG: Emitting event");
                if let Err(e) = self.sender.try_send(event) {
                    error!(error = %e, "Event channel is full, discard this relist() cycle event");
                }
            }
        }

        self.cache.update_time(timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;

    fn uid(s: &str) -> PodUid {
        PodUid::new(s).unwrap()
    }

    fn build_pleg(runtime: &Arc<FakeRuntime>, capacity: usize) -> (Arc<GenericPleg>, Arc<PodCache>) {
        let cache = Arc::new(PodCache::new());
        let pleg = Arc::new(GenericPleg::new(
            Arc::clone(runtime) as Arc<dyn ContainerRuntime>,
            Arc::clone(&cache),
            Duration::from_secs(1),
            capacity,
        ));
        (pleg, cache)
    }

    #[tokio::test]
    async fn relist_emits_transitions() {
        let runtime = Arc::new(FakeRuntime::default());
        let (pleg, cache) = build_pleg(&runtime, 100);
        let mut events = pleg.watch().unwrap();
        assert!(pleg.watch().is_none());

        runtime.set_container(&uid("p1"), "app", ContainerState::Running);
        pleg.relist().await;
        let started = events.try_recv().unwrap();
        assert_eq!(started.event_type, PodLifecycleEventType::ContainerStarted);
        assert!(cache.get(&uid("p1")).is_some());
        assert!(pleg.healthy().is_ok());

        pleg.relist().await;
        assert!(events.try_recv().is_err());

        runtime.set_container(&uid("p1"), "app", ContainerState::Exited);
        pleg.relist().await;
        assert_eq!(
            events.try_recv().unwrap().event_type,
            PodLifecycleEventType::ContainerDied
        );

        runtime.remove_pod(&uid("p1"));
        pleg.relist().await;
        let removed = events.try_recv().unwrap();
        assert_eq!(removed.event_type, PodLifecycleEventType::ContainerRemoved);
        assert!(!removed.is_sync_worthy());
    }

    #[tokio::test]
    async fn running_container_vanishing_dies_then_is_removed() {
        let runtime = Arc::new(FakeRuntime::default());
        let (pleg, _) = build_pleg(&runtime, 100);
        let mut events = pleg.watch().unwrap();

        runtime.set_container(&uid("p1"), "app", ContainerState::Running);
        pleg.relist().await;
        let _ = events.try_recv();

        runtime.remove_pod(&uid("p1"));
        pleg.relist().await;
        assert_eq!(
            events.try_recv().unwrap().event_type,
            PodLifecycleEventType::ContainerDied
        );
        assert_eq!(
            events.try_recv().unwrap().event_type,
            PodLifecycleEventType::ContainerRemoved
        );
    }

    #[tokio::test]
    async fn full_channel_drops_events() {
        let runtime = Arc::new(FakeRuntime::default());
        let (pleg, _) = build_pleg(&runtime, 1);
        let mut events = pleg.watch().unwrap();

        runtime.set_container(&uid("p1"), "a", ContainerState::Running);
        runtime.set_container(&uid("p1"), "b", ContainerState::Running);
        pleg.relist().await;

        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn unhealthy_before_first_relist() {
        let runtime = Arc::new(FakeRuntime::default());
        let (pleg, _) = build_pleg(&runtime, 1);
        assert!(pleg.healthy().is_err());
    }
}
