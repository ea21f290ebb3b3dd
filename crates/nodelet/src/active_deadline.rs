//! Enforcement of `activeDeadlineSeconds`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

use crate::events::reasons;
use crate::pod;
use crate::status_manager::StatusManager;

/// Decides whether a pod must be re-synced on the periodic tick.
pub trait PodSyncLoopHandler: Send + Sync {
    /// Whether the pod needs a sync now.
    fn should_sync(&self, pod: &Pod) -> bool;
}

/// Verdict of a [`PodSyncHandler`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShouldEvictResponse {
    /// Whether the pod must be failed.
    pub evict: bool,
    /// Reason recorded on the pod.
    pub reason: String,
    /// Message recorded on the pod.
    pub message: String,
}

/// Decides during status generation whether a pod must be failed.
pub trait PodSyncHandler: Send + Sync {
    /// Whether the pod must be failed, and why.
    fn should_evict(&self, pod: &Pod) -> ShouldEvictResponse;
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Fails pods that have been active longer than their deadline.
pub struct ActiveDeadlineHandler {
    status_manager: Arc<StatusManager>,
    clock: Clock,
}

impl std::fmt::Debug for ActiveDeadlineHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveDeadlineHandler").finish_non_exhaustive()
    }
}

impl ActiveDeadlineHandler {
    /// Message recorded on pods past their deadline.
    pub const MESSAGE: &'static str = "Pod was active on the node longer than the specified deadline";

    /// Create a handler reading start times from `status_manager`.
    #[must_use]
    pub fn new(status_manager: Arc<StatusManager>) -> Self {
        Self::with_clock(status_manager, Arc::new(Utc::now))
    }

    /// Create a handler with an explicit clock.
    #[must_use]
    pub fn with_clock(status_manager: Arc<StatusManager>, clock: Clock) -> Self {
        Self {
            status_manager,
            clock,
        }
    }

    fn past_active_deadline(&self, pod: &Pod) -> bool {
        let Some(deadline) = pod.spec.as_ref().and_then(|s| s.active_deadline_seconds) else {
            return false;
        };
        let Ok(uid) = pod::pod_uid(pod) else {
            return false;
        };
        let start = self
            .status_manager
            .get_pod_status(&uid)
            .or_else(|| pod.status.clone())
            .and_then(|s| s.start_time)
            .map(|t| t.0);
        let Some(start) = start else {
            return false;
        };
        (self.clock)().signed_duration_since(start).num_seconds() >= deadline
    }
}

impl PodSyncLoopHandler for ActiveDeadlineHandler {
    fn should_sync(&self, pod: &Pod) -> bool {
        self.past_active_deadline(pod)
    }
}

impl PodSyncHandler for ActiveDeadlineHandler {
    fn should_evict(&self, pod: &Pod) -> ShouldEvictResponse {
        if self.past_active_deadline(pod) {
            ShouldEvictResponse {
                evict: true,
                reason: reasons::DEADLINE_EXCEEDED.to_string(),
                message: Self::MESSAGE.to_string(),
            }
        } else {
            ShouldEvictResponse::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod_manager::PodManager;
    use crate::testing;
    use chrono::Duration;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    #[test]
    fn pods_past_deadline_are_evicted() {
        let started = Utc::now() - Duration::seconds(120);
        let mut pod = (*testing::pod("uid-1", "job")).clone();
        pod.spec.as_mut().unwrap().active_deadline_seconds = Some(60);
        pod.status = Some(PodStatus {
            start_time: Some(Time(started)),
            ..Default::default()
        });

        let status_manager = Arc::new(StatusManager::new(Arc::new(PodManager::new())));
        let handler = ActiveDeadlineHandler::new(Arc::clone(&status_manager));
        assert!(handler.should_sync(&pod));
        let verdict = handler.should_evict(&pod);
        assert!(verdict.evict);
        assert_eq!(verdict.reason, "DeadlineExceeded");

        let early = ActiveDeadlineHandler::with_clock(
            status_manager,
            Arc::new(move || started + Duration::seconds(30)),
        );
        assert!(!early.should_sync(&pod));
        assert!(!early.should_evict(&pod).evict);
    }

    #[test]
    fn pods_without_deadline_are_left_alone() {
        let pod = testing::pod("uid-1", "web");
        let handler =
            ActiveDeadlineHandler::new(Arc::new(StatusManager::new(Arc::new(PodManager::new()))));
        assert!(!handler.should_sync(&pod));
    }
}
