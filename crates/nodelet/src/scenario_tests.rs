//! End-to-end scenarios through the sync loop, pod workers and the sync
//! transaction, over in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use nodelet_core::PodUid;

use crate::error::Result;
use crate::pod::API_SERVER_SOURCE;
use crate::pod_config::{PodOperation, PodUpdate};
use crate::status_manager::StatusSink;
use crate::sync_loop::{LivenessUpdate, SyncLoopHandler};
use crate::testing::{self, FakeStatusSink, TestHarness};
use crate::types::PodPhase;

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

struct Running {
    updates: mpsc::Sender<PodUpdate>,
    _liveness: mpsc::Sender<LivenessUpdate>,
    task: JoinHandle<Result<()>>,
}

impl Running {
    async fn send(&self, op: PodOperation, pods: Vec<Arc<Pod>>) {
        self.updates
            .send(PodUpdate::new(API_SERVER_SOURCE, op, pods))
            .await
            .unwrap();
    }

    async fn stop(self) {
        drop(self.updates);
        self.task.await.unwrap().unwrap();
    }
}

fn start(harness: &TestHarness) -> Running {
    let (updates, updates_rx) = mpsc::channel(16);
    let (liveness, liveness_rx) = mpsc::channel(16);
    let sink = Arc::new(FakeStatusSink::default()) as Arc<dyn StatusSink>;
    let task = tokio::spawn(Arc::clone(&harness.kubelet).run(updates_rx, liveness_rx, sink));
    Running {
        updates,
        _liveness: liveness,
        task,
    }
}

fn fast_harness() -> TestHarness {
    TestHarness::with(
        |config| {
            config.runtime_check_period = Duration::from_millis(20);
            config.pleg_relist_period = Duration::from_millis(20);
        },
        Vec::new(),
    )
}

fn phase_of(harness: &TestHarness, uid: &PodUid) -> Option<PodPhase> {
    harness
        .status_manager
        .get_pod_status(uid)
        .map(|status| PodPhase::of(&status))
}

#[tokio::test]
async fn new_pod_is_admitted_and_runs() {
    testing::init_tracing();
    let harness = fast_harness();
    let running = start(&harness);
    let uid = PodUid::new("uid-p").unwrap();

    running
        .send(PodOperation::Add, vec![testing::seen_pod("uid-p", "web")])
        .await;

    wait_for("pod running", || phase_of(&harness, &uid) == Some(PodPhase::Running)).await;
    assert!(harness.kubelet.pod_workers().has_worker(&uid));
    assert_eq!(harness.runtime.started_containers(), 1);
    assert_eq!(harness.metrics.pod_start_duration.get_sample_count(), 1);

    running.stop().await;
}

#[tokio::test]
async fn gpu_exhaustion_rejects_without_a_worker() {
    let harness = TestHarness::with(
        |config| {
            config
                .allocatable
                .extended
                .insert("example.com/gpu".to_string(), 1);
        },
        Vec::new(),
    );
    let first = testing::pod_requesting("uid-a", "trainer", "example.com/gpu", "1");
    let second = testing::pod_requesting("uid-q", "trainer-2", "example.com/gpu", "1");
    let rejected = PodUid::new("uid-q").unwrap();

    harness.kubelet.handle_pod_additions(vec![first]).await;
    harness
        .kubelet
        .handle_pod_additions(vec![Arc::clone(&second)])
        .await;

    let status = harness.status_manager.get_pod_status(&rejected).unwrap();
    assert_eq!(status.phase.as_deref(), Some("Failed"));
    assert_eq!(status.reason.as_deref(), Some("OutOfexample.com/gpu"));
    assert!(status.message.unwrap().starts_with("Pod Node didn't have enough resource"));
    assert!(harness.recorder.has_reason("OutOfexample.com/gpu"));
    assert!(!harness.kubelet.pod_workers().has_worker(&rejected));
    assert_eq!(
        harness
            .metrics
            .admission_rejections
            .with_label_values(&["OutOfexample.com/gpu"])
            .get(),
        1
    );

    // A rejected pod stays failed and is never handed to a worker later.
    harness.kubelet.handle_pod_updates(vec![second]).await;
    assert!(!harness.kubelet.pod_workers().has_worker(&rejected));
    assert_eq!(phase_of(&harness, &rejected), Some(PodPhase::Failed));
}

#[tokio::test]
async fn deletion_while_mounting_kills_before_mounting_again() {
    let harness = TestHarness::new();
    let uid = PodUid::new("uid-r").unwrap();
    let pod = testing::seen_pod("uid-r", "db");
    harness.volume_manager.fail_mounts(true);

    harness
        .kubelet
        .handle_pod_additions(vec![Arc::clone(&pod)])
        .await;
    wait_for("failed mount", || {
        harness.volume_manager.wait_calls() == 1 && !harness.kubelet.pod_workers().is_working(&uid)
    })
    .await;
    assert_eq!(harness.runtime.kill_calls(), 0);

    let mut deleting = (*pod).clone();
    deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
    harness
        .kubelet
        .handle_pod_updates(vec![Arc::new(deleting)])
        .await;

    wait_for("kill", || harness.runtime.kill_calls() == 1).await;
    assert_eq!(harness.volume_manager.wait_calls(), 1);
    assert_eq!(harness.runtime.sync_calls(), 0);
}

#[tokio::test]
async fn sync_loop_waits_for_a_healthy_runtime() {
    let harness = fast_harness();
    harness.runtime.set_runtime_ready(false);
    let running = start(&harness);
    let uid = PodUid::new("uid-p").unwrap();

    running
        .send(PodOperation::Add, vec![testing::seen_pod("uid-p", "web")])
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(harness.pod_manager.get_pod_by_uid(&uid).is_none());
    assert!(harness.metrics.sync_loop_runtime_unhealthy.get() > 0);

    harness.runtime.set_runtime_ready(true);
    wait_for("pod running", || phase_of(&harness, &uid) == Some(PodPhase::Running)).await;

    running.stop().await;
}

#[tokio::test]
async fn removed_source_pods_are_killed() {
    let harness = fast_harness();
    let running = start(&harness);
    let uid = PodUid::new("uid-p").unwrap();
    let pod = testing::seen_pod("uid-p", "web");

    running.send(PodOperation::Add, vec![Arc::clone(&pod)]).await;
    wait_for("pod running", || phase_of(&harness, &uid) == Some(PodPhase::Running)).await;
    wait_for("pod cached", || {
        harness
            .kubelet
            .pod_cache()
            .get(&uid)
            .is_some_and(|(status, _)| status.has_running_containers())
    })
    .await;

    running.send(PodOperation::Remove, vec![pod]).await;
    wait_for("kill", || harness.runtime.killed().contains(&uid)).await;
    wait_for("worker forgotten", || !harness.kubelet.pod_workers().has_worker(&uid)).await;

    running.stop().await;
}
