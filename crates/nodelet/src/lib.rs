//! Node agent pod lifecycle engine.
//!
//! This crate reconciles the pods a node should run, merged from several
//! config sources, against what a container runtime actually runs. It
//! handles:
//!
//! - Admission of new pods against node resources and soft constraints
//! - One serialized worker per pod, coalescing bursts of updates
//! - The per-pod sync transaction (status, cgroups, volumes, containers)
//! - Pod status deduplication and batched pushes to the API server
//! - Housekeeping of orphaned workers, statuses, directories and cgroups
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//! │ Config srcs  │  │     PLEG     │  │   Tickers    │
//! │ (PodConfig)  │  │  (relister)  │  │ sync / hk    │
//! └──────┬───────┘  └──────┬───────┘  └──────┬───────┘
//!        └─────────────────┼─────────────────┘
//!                          ▼
//!                 ┌─────────────────┐
//!                 │    Sync loop    │
//!                 └────────┬────────┘
//!                          ▼
//!   ┌──────────────┐ ┌───────────┐ ┌──────────────────┐
//!   │ Pod manager  │ │ Admission │ │   Pod workers    │
//!   └──────────────┘ └───────────┘ └────────┬─────────┘
//!                                           ▼
//!                                  ┌─────────────────┐
//!                                  │    Sync pod     │
//!                                  └────────┬────────┘
//!        ┌──────────────┬──────────────┬────┴─────────┐
//!        ▼              ▼              ▼              ▼
//!   ┌─────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//!   │ Runtime │   │ Volumes  │   │ Cgroups  │   │  Status  │
//!   └─────────┘   └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nodelet::k8s::{KubeEventRecorder, KubeMirrorClient, KubePodSource, KubeSecretProvider, KubeStatusSink};
//! use nodelet::{Kubelet, KubeletConfig, KubeletDeps, PodConfig};
//! # use nodelet::{ContainerManager, ContainerRuntime, VolumeManager};
//!
//! # async fn example(
//! #     runtime: Arc<dyn ContainerRuntime>,
//! #     volume_manager: Arc<dyn VolumeManager>,
//! #     container_manager: Arc<dyn ContainerManager>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = KubeletConfig::from_env();
//! let client = kube::Client::try_default().await?;
//!
//! let kubelet = Arc::new(Kubelet::new(
//!     config.clone(),
//!     KubeletDeps {
//!         runtime,
//!         volume_manager,
//!         container_manager,
//!         mirror_client: Arc::new(KubeMirrorClient::new(client.clone(), &config.node_name)),
//!         secrets: Arc::new(KubeSecretProvider::new(client.clone())),
//!         recorder: Arc::new(KubeEventRecorder::new(client.clone(), &config.node_name)),
//!         admit_handlers: Vec::new(),
//!         soft_admit_handlers: Vec::new(),
//!     },
//! )?);
//!
//! let (updates_tx, updates_rx) = tokio::sync::mpsc::channel(50);
//! let (_liveness_tx, liveness_rx) = tokio::sync::mpsc::channel(50);
//! let pod_config = Arc::new(PodConfig::new(updates_tx));
//! let source = KubePodSource::new(client.clone(), &config.node_name, pod_config);
//! tokio::spawn(async move { source.run().await });
//!
//! kubelet
//!     .run(updates_rx, liveness_rx, Arc::new(KubeStatusSink::new(client)))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for in-memory fakes of every
//! collaborator and a fully wired [`testing::TestHarness`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod active_deadline;
pub mod admission;
pub mod backoff;
pub mod cache;
pub mod collaborators;
pub mod error;
pub mod events;
pub mod eviction;
pub mod gc;
pub mod k8s;
pub mod kubelet;
pub mod metrics;
pub mod pleg;
pub mod pod;
pub mod pod_config;
pub mod pod_dirs;
pub mod pod_manager;
pub mod pod_workers;
pub mod reason_cache;
pub mod runtime;
pub mod runtime_state;
pub mod status_manager;
pub mod sync_loop;
pub mod sync_pod;
pub mod types;
pub mod work_queue;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

#[cfg(test)]
mod scenario_tests;

pub use admission::{AdmitHandlers, PodAdmitAttributes, PodAdmitHandler, PodAdmitResult};
pub use collaborators::{ContainerManager, MirrorClient, SecretProvider, VolumeManager};
pub use error::{KubeletError, Result};
pub use events::{EventRecorder, EventType};
pub use kubelet::{Kubelet, KubeletDeps};
pub use nodelet_core::{ContainerId, PodUid};
pub use pod_config::{PodConfig, PodOperation, PodUpdate, SourcesReady};
pub use pod_manager::PodManager;
pub use pod_workers::{PodSyncer, PodWorkers};
pub use runtime::{ContainerRuntime, RunningPod, RuntimePodStatus};
pub use status_manager::{StatusManager, StatusSink};
pub use sync_loop::LivenessUpdate;
pub use types::{KubeletConfig, PodPhase, SyncPodType};
