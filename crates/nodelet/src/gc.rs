//! Periodic container and image garbage collection.
//!
//! The collection algorithms live behind [`ContainerGc`] and [`ImageGc`]; the
//! sync core only runs them on their own tickers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::Result;
use crate::events::{reasons, EventRecorder, EventType};

/// Consecutive image GC failures before an event is emitted.
pub const IMAGE_GC_FAILURE_EVENT_THRESHOLD: u32 = 5;

/// Removes dead containers.
#[async_trait]
pub trait ContainerGc: Send + Sync {
    /// Run one collection.
    async fn garbage_collect(&self) -> Result<()>;
}

/// Removes unused images.
#[async_trait]
pub trait ImageGc: Send + Sync {
    /// Run one collection.
    async fn garbage_collect(&self) -> Result<()>;
}

/// Spawn the container and image GC tickers.
///
/// The first collection runs one period after start-up. An image GC failure
/// is only logged until it fails [`IMAGE_GC_FAILURE_EVENT_THRESHOLD`] times in
/// a row, at which point an `ImageGCFailed` node event is recorded.
pub fn start_garbage_collection(
    container_gc: Arc<dyn ContainerGc>,
    image_gc: Arc<dyn ImageGc>,
    recorder: Arc<dyn EventRecorder>,
    container_gc_period: Duration,
    image_gc_period: Duration,
) -> Vec<JoinHandle<()>> {
    let container_task = {
        let recorder = Arc::clone(&recorder);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + container_gc_period;
            let mut ticker = tokio::time::interval_at(start, container_gc_period);
            loop {
                ticker.tick().await;
                if let Err(e) = container_gc.garbage_collect().await {
                    error!(error = %e, "Container garbage collection failed");
                    recorder
                        .node_event(
                            EventType::Warning,
                            reasons::CONTAINER_GC_FAILED,
                            &e.to_string(),
                        )
                        .await;
                }
            }
        })
    };

    let image_task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + image_gc_period;
        let mut ticker = tokio::time::interval_at(start, image_gc_period);
        let mut consecutive_failures = 0u32;
        loop {
            ticker.tick().await;
            match image_gc.garbage_collect().await {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= IMAGE_GC_FAILURE_EVENT_THRESHOLD {
                        error!(error = %e, failures = consecutive_failures, "Image garbage collection failed multiple times in a row");
                        recorder
                            .node_event(EventType::Warning, reasons::IMAGE_GC_FAILED, &e.to_string())
                            .await;
                    } else {
                        warn!(error = %e, "Image garbage collection failed once. Stats initialization may not have completed yet");
                    }
                }
            }
        }
    });

    vec![container_task, image_task]
}
