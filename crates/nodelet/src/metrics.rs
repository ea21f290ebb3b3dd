//! Prometheus metrics of the sync core.
//!
//! Every [`Metrics`] owns its own [`Registry`], so several node agents (or
//! tests) in one process never share counters.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use crate::error::Result;

const NAMESPACE: &str = "nodelet";

/// Metrics recorded by the pod workers and the sync loop.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    /// Time from a pod being first seen to it running.
    pub pod_start_duration: Histogram,
    /// Duration of one pod sync, by operation type.
    pub pod_worker_duration: HistogramVec,
    /// Time from an update being dispatched to its worker starting on it.
    pub pod_worker_start_duration: Histogram,
    /// Number of pods with a running sandbox.
    pub running_pod_count: IntGauge,
    /// Sync loop iterations skipped because the runtime was unhealthy.
    pub sync_loop_runtime_unhealthy: IntCounter,
    /// Pods rejected at admission, by reason.
    pub admission_rejections: IntCounterVec,
}

impl Metrics {
    /// Create and register every metric in a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric cannot be registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let pod_start_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pod_start_duration_seconds",
                "Duration in seconds for a single pod to go from pending to running",
            )
            .buckets(prometheus::exponential_buckets(0.5, 2.0, 12)?),
        )?;
        let pod_worker_duration = HistogramVec::new(
            HistogramOpts::new(
                "pod_worker_duration_seconds",
                "Duration in seconds to sync a single pod, broken down by operation type",
            ),
            &["operation_type"],
        )?;
        let pod_worker_start_duration = Histogram::with_opts(HistogramOpts::new(
            "pod_worker_start_duration_seconds",
            "Duration in seconds from dispatching a pod update to the worker starting it",
        ))?;
        let running_pod_count = IntGauge::with_opts(Opts::new(
            "running_pod_count",
            "Number of pods that have a running container",
        ))?;
        let sync_loop_runtime_unhealthy = IntCounter::with_opts(Opts::new(
            "sync_loop_runtime_unhealthy_total",
            "Sync loop iterations skipped because the container runtime was unhealthy",
        ))?;
        let admission_rejections = IntCounterVec::new(
            Opts::new(
                "admission_rejections_total",
                "Pods rejected at admission, broken down by reason",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(pod_start_duration.clone()))?;
        registry.register(Box::new(pod_worker_duration.clone()))?;
        registry.register(Box::new(pod_worker_start_duration.clone()))?;
        registry.register(Box::new(running_pod_count.clone()))?;
        registry.register(Box::new(sync_loop_runtime_unhealthy.clone()))?;
        registry.register(Box::new(admission_rejections.clone()))?;

        Ok(Self {
            registry,
            pod_start_duration,
            pod_worker_duration,
            pod_worker_start_duration,
            running_pod_count,
            sync_loop_runtime_unhealthy,
            admission_rejections,
        })
    }

    /// The registry holding every metric.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the text exposition format.
    #[must_use]
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_per_instance() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();

        a.admission_rejections.with_label_values(&["OutOfcpu"]).inc();
        a.pod_start_duration.observe(1.5);

        assert_eq!(a.admission_rejections.with_label_values(&["OutOfcpu"]).get(), 1);
        assert_eq!(b.admission_rejections.with_label_values(&["OutOfcpu"]).get(), 0);
        assert_eq!(a.pod_start_duration.get_sample_count(), 1);
        assert_eq!(b.pod_start_duration.get_sample_count(), 0);
    }

    #[test]
    fn gather_text_renders_namespaced_names() {
        let metrics = Metrics::new().unwrap();
        metrics.running_pod_count.set(3);
        metrics
            .pod_worker_duration
            .with_label_values(&["create"])
            .observe(0.2);

        let text = metrics.gather_text();
        assert!(text.contains("nodelet_running_pod_count 3"));
        assert!(text.contains("nodelet_pod_worker_duration_seconds_count{operation_type=\"create\"} 1"));
    }
}
