//! Pod admission.
//!
//! Two ordered handler lists share the [`PodAdmitHandler`] capability:
//! hard handlers run once when a pod is added and reject it permanently,
//! soft handlers run on every sync and only keep the pod from starting.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;

use crate::pod;
use crate::types::NodeAllocatable;

/// Input of an admission check.
#[derive(Debug, Clone, Copy)]
pub struct PodAdmitAttributes<'a> {
    /// Candidate pod.
    pub pod: &'a Pod,
    /// Pods already admitted and not terminated.
    pub other_pods: &'a [Arc<Pod>],
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodAdmitResult {
    /// Whether the pod is admitted.
    pub admit: bool,
    /// Machine-readable reason for a rejection.
    pub reason: String,
    /// Human-readable message for a rejection.
    pub message: String,
}

impl PodAdmitResult {
    /// An admitted result.
    #[must_use]
    pub fn admitted() -> Self {
        Self {
            admit: true,
            reason: String::new(),
            message: String::new(),
        }
    }

    /// A rejected result.
    #[must_use]
    pub fn rejected(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            admit: false,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// An admission check.
pub trait PodAdmitHandler: Send + Sync {
    /// Decide whether the pod may be admitted.
    fn admit(&self, attrs: &PodAdmitAttributes<'_>) -> PodAdmitResult;
}

/// An ordered list of admission handlers; the first rejection wins.
#[derive(Clone, Default)]
pub struct AdmitHandlers {
    handlers: Vec<Arc<dyn PodAdmitHandler>>,
}

impl fmt::Debug for AdmitHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmitHandlers")
            .field("len", &self.handlers.len())
            .finish()
    }
}

impl AdmitHandlers {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler.
    pub fn add_handler(&mut self, handler: Arc<dyn PodAdmitHandler>) {
        self.handlers.push(handler);
    }

    /// Run every handler in order and return the first rejection.
    #[must_use]
    pub fn admit(&self, attrs: &PodAdmitAttributes<'_>) -> PodAdmitResult {
        self.handlers
            .iter()
            .map(|h| h.admit(attrs))
            .find(|r| !r.admit)
            .unwrap_or_else(PodAdmitResult::admitted)
    }

    /// Number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the list has no handlers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Rejects pods that do not fit the node's allocatable resources.
#[derive(Debug, Clone)]
pub struct ResourceFitAdmitHandler {
    allocatable: NodeAllocatable,
}

impl ResourceFitAdmitHandler {
    /// Create a handler for a node with the given allocatable resources.
    #[must_use]
    pub fn new(allocatable: NodeAllocatable) -> Self {
        Self { allocatable }
    }
}

// A total that overflowed never fits.
fn exceeds<T: PartialOrd>(total: Option<T>, capacity: T) -> bool {
    total.map_or(true, |total| total > capacity)
}

fn insufficient(
    resource: &str,
    requested: impl fmt::Display,
    used: impl fmt::Display,
    capacity: impl fmt::Display,
) -> PodAdmitResult {
    PodAdmitResult::rejected(
        format!("OutOf{resource}"),
        format!(
            "Node didn't have enough resource: {resource}, requested: {requested}, used: {used}, capacity: {capacity}"
        ),
    )
}

impl PodAdmitHandler for ResourceFitAdmitHandler {
    fn admit(&self, attrs: &PodAdmitAttributes<'_>) -> PodAdmitResult {
        let candidate_uid = attrs.pod.metadata.uid.as_deref();
        let others: Vec<&Pod> = attrs
            .other_pods
            .iter()
            .map(|p| &**p)
            .filter(|p| p.metadata.uid.as_deref() != candidate_uid)
            .collect();

        if others.len() + 1 > self.allocatable.max_pods {
            return insufficient(
                pod::RESOURCE_PODS,
                1,
                others.len(),
                self.allocatable.max_pods,
            );
        }

        let requested = pod::pod_requests(attrs.pod);
        let mut used = pod::PodRequests::default();
        for other in &others {
            used.add(&pod::pod_requests(other));
        }

        if requested.cpu_millicores > 0
            && exceeds(
                used.cpu_millicores.checked_add(requested.cpu_millicores),
                self.allocatable.cpu_millicores,
            )
        {
            return insufficient(
                pod::RESOURCE_CPU,
                requested.cpu_millicores,
                used.cpu_millicores,
                self.allocatable.cpu_millicores,
            );
        }
        if requested.memory_bytes > 0
            && exceeds(
                used.memory_bytes.checked_add(requested.memory_bytes),
                self.allocatable.memory_bytes,
            )
        {
            return insufficient(
                pod::RESOURCE_MEMORY,
                requested.memory_bytes,
                used.memory_bytes,
                self.allocatable.memory_bytes,
            );
        }
        for (name, count) in requested.extended.iter().filter(|(_, c)| **c > 0) {
            let capacity = self.allocatable.extended.get(name).copied().unwrap_or(0);
            let in_use = used.extended.get(name).copied().unwrap_or(0);
            if exceeds(in_use.checked_add(*count), capacity) {
                return insufficient(name, count, in_use, capacity);
            }
        }

        PodAdmitResult::admitted()
    }
}

/// Blocks pods that disable privilege escalation when the runtime cannot
/// enforce `no_new_privs`.
#[derive(Debug, Clone, Copy)]
pub struct NoNewPrivsAdmitHandler {
    supported: bool,
}

impl NoNewPrivsAdmitHandler {
    /// Reason reported on rejection.
    pub const REASON: &'static str = "NoNewPrivs";

    /// Create a handler for a runtime that does or does not support
    /// `no_new_privs`.
    #[must_use]
    pub const fn new(supported: bool) -> Self {
        Self { supported }
    }
}

impl PodAdmitHandler for NoNewPrivsAdmitHandler {
    fn admit(&self, attrs: &PodAdmitAttributes<'_>) -> PodAdmitResult {
        if self.supported {
            return PodAdmitResult::admitted();
        }
        let wants_no_new_privs = pod::init_containers(attrs.pod)
            .iter()
            .chain(pod::containers(attrs.pod))
            .any(|c| {
                c.security_context
                    .as_ref()
                    .and_then(|s| s.allow_privilege_escalation)
                    == Some(false)
            });
        if wants_no_new_privs {
            PodAdmitResult::rejected(
                Self::REASON,
                "Cannot enforce NoNewPrivs: the container runtime does not support it",
            )
        } else {
            PodAdmitResult::admitted()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements, SecurityContext};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    fn pod_requesting(uid: &str, requests: &[(&str, &str)]) -> Arc<Pod> {
        Arc::new(Pod {
            metadata: ObjectMeta {
                name: Some(uid.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "c".into(),
                    resources: Some(ResourceRequirements {
                        requests: Some(
                            requests
                                .iter()
                                .map(|(k, v)| ((*k).to_string(), Quantity((*v).to_string())))
                                .collect::<BTreeMap<_, _>>(),
                        ),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        })
    }

    fn allocatable() -> NodeAllocatable {
        NodeAllocatable {
            cpu_millicores: 1000,
            memory_bytes: 1 << 30,
            max_pods: 3,
            extended: BTreeMap::from([("example.com/gpu".to_string(), 1)]),
        }
    }

    #[test]
    fn resource_fit_rejects_exhausted_gpu() {
        let handler = ResourceFitAdmitHandler::new(allocatable());
        let existing = vec![pod_requesting("p1", &[("example.com/gpu", "1")])];
        let candidate = pod_requesting("p2", &[("example.com/gpu", "1")]);

        let result = handler.admit(&PodAdmitAttributes {
            pod: &candidate,
            other_pods: &existing,
        });
        assert!(!result.admit);
        assert_eq!(result.reason, "OutOfexample.com/gpu");
        assert!(result.message.contains("capacity: 1"));
    }

    #[test]
    fn resource_fit_rejects_overflowing_totals() {
        let mut node = allocatable();
        node.extended.insert("example.com/gpu".to_string(), i64::MAX);
        let handler = ResourceFitAdmitHandler::new(node);
        let existing = vec![pod_requesting("p1", &[("example.com/gpu", "9223372036854775807")])];
        let candidate = pod_requesting("p2", &[("example.com/gpu", "1")]);

        let result = handler.admit(&PodAdmitAttributes {
            pod: &candidate,
            other_pods: &existing,
        });
        assert!(!result.admit);
        assert_eq!(result.reason, "OutOfexample.com/gpu");
    }

    #[test]
    fn resource_fit_checks_cpu_and_pod_count() {
        let handler = ResourceFitAdmitHandler::new(allocatable());
        let existing = vec![pod_requesting("p1", &[("cpu", "800m")])];

        let too_big = pod_requesting("p2", &[("cpu", "300m")]);
        let result = handler.admit(&PodAdmitAttributes {
            pod: &too_big,
            other_pods: &existing,
        });
        assert_eq!(result.reason, "OutOfcpu");

        let fits = pod_requesting("p3", &[("cpu", "200m")]);
        assert!(handler
            .admit(&PodAdmitAttributes {
                pod: &fits,
                other_pods: &existing,
            })
            .admit);

        let crowded: Vec<_> = (0..3).map(|i| pod_requesting(&format!("e{i}"), &[])).collect();
        let result = handler.admit(&PodAdmitAttributes {
            pod: &fits,
            other_pods: &crowded,
        });
        assert_eq!(result.reason, "OutOfpods");
    }

    #[test]
    fn resource_fit_ignores_the_candidate_itself() {
        let handler = ResourceFitAdmitHandler::new(allocatable());
        let pod = pod_requesting("p1", &[("example.com/gpu", "1")]);
        let others = vec![Arc::clone(&pod)];
        assert!(handler
            .admit(&PodAdmitAttributes {
                pod: &pod,
                other_pods: &others,
            })
            .admit);
    }

    #[test]
    fn first_rejection_wins() {
        let mut handlers = AdmitHandlers::new();
        handlers.add_handler(Arc::new(ResourceFitAdmitHandler::new(allocatable())));
        handlers.add_handler(Arc::new(NoNewPrivsAdmitHandler::new(false)));
        assert_eq!(handlers.len(), 2);

        let mut pod = (*pod_requesting("p1", &[("cpu", "2")])).clone();
        pod.spec.as_mut().unwrap().containers[0].security_context = Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            ..Default::default()
        });
        let result = handlers.admit(&PodAdmitAttributes {
            pod: &pod,
            other_pods: &[],
        });
        assert_eq!(result.reason, "OutOfcpu");

        pod.spec.as_mut().unwrap().containers[0].resources = None;
        let result = handlers.admit(&PodAdmitAttributes {
            pod: &pod,
            other_pods: &[],
        });
        assert_eq!(result.reason, NoNewPrivsAdmitHandler::REASON);

        assert!(AdmitHandlers::new()
            .admit(&PodAdmitAttributes {
                pod: &pod,
                other_pods: &[],
            })
            .admit);
    }
}
