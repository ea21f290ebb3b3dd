//! Runtime and network health as last reported by the container runtime.

use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use crate::error::NETWORK_NOT_READY_ERROR_MSG;

#[derive(Debug, Default)]
struct State {
    last_base_runtime_sync: Option<Instant>,
    runtime_error: Option<String>,
    network_error: Option<String>,
}

/// Shared record of runtime health.
#[derive(Debug)]
pub struct RuntimeState {
    state: RwLock<State>,
    base_runtime_sync_threshold: Duration,
}

impl RuntimeState {
    /// Create a state that treats the runtime as down once no successful
    /// check happened within `base_runtime_sync_threshold`.
    #[must_use]
    pub fn new(base_runtime_sync_threshold: Duration) -> Self {
        Self {
            state: RwLock::new(State::default()),
            base_runtime_sync_threshold,
        }
    }

    /// Record a successful runtime status check.
    pub fn set_runtime_sync(&self, at: Instant) {
        self.state.write().last_base_runtime_sync = Some(at);
    }

    /// Record or clear the runtime error.
    pub fn set_runtime_state(&self, error: Option<String>) {
        self.state.write().runtime_error = error;
    }

    /// Record or clear the network error.
    pub fn set_network_state(&self, error: Option<String>) {
        self.state.write().network_error = error;
    }

    /// Errors that make the runtime unusable, empty when healthy.
    #[must_use]
    pub fn runtime_errors(&self) -> Vec<String> {
        let state = self.state.read();
        let mut errors = Vec::new();
        match state.last_base_runtime_sync {
            None => errors.push("container runtime status check may not have completed yet".to_string()),
            Some(at) if at.elapsed() > self.base_runtime_sync_threshold => {
                errors.push("container runtime is down".to_string());
            }
            Some(_) => {}
        }
        if let Some(err) = &state.runtime_error {
            errors.push(err.clone());
        }
        errors
    }

    /// Errors that keep pod networking from working, empty when healthy.
    #[must_use]
    pub fn network_errors(&self) -> Vec<String> {
        self.state
            .read()
            .network_error
            .iter()
            .map(|e| format!("{NETWORK_NOT_READY_ERROR_MSG}: {e}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn runtime_errors_follow_sync_age() {
        let state = RuntimeState::new(Duration::from_secs(30));
        assert_eq!(
            state.runtime_errors(),
            vec!["container runtime status check may not have completed yet".to_string()]
        );

        state.set_runtime_sync(Instant::now());
        assert!(state.runtime_errors().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(state.runtime_errors(), vec!["container runtime is down".to_string()]);

        state.set_runtime_sync(Instant::now());
        state.set_runtime_state(Some("runtime not ready".into()));
        assert_eq!(state.runtime_errors(), vec!["runtime not ready".to_string()]);
    }

    #[test]
    fn network_errors_are_prefixed() {
        let state = RuntimeState::new(Duration::from_secs(30));
        assert!(state.network_errors().is_empty());
        state.set_network_state(Some("cni config uninitialized".into()));
        assert_eq!(
            state.network_errors(),
            vec!["network is not ready: cni config uninitialized".to_string()]
        );
        state.set_network_state(None);
        assert!(state.network_errors().is_empty());
    }
}
