//! Server lifecycle state and drain tracking for provisioning requests.
//!
//! Handlers that submit to the pipeline hold an [`InFlightGuard`] while they
//! wait for their completion signal. Draining waits on the in-flight count
//! through a `watch` channel, so it wakes as soon as the last guard drops.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Where the server is in its lifecycle: Starting, Ready, Draining, Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    /// Accepting provisioning requests.
    Ready,
    /// Refusing readiness; waiting for in-flight submissions.
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Lifecycle state plus the number of submissions still waiting on the
/// coordinator.
#[derive(Debug)]
pub struct ShutdownController {
    state: ArcSwap<HealthState>,
    in_flight: Arc<watch::Sender<u64>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            state: ArcSwap::from_pointee(HealthState::Starting),
            in_flight: Arc::new(in_flight),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// Stop reporting ready. In-flight submissions keep running.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HealthState::Draining));
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    /// Count one submission until the returned guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.send_modify(|n| *n += 1);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        *self.in_flight.borrow()
    }

    /// Wait up to `timeout` for the in-flight count to reach zero.
    ///
    /// On success the state becomes `Stopped`; on timeout it is left as is.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut count = self.in_flight.subscribe();
        let drained = tokio::time::timeout(timeout, count.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|seen| seen.is_ok());
        if drained {
            self.state.store(Arc::new(HealthState::Stopped));
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count on drop, unwinding included.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<watch::Sender<u64>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}
