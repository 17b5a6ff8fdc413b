//! Restart-on-failure supervision for long-lived background workers.
//!
//! A [`Supervisor`] runs one [`Supervised`] worker in its own tokio task. When
//! the worker returns an error or panics, the supervisor logs it, counts it,
//! waits for an exponential backoff, and starts the worker again. A clean
//! return or a stop request ends supervision.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Supervised trait
// ---------------------------------------------------------------------------

/// A worker that can be (re)started by a [`Supervisor`].
#[async_trait]
pub trait Supervised: Send + Sync + 'static {
    /// Name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Run until `shutdown` flips to `true` or the worker fails.
    ///
    /// Each restart calls `run` again on the same instance.
    async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()>;

    /// Called before each restart with the running restart count. Default is a no-op.
    fn on_restart(&self, _restarts: u64) {}

    /// Called once when supervision ends. Default is a no-op.
    fn on_stop(&self) {}
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Backoff settings between restarts.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RestartPolicy {
    fn delay(&self, restarts: u64) -> Duration {
        let exponent = u32::try_from(restarts.saturating_sub(1).min(16)).unwrap_or(16);
        self.initial_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Handle to a supervised worker.
pub struct Supervisor {
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawn the supervision task and start `worker` immediately.
    pub fn start<W: Supervised>(worker: Arc<W>, policy: RestartPolicy) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let name = worker.name();
            let mut restarts = 0u64;

            loop {
                let exit = tokio::spawn(Arc::clone(&worker).run(shutdown_rx.clone())).await;

                if *shutdown_rx.borrow() {
                    break;
                }
                match exit {
                    Ok(Ok(())) => {
                        info!(worker = name, "worker exited");
                        break;
                    }
                    Ok(Err(err)) => error!(worker = name, error = %err, "worker failed"),
                    Err(join_err) if join_err.is_panic() => {
                        error!(worker = name, "worker panicked");
                    }
                    Err(_) => {
                        warn!(worker = name, "worker task cancelled");
                        break;
                    }
                }

                restarts += 1;
                metrics::counter!("ffm_supervisor_restarts_total", "worker" => name).increment(1);
                worker.on_restart(restarts);

                let delay = policy.delay(restarts);
                info!(worker = name, restarts, ?delay, "restarting worker");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }

            worker.on_stop();
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Whether supervision is still active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the worker to stop and wait for supervision to end.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
