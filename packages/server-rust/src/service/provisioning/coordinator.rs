//! Background consumer that applies provisioning requests.
//!
//! The coordinator takes one delivery at a time off the provisioning queue,
//! applies it through the repositories, posts the [`CompletionSignal`] to the
//! waiting caller, and only then acknowledges the delivery. It runs under a
//! [`Supervisor`](crate::service::supervisor::Supervisor); a crash leaves the
//! in-flight delivery unacknowledged, so the broker hands it out again.
//!
//! Redelivery never duplicates an entity:
//! - outcomes are remembered per request id and replayed on redelivery,
//! - creates use the request id as the entity id, so a second insert hits the
//!   primary key and is recognized as the original success,
//! - deletes that find nothing on a redelivered message count as done.
//!
//! A request that keeps crashing the coordinator is dead-lettered: once it has
//! been handed out `max_delivery_attempts` times, the next delivery is
//! rejected without requeue and its caller gets a store failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use ffm_core::{ClockSource, EntityId, Envelope, ProvisioningRequest, RequestId};
use quick_cache::sync::Cache as QuickCache;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::error::{CompletionSignal, ProvisioningError, ProvisioningOutcome};
use super::pending::PendingCompletions;
use crate::broker::Delivery;
use crate::service::config::ServerConfig;
use crate::service::supervisor::Supervised;
use crate::storage::{StoreError, UserCache};
use crate::traits::{ContractRepository, MessageBroker, UserRepository};

// ---------------------------------------------------------------------------
// CoordinatorState / CoordinatorHealth
// ---------------------------------------------------------------------------

/// Lifecycle of the coordinator as seen by the gateway and health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Constructed, not started yet.
    Idle,
    AwaitingMessage,
    Processing,
    /// Crashed; the supervisor is about to start it again.
    Restarting,
    Stopped,
}

impl CoordinatorState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingMessage => "awaiting_message",
            Self::Processing => "processing",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        }
    }
}

/// Shared view of the coordinator's state and counters.
#[derive(Debug)]
pub struct CoordinatorHealth {
    state: ArcSwap<CoordinatorState>,
    restarts: AtomicU64,
    processed: AtomicU64,
}

impl CoordinatorHealth {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(CoordinatorState::Idle),
            restarts: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        **self.state.load()
    }

    pub fn set_state(&self, state: CoordinatorState) {
        self.state.store(Arc::new(state));
    }

    /// Whether submissions can currently expect a completion signal.
    ///
    /// A restarting coordinator counts as running; its queue keeps filling
    /// until it comes back.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !matches!(self.state(), CoordinatorState::Idle | CoordinatorState::Stopped)
    }

    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Deliveries acknowledged so far.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl Default for CoordinatorHealth {
    fn default() -> Self {
        Self::new()
    }
}

type Outcome = Result<ProvisioningOutcome, ProvisioningError>;

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Collaborators the coordinator applies requests with.
pub struct CoordinatorDeps {
    pub broker: Arc<dyn MessageBroker>,
    pub users: Arc<dyn UserRepository>,
    pub contracts: Arc<dyn ContractRepository>,
    pub pending: Arc<PendingCompletions>,
    pub user_cache: Arc<UserCache>,
    pub clock: Arc<dyn ClockSource>,
    pub health: Arc<CoordinatorHealth>,
}

/// The provisioning queue consumer.
pub struct Coordinator {
    queue: String,
    max_delivery_attempts: u32,
    deps: CoordinatorDeps,
    outcomes: QuickCache<RequestId, Outcome>,
    /// Deliveries seen per request that has not finished yet.
    attempts: QuickCache<RequestId, u32>,
}

impl Coordinator {
    #[must_use]
    pub fn new(config: &ServerConfig, deps: CoordinatorDeps) -> Self {
        let capacity = config.outcome_cache_capacity.max(1);
        Self {
            queue: config.queue_name.clone(),
            max_delivery_attempts: config.max_delivery_attempts.max(1),
            deps,
            outcomes: QuickCache::new(capacity),
            attempts: QuickCache::new(capacity),
        }
    }

    #[must_use]
    pub fn health(&self) -> &Arc<CoordinatorHealth> {
        &self.deps.health
    }

    /// Forget remembered outcomes.
    pub fn clear_outcomes(&self) {
        self.outcomes.clear();
    }

    /// Decode, apply, signal, acknowledge.
    pub async fn process(&self, delivery: Delivery) {
        self.deps.health.set_state(CoordinatorState::Processing);

        let envelope = match Envelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(tag = delivery.tag, error = %err, "dropping undecodable provisioning message");
                metrics::counter!("ffm_coordinator_messages_total", "outcome" => "undecodable")
                    .increment(1);
                delivery.ack();
                return;
            }
        };

        let request_id = envelope.request_id;
        let operation = envelope.request.operation();
        let span = info_span!(
            "provisioning",
            request_id = %request_id,
            operation,
            redelivered = delivery.redelivered
        );

        let outcome = async {
            if let Some(outcome) = self.outcomes.get(&request_id) {
                debug!("request already processed, replaying outcome");
                return Some(outcome);
            }
            // Counted before applying: a delivery that panics never gets further.
            let attempt = self.attempts.get(&request_id).unwrap_or(0) + 1;
            if attempt > self.max_delivery_attempts {
                return None;
            }
            self.attempts.insert(request_id, attempt);
            let outcome = self.apply(envelope, delivery.redelivered).await;
            self.attempts.remove(&request_id);
            self.outcomes.insert(request_id, outcome.clone());
            Some(outcome)
        }
        .instrument(span.clone())
        .await;

        let Some(outcome) = outcome else {
            self.dead_letter(request_id, delivery, &span);
            return;
        };

        let label = match &outcome {
            Ok(done) => {
                info!(parent: &span, id = %done.id(), "provisioning request completed");
                "completed"
            }
            Err(err) => {
                warn!(parent: &span, error = %err, kind = err.kind(), "provisioning request failed");
                "failed"
            }
        };
        metrics::counter!("ffm_coordinator_messages_total", "outcome" => label).increment(1);

        if !self.deps.pending.complete(CompletionSignal {
            request_id,
            outcome,
        }) {
            warn!(parent: &span, "caller no longer waiting, discarding completion signal");
            metrics::counter!("ffm_coordinator_late_signals_total").increment(1);
        }

        delivery.ack();
        self.deps.health.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Give up on a request that failed every allowed delivery.
    fn dead_letter(&self, request_id: RequestId, delivery: Delivery, span: &tracing::Span) {
        error!(
            parent: span,
            tag = delivery.tag,
            attempts = self.max_delivery_attempts,
            "provisioning request keeps crashing the coordinator, dead-lettering it"
        );
        metrics::counter!("ffm_coordinator_messages_total", "outcome" => "dead_lettered")
            .increment(1);

        let outcome: Outcome = Err(ProvisioningError::Store(format!(
            "request abandoned after {} delivery attempts",
            self.max_delivery_attempts
        )));
        self.attempts.remove(&request_id);
        self.outcomes.insert(request_id, outcome.clone());
        if !self.deps.pending.complete(CompletionSignal {
            request_id,
            outcome,
        }) {
            debug!(parent: span, "caller no longer waiting for the dead-lettered request");
        }

        delivery.nack(false);
        self.deps.health.processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn apply(&self, envelope: Envelope, redelivered: bool) -> Outcome {
        let now = self.deps.clock.now_millis();
        let derived_id = EntityId::from(envelope.request_id);

        match envelope.request {
            ProvisioningRequest::CreateUser(new_user) => {
                let user = new_user.into_user(derived_id, now);
                match self.deps.users.insert(user).await {
                    Ok(stored) => Ok(ProvisioningOutcome::Created { id: stored.id }),
                    Err(StoreError::Conflict { constraint }) => {
                        if self.deps.users.find_by_id(derived_id).await.is_ok() {
                            debug!(%constraint, "user from an earlier delivery already stored");
                            Ok(ProvisioningOutcome::Created { id: derived_id })
                        } else {
                            Err(ProvisioningError::Conflict { constraint })
                        }
                    }
                    Err(err) => Err(err.into()),
                }
            }
            ProvisioningRequest::UpdateUser { id, changes } => {
                let result = self.deps.users.update(id, changes, now).await;
                self.deps.user_cache.invalidate(&id);
                result?;
                Ok(ProvisioningOutcome::Updated { id })
            }
            ProvisioningRequest::DeleteUser { id } => {
                let result = self.deps.users.delete(id).await;
                self.deps.user_cache.invalidate(&id);
                deleted(id, result, redelivered)
            }
            ProvisioningRequest::CreateContract(new_contract) => {
                let contract = new_contract.into_contract(derived_id, now)?;
                match self.deps.contracts.insert(contract).await {
                    Ok(stored) => Ok(ProvisioningOutcome::Created { id: stored.id }),
                    Err(StoreError::Conflict { constraint }) => {
                        if self.deps.contracts.find_by_id(derived_id).await.is_ok() {
                            debug!(%constraint, "contract from an earlier delivery already stored");
                            Ok(ProvisioningOutcome::Created { id: derived_id })
                        } else {
                            Err(ProvisioningError::Conflict { constraint })
                        }
                    }
                    Err(err) => Err(err.into()),
                }
            }
            ProvisioningRequest::DeleteContract { id } => {
                let result = self.deps.contracts.delete(id).await;
                deleted(id, result, redelivered)
            }
        }
    }
}

fn deleted(id: EntityId, result: Result<(), StoreError>, redelivered: bool) -> Outcome {
    match result {
        Ok(()) => Ok(ProvisioningOutcome::Deleted { id }),
        Err(StoreError::NotFound) if redelivered => {
            debug!(%id, "already deleted by an earlier delivery");
            Ok(ProvisioningOutcome::Deleted { id })
        }
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl Supervised for Coordinator {
    fn name(&self) -> &'static str {
        "provisioning-coordinator"
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut subscription = self.deps.broker.subscribe(&self.queue).await?;
        info!(queue = %self.queue, "provisioning coordinator consuming");

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            self.deps.health.set_state(CoordinatorState::AwaitingMessage);
            tokio::select! {
                delivery = subscription.next() => match delivery {
                    Some(delivery) => self.process(delivery).await,
                    None => {
                        warn!(queue = %self.queue, "broker closed the provisioning queue");
                        return Ok(());
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn on_restart(&self, restarts: u64) {
        self.deps.health.restarts.store(restarts, Ordering::Relaxed);
        self.deps.health.set_state(CoordinatorState::Restarting);
    }

    fn on_stop(&self) {
        self.deps.health.set_state(CoordinatorState::Stopped);
        info!("provisioning coordinator stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
