//! The provisioning pipeline: gateway, completion slots, and coordinator.
//!
//! [`build`] wires one pipeline from its collaborators and returns the
//! [`ProvisioningService`] that owns the supervised coordinator, plus the
//! handles the HTTP layer needs.

pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod pending;

use std::sync::Arc;
use std::time::Duration;

use ffm_core::ClockSource;
use parking_lot::Mutex;
use tracing::info;

pub use coordinator::{Coordinator, CoordinatorDeps, CoordinatorHealth, CoordinatorState};
pub use credentials::Sha256Hasher;
pub use error::{CompletionSignal, ProvisioningError, ProvisioningOutcome};
pub use gateway::ProvisioningGateway;
pub use pending::{PendingCompletions, PendingSlot};

use crate::service::config::ServerConfig;
use crate::service::middleware::ProvisioningPipeline;
use crate::service::supervisor::{RestartPolicy, Supervisor};
use crate::storage::UserCache;
use crate::traits::{ContractRepository, CredentialHasher, MessageBroker, UserRepository};

// ---------------------------------------------------------------------------
// ProvisioningService
// ---------------------------------------------------------------------------

/// Lifecycle owner of the coordinator: [`start`](Self::start) runs it under a
/// supervisor, [`stop`](Self::stop) ends supervision.
pub struct ProvisioningService {
    coordinator: Arc<Coordinator>,
    policy: RestartPolicy,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ProvisioningService {
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator>, policy: RestartPolicy) -> Self {
        Self {
            coordinator,
            policy,
            supervisor: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Start consuming the provisioning queue.
    ///
    /// # Errors
    ///
    /// Fails if the coordinator is already running.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.supervisor.lock();
        if slot.is_some() {
            anyhow::bail!("provisioning coordinator already started");
        }
        // Running before the first await so submissions are accepted at once.
        self.coordinator
            .health()
            .set_state(CoordinatorState::AwaitingMessage);
        *slot = Some(Supervisor::start(Arc::clone(&self.coordinator), self.policy));
        info!("provisioning coordinator started");
        Ok(())
    }

    /// Stop the coordinator; later submissions fail with `CoordinatorDown`.
    pub async fn stop(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(mut supervisor) = supervisor {
            supervisor.stop().await;
        }
        self.coordinator.health().set_state(CoordinatorState::Stopped);
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// External collaborators of a provisioning pipeline.
pub struct ProvisioningDeps {
    pub broker: Arc<dyn MessageBroker>,
    pub users: Arc<dyn UserRepository>,
    pub contracts: Arc<dyn ContractRepository>,
    pub hasher: Arc<dyn CredentialHasher>,
    pub clock: Arc<dyn ClockSource>,
}

/// Everything [`build`] produces.
pub struct Provisioning {
    pub service: ProvisioningService,
    pub pipeline: ProvisioningPipeline,
    pub pending: Arc<PendingCompletions>,
    pub health: Arc<CoordinatorHealth>,
    pub user_cache: Arc<UserCache>,
}

/// Wire gateway, middleware, and coordinator around shared completion slots.
#[must_use]
pub fn build(config: &ServerConfig, deps: ProvisioningDeps) -> Provisioning {
    let pending = Arc::new(PendingCompletions::new());
    let health = Arc::new(CoordinatorHealth::new());
    let user_cache = Arc::new(UserCache::new(config.user_cache_capacity));

    let coordinator = Arc::new(Coordinator::new(
        config,
        CoordinatorDeps {
            broker: Arc::clone(&deps.broker),
            users: deps.users,
            contracts: deps.contracts,
            pending: Arc::clone(&pending),
            user_cache: Arc::clone(&user_cache),
            clock: Arc::clone(&deps.clock),
            health: Arc::clone(&health),
        },
    ));

    let gateway = ProvisioningGateway::new(
        deps.broker,
        &config.queue_name,
        Arc::clone(&pending),
        deps.hasher,
        deps.clock,
        Arc::clone(&health),
    );

    Provisioning {
        service: ProvisioningService::new(
            coordinator,
            RestartPolicy {
                initial_backoff: Duration::from_millis(config.restart_backoff_ms),
                max_backoff: Duration::from_millis(config.max_restart_backoff_ms),
            },
        ),
        pipeline: ProvisioningPipeline::new(gateway, config),
        pending,
        health,
        user_cache,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use ffm_core::{
        Contract, EntityId, ManualClock, NewContract, NewUser, ProvisioningRequest, User,
        UserChanges,
    };

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::storage::{MemoryStore, RetryPolicy, StoreError};

    struct Harness {
        store: Arc<MemoryStore>,
        broker: Arc<MemoryBroker>,
        provisioning: Provisioning,
    }

    fn config() -> ServerConfig {
        ServerConfig {
            submit_timeout_ms: 2_000,
            restart_backoff_ms: 1,
            max_restart_backoff_ms: 5,
            retry: RetryPolicy::immediate(None),
            ..ServerConfig::default()
        }
    }

    fn harness_with(users: Option<Arc<dyn UserRepository>>) -> Harness {
        let store = Arc::new(MemoryStore::with_policy(config().retry));
        let broker = Arc::new(MemoryBroker::new());
        let provisioning = build(
            &config(),
            ProvisioningDeps {
                broker: broker.clone(),
                users: users.unwrap_or_else(|| store.clone() as Arc<dyn UserRepository>),
                contracts: store.clone(),
                hasher: Arc::new(Sha256Hasher::default()),
                clock: Arc::new(ManualClock::new(1_000)),
            },
        );
        Harness {
            store,
            broker,
            provisioning,
        }
    }

    fn started(users: Option<Arc<dyn UserRepository>>) -> Harness {
        let harness = harness_with(users);
        harness.provisioning.service.start().unwrap();
        harness
    }

    fn ana(email: &str, cpf: &str) -> ProvisioningRequest {
        ProvisioningRequest::CreateUser(NewUser {
            name: "Ana".to_string(),
            last_name: "Souza".to_string(),
            email: email.to_string(),
            cpf: cpf.to_string(),
            password: "correct-horse".to_string(),
        })
    }

    #[tokio::test]
    async fn create_user_round_trip() {
        let h = started(None);

        let outcome = h
            .provisioning
            .pipeline
            .submit(ana("a@x.com", "12345678901"))
            .await
            .unwrap();

        let ProvisioningOutcome::Created { id } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        let stored = UserRepository::find_by_id(h.store.as_ref(), id).await.unwrap();
        assert_eq!(stored.email, "a@x.com");
        assert_ne!(stored.password, "correct-horse");
        assert_eq!(h.store.count().await.unwrap(), 1);
        assert!(h.provisioning.pending.is_empty());
        assert_eq!(h.broker.unacked_count("provisioning"), 0);

        h.provisioning.service.stop().await;
    }

    #[tokio::test]
    async fn concurrent_duplicate_emails_yield_one_conflict() {
        let h = started(None);
        let first = h.provisioning.pipeline.submit(ana("a@x.com", "11111111111"));
        let second = h.provisioning.pipeline.submit(ana("a@x.com", "22222222222"));
        let (first, second) = tokio::join!(first, second);

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ProvisioningError::Conflict { .. }))));
        assert_eq!(h.store.count().await.unwrap(), 1);

        h.provisioning.service.stop().await;
    }

    #[tokio::test]
    async fn transient_conflict_is_retried_to_a_single_row() {
        let h = started(None);
        h.store.inject_transient_conflicts(1);

        let outcome = h
            .provisioning
            .pipeline
            .submit(ana("a@x.com", "12345678901"))
            .await;

        assert!(matches!(outcome, Ok(ProvisioningOutcome::Created { .. })));
        assert_eq!(h.store.commits(), 1);
        assert_eq!(h.store.count().await.unwrap(), 1);

        h.provisioning.service.stop().await;
    }

    #[tokio::test]
    async fn update_and_delete_invalidate_the_read_cache() {
        let h = started(None);
        let pipeline = &h.provisioning.pipeline;
        let id = pipeline
            .submit(ana("a@x.com", "12345678901"))
            .await
            .unwrap()
            .id();
        let users: Arc<dyn UserRepository> = h.store.clone();
        h.provisioning.user_cache.find_user(&users, id).await.unwrap();

        pipeline
            .submit(ProvisioningRequest::UpdateUser {
                id,
                changes: UserChanges {
                    name: Some("Bia".to_string()),
                    ..UserChanges::default()
                },
            })
            .await
            .unwrap();
        let fresh = h.provisioning.user_cache.find_user(&users, id).await.unwrap();
        assert_eq!(fresh.name, "Bia");
        assert_eq!(fresh.update_log.len(), 1);

        assert_eq!(
            pipeline.submit(ProvisioningRequest::DeleteUser { id }).await,
            Ok(ProvisioningOutcome::Deleted { id })
        );
        assert_eq!(
            h.provisioning.user_cache.find_user(&users, id).await,
            Err(StoreError::NotFound)
        );
        assert_eq!(
            pipeline.submit(ProvisioningRequest::DeleteUser { id }).await,
            Err(ProvisioningError::NotFound)
        );

        h.provisioning.service.stop().await;
    }

    #[tokio::test]
    async fn contract_lifecycle() {
        let h = started(None);
        let pipeline = &h.provisioning.pipeline;
        let request = ProvisioningRequest::CreateContract(NewContract {
            kind: "contract".to_string(),
            customer: "ACME".to_string(),
            title: "Lease".to_string(),
            parties: vec!["ACME".to_string(), "Ana".to_string()],
            object: "Office".to_string(),
            extract: Vec::new(),
            invoice: Vec::new(),
        });

        let id = pipeline.submit(request).await.unwrap().id();
        let listed: Vec<Contract> = h.store.list_by_customer("ACME").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);

        pipeline
            .submit(ProvisioningRequest::DeleteContract { id })
            .await
            .unwrap();
        assert!(h.store.list_by_customer("ACME").await.unwrap().is_empty());

        h.provisioning.service.stop().await;
    }

    #[tokio::test]
    async fn submissions_fail_fast_before_start_and_after_stop() {
        let h = harness_with(None);
        assert_eq!(
            h.provisioning.pipeline.submit(ana("a@x.com", "12345678901")).await,
            Err(ProvisioningError::CoordinatorDown)
        );

        h.provisioning.service.start().unwrap();
        assert!(h.provisioning.service.start().is_err());
        h.provisioning.service.stop().await;

        assert_eq!(h.provisioning.health.state(), CoordinatorState::Stopped);
        assert_eq!(
            h.provisioning.pipeline.submit(ana("a@x.com", "12345678901")).await,
            Err(ProvisioningError::CoordinatorDown)
        );
        assert_eq!(h.store.count().await.unwrap(), 0);
    }

    /// Delegates to a `MemoryStore`, panicking where a real process would die.
    struct CrashingUsers {
        inner: Arc<MemoryStore>,
        /// Panic once, right after an insert has committed.
        crash_after_commit: AtomicBool,
        /// Panic before inserting any user with this name.
        poison: Option<&'static str>,
    }

    #[async_trait]
    impl UserRepository for CrashingUsers {
        async fn insert(&self, user: User) -> Result<User, StoreError> {
            if self.poison.is_some_and(|name| user.name == name) {
                panic!("cannot provision {}", user.name);
            }
            let stored = UserRepository::insert(self.inner.as_ref(), user).await?;
            if self.crash_after_commit.swap(false, Ordering::SeqCst) {
                panic!("coordinator crashed after commit");
            }
            Ok(stored)
        }
        async fn find_by_id(&self, id: EntityId) -> Result<User, StoreError> {
            UserRepository::find_by_id(self.inner.as_ref(), id).await
        }
        async fn find_by_email(&self, email: &str) -> Result<User, StoreError> {
            self.inner.find_by_email(email).await
        }
        async fn find_by_cpf(&self, cpf: &str) -> Result<User, StoreError> {
            self.inner.find_by_cpf(cpf).await
        }
        async fn update(&self, id: EntityId, changes: UserChanges, now: i64) -> Result<User, StoreError> {
            self.inner.update(id, changes, now).await
        }
        async fn delete(&self, id: EntityId) -> Result<(), StoreError> {
            UserRepository::delete(self.inner.as_ref(), id).await
        }
        async fn count(&self) -> Result<u64, StoreError> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn crash_after_dequeue_is_redelivered_without_duplicates() {
        let store = Arc::new(MemoryStore::with_policy(RetryPolicy::immediate(None)));
        let crashing: Arc<dyn UserRepository> = Arc::new(CrashingUsers {
            inner: store.clone(),
            crash_after_commit: AtomicBool::new(true),
            poison: None,
        });
        let broker = Arc::new(MemoryBroker::new());
        let provisioning = build(
            &config(),
            ProvisioningDeps {
                broker: broker.clone(),
                users: crashing,
                contracts: store.clone(),
                hasher: Arc::new(Sha256Hasher::default()),
                clock: Arc::new(ManualClock::new(1_000)),
            },
        );
        provisioning.service.start().unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            provisioning.pipeline.submit(ana("a@x.com", "12345678901")),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, Ok(ProvisioningOutcome::Created { .. })));
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(provisioning.health.restarts(), 1);
        assert_eq!(broker.unacked_count("provisioning"), 0);
        assert_eq!(broker.ready_count("provisioning"), 0);

        provisioning.service.stop().await;
    }

    #[tokio::test]
    async fn request_that_keeps_crashing_is_dead_lettered_and_the_queue_moves_on() {
        let store = Arc::new(MemoryStore::with_policy(RetryPolicy::immediate(None)));
        let users: Arc<dyn UserRepository> = Arc::new(CrashingUsers {
            inner: store.clone(),
            crash_after_commit: AtomicBool::new(false),
            poison: Some("Poison"),
        });
        let broker = Arc::new(MemoryBroker::new());
        let config = ServerConfig {
            max_delivery_attempts: 3,
            ..config()
        };
        let provisioning = build(
            &config,
            ProvisioningDeps {
                broker: broker.clone(),
                users,
                contracts: store.clone(),
                hasher: Arc::new(Sha256Hasher::default()),
                clock: Arc::new(ManualClock::new(1_000)),
            },
        );
        provisioning.service.start().unwrap();

        let mut poison = ana("p@x.com", "99999999999");
        if let ProvisioningRequest::CreateUser(user) = &mut poison {
            user.name = "Poison".to_string();
        }
        let rejected = tokio::time::timeout(
            Duration::from_secs(2),
            provisioning.pipeline.submit(poison),
        )
        .await
        .unwrap();
        assert!(matches!(rejected, Err(ProvisioningError::Store(_))));
        assert_eq!(provisioning.health.restarts(), 3);

        let healthy = tokio::time::timeout(
            Duration::from_secs(2),
            provisioning.pipeline.submit(ana("a@x.com", "12345678901")),
        )
        .await
        .unwrap();
        assert!(matches!(healthy, Ok(ProvisioningOutcome::Created { .. })));
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(provisioning.health.is_running());
        assert_eq!(broker.unacked_count("provisioning"), 0);
        assert_eq!(broker.ready_count("provisioning"), 0);

        provisioning.service.stop().await;
    }
}
