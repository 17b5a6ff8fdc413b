use async_trait::async_trait;
use ffm_core::{Contract, EntityId, User, UserChanges};

use crate::broker::{BrokerError, Delivery};
use crate::storage::StoreError;

/// Entity-level access to users.
///
/// Every method is exactly one unit of work through the store's
/// transactional executor. Implementations: `PostgreSQL` (`PgStore`),
/// memory (`MemoryStore`).
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a user, assigning a fresh id when `user.id` is nil.
    ///
    /// Fails with [`StoreError::Conflict`] if the id, email, or CPF is taken.
    async fn insert(&self, user: User) -> Result<User, StoreError>;

    async fn find_by_id(&self, id: EntityId) -> Result<User, StoreError>;

    /// Lookup by email, compared case-insensitively.
    async fn find_by_email(&self, email: &str) -> Result<User, StoreError>;

    /// Lookup by CPF, punctuated or bare.
    async fn find_by_cpf(&self, cpf: &str) -> Result<User, StoreError>;

    /// Read-modify-write of one user inside a single transaction.
    ///
    /// Appends an update-log entry when anything changed. Fails with
    /// [`StoreError::NotFound`] if no user has `id`.
    async fn update(&self, id: EntityId, changes: UserChanges, now: i64) -> Result<User, StoreError>;

    /// Fails with [`StoreError::NotFound`] if no row was deleted.
    async fn delete(&self, id: EntityId) -> Result<(), StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

/// Entity-level access to contracts and their file metadata.
#[async_trait]
pub trait ContractRepository: Send + Sync {
    /// Insert a contract, assigning a fresh id when `contract.id` is nil.
    async fn insert(&self, contract: Contract) -> Result<Contract, StoreError>;

    async fn find_by_id(&self, id: EntityId) -> Result<Contract, StoreError>;

    /// All contracts of `customer`, oldest first (ties broken by id).
    async fn list_by_customer(&self, customer: &str) -> Result<Vec<Contract>, StoreError>;

    /// Fails with [`StoreError::NotFound`] if no row was deleted.
    async fn delete(&self, id: EntityId) -> Result<(), StoreError>;
}

/// Publish/subscribe access to a queueing message broker.
///
/// Delivery is at-least-once: a delivery that is dropped without being
/// acknowledged is requeued and redelivered with `redelivered = true`.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Enqueue `body` on `queue`. Returns once the broker has accepted it.
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Open a consumer on `queue`.
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError>;
}

/// A consumer attached to one queue.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `None` once the broker has closed.
    async fn next(&mut self) -> Option<Delivery>;
}

/// One-way digest applied to credentials before they leave the gateway.
pub trait CredentialHasher: Send + Sync {
    fn digest(&self, plaintext: &str) -> String;
}
