//! In-process store with serializable, first-committer-wins transactions.
//!
//! Each attempt works on a private snapshot of the committed tables and
//! commits only if no other transaction committed since the snapshot was
//! taken. A lost race surfaces as [`StoreError::TransientConflict`] and is
//! retried by the same executor loop the `PostgreSQL` store uses. Units that
//! write nothing return without committing, so readers never force a retry.
//! Transient conflicts can also be injected to exercise that loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use ffm_core::validation::normalize_cpf;
use ffm_core::{Contract, EntityId, User, UserChanges};
use parking_lot::Mutex;
use tracing::debug;

use super::error::StoreError;
use super::retry::{Backoff, RetryPolicy};
use super::constraints;
use crate::traits::{ContractRepository, UserRepository};

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Tables {
    users: BTreeMap<EntityId, User>,
    contracts: BTreeMap<EntityId, Contract>,
    /// Set by every write; a unit that leaves it clear commits nothing.
    dirty: bool,
}

impl Tables {
    fn check_user_unique(&self, candidate: &User) -> Result<(), StoreError> {
        for existing in self.users.values().filter(|u| u.id != candidate.id) {
            if existing.email == candidate.email {
                return Err(conflict(constraints::USERS_EMAIL));
            }
            if existing.cpf == candidate.cpf {
                return Err(conflict(constraints::USERS_CPF));
            }
        }
        Ok(())
    }

    fn insert_user(&mut self, user: User) -> Result<User, StoreError> {
        if self.users.contains_key(&user.id) {
            return Err(conflict(constraints::USERS_PK));
        }
        self.check_user_unique(&user)?;
        self.users.insert(user.id, user.clone());
        self.dirty = true;
        Ok(user)
    }

    fn update_user(&mut self, id: EntityId, changes: &UserChanges, now: i64) -> Result<User, StoreError> {
        let mut user = self.users.get(&id).cloned().ok_or(StoreError::NotFound)?;
        if user.apply(changes, now) {
            self.check_user_unique(&user)?;
            self.users.insert(id, user.clone());
            self.dirty = true;
        }
        Ok(user)
    }

    fn remove_user(&mut self, id: EntityId) -> Result<(), StoreError> {
        self.users.remove(&id).ok_or(StoreError::NotFound)?;
        self.dirty = true;
        Ok(())
    }

    fn insert_contract(&mut self, contract: Contract) -> Result<Contract, StoreError> {
        if self.contracts.contains_key(&contract.id) {
            return Err(conflict(constraints::CONTRACTS_PK));
        }
        self.contracts.insert(contract.id, contract.clone());
        self.dirty = true;
        Ok(contract)
    }

    fn remove_contract(&mut self, id: EntityId) -> Result<(), StoreError> {
        self.contracts.remove(&id).ok_or(StoreError::NotFound)?;
        self.dirty = true;
        Ok(())
    }
}

fn conflict(constraint: &str) -> StoreError {
    StoreError::Conflict {
        constraint: constraint.to_string(),
    }
}

#[derive(Debug, Default)]
struct Committed {
    version: u64,
    tables: Tables,
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory implementation of [`UserRepository`] and [`ContractRepository`].
#[derive(Debug)]
pub struct MemoryStore {
    committed: Mutex<Committed>,
    policy: RetryPolicy,
    forced_conflicts: AtomicU32,
    attempts: AtomicU64,
    commits: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    #[must_use]
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            committed: Mutex::new(Committed::default()),
            policy,
            forced_conflicts: AtomicU32::new(0),
            attempts: AtomicU64::new(0),
            commits: AtomicU64::new(0),
        }
    }

    /// Make the next `n` commits fail with a transient conflict.
    pub fn inject_transient_conflicts(&self, n: u32) {
        self.forced_conflicts.fetch_add(n, Ordering::SeqCst);
    }

    /// Transaction attempts started, including retried ones.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Transactions committed.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Runs `unit` in a serializable transaction, re-running it from a fresh
    /// snapshot after every transient conflict.
    async fn execute<T, F>(&self, label: &'static str, mut unit: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnMut(&mut Tables) -> Result<T, StoreError> + Send,
    {
        let mut backoff = Backoff::new(self.policy.clone());
        loop {
            match self.attempt(&mut unit).await {
                Err(StoreError::TransientConflict) => {
                    metrics::counter!("ffm_store_transaction_retries_total", "unit" => label)
                        .increment(1);
                    debug!(unit = label, failures = backoff.failures() + 1, "transient conflict, re-running unit of work");
                    if !backoff.retry().await {
                        return Err(StoreError::RetriesExhausted {
                            attempts: backoff.failures(),
                        });
                    }
                }
                other => return other,
            }
        }
    }

    async fn attempt<T, F>(&self, unit: &mut F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnMut(&mut Tables) -> Result<T, StoreError> + Send,
    {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (version, mut working) = {
            let committed = self.committed.lock();
            (committed.version, committed.tables.clone())
        };

        // Let concurrent transactions interleave between snapshot and commit.
        tokio::task::yield_now().await;

        let value = unit(&mut working)?;
        if !working.dirty {
            // Read-only: the snapshot was consistent, nothing to validate.
            return Ok(value);
        }
        working.dirty = false;

        let mut committed = self.committed.lock();
        if self.take_forced_conflict() || committed.version != version {
            return Err(StoreError::TransientConflict);
        }
        committed.tables = working;
        committed.version += 1;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(value)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn insert(&self, mut user: User) -> Result<User, StoreError> {
        if user.id.is_nil() {
            user.id = EntityId::new();
        }
        self.execute("users.insert", |tables| tables.insert_user(user.clone()))
            .await
    }

    async fn find_by_id(&self, id: EntityId) -> Result<User, StoreError> {
        self.execute("users.find_by_id", |tables| {
            tables.users.get(&id).cloned().ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn find_by_email(&self, email: &str) -> Result<User, StoreError> {
        let email = email.trim().to_lowercase();
        self.execute("users.find_by_email", |tables| {
            tables
                .users
                .values()
                .find(|u| u.email == email)
                .cloned()
                .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn find_by_cpf(&self, cpf: &str) -> Result<User, StoreError> {
        let cpf = normalize_cpf(cpf);
        self.execute("users.find_by_cpf", |tables| {
            tables
                .users
                .values()
                .find(|u| u.cpf == cpf)
                .cloned()
                .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn update(&self, id: EntityId, changes: UserChanges, now: i64) -> Result<User, StoreError> {
        self.execute("users.update", |tables| tables.update_user(id, &changes, now))
            .await
    }

    async fn delete(&self, id: EntityId) -> Result<(), StoreError> {
        self.execute("users.delete", |tables| tables.remove_user(id))
            .await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.execute("users.count", |tables| Ok(tables.users.len() as u64))
            .await
    }
}

#[async_trait]
impl ContractRepository for MemoryStore {
    async fn insert(&self, mut contract: Contract) -> Result<Contract, StoreError> {
        if contract.id.is_nil() {
            contract.id = EntityId::new();
        }
        self.execute("contracts.insert", |tables| {
            tables.insert_contract(contract.clone())
        })
        .await
    }

    async fn find_by_id(&self, id: EntityId) -> Result<Contract, StoreError> {
        self.execute("contracts.find_by_id", |tables| {
            tables.contracts.get(&id).cloned().ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn list_by_customer(&self, customer: &str) -> Result<Vec<Contract>, StoreError> {
        self.execute("contracts.list_by_customer", |tables| {
            let mut found: Vec<Contract> = tables
                .contracts
                .values()
                .filter(|c| c.file.customer == customer)
                .cloned()
                .collect();
            found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            Ok(found)
        })
        .await
    }

    async fn delete(&self, id: EntityId) -> Result<(), StoreError> {
        self.execute("contracts.delete", |tables| tables.remove_contract(id))
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
