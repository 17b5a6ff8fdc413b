//! Bounded read-through cache for user lookups.

use std::sync::Arc;

use ffm_core::{EntityId, User};
use parking_lot::Mutex;
use quick_cache::sync::Cache as QuickCache;

use super::error::StoreError;
use crate::traits::UserRepository;

/// Recently read users keyed by id.
///
/// Filled by reads, invalidated by the provisioning coordinator whenever it
/// updates or deletes a user. Every invalidation bumps an epoch; a read that
/// started under an older epoch returns its row but does not cache it, so a
/// fill racing an update or delete cannot resurrect the old row.
pub struct UserCache {
    entries: QuickCache<EntityId, User>,
    epoch: Mutex<u64>,
}

impl UserCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: QuickCache::new(capacity.max(1)),
            epoch: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<User> {
        self.entries.get(id)
    }

    pub fn invalidate(&self, id: &EntityId) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.entries.remove(id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serve `id` from the cache, falling back to `users` and remembering the hit.
    ///
    /// # Errors
    ///
    /// Propagates the repository error on a miss.
    pub async fn find_user(
        &self,
        users: &Arc<dyn UserRepository>,
        id: EntityId,
    ) -> Result<User, StoreError> {
        if let Some(user) = self.get(&id) {
            return Ok(user);
        }
        let started = *self.epoch.lock();
        let user = users.find_by_id(id).await?;
        self.fill(started, user.clone());
        Ok(user)
    }

    /// Cache `user` unless an invalidation happened after `started`.
    fn fill(&self, started: u64, user: User) {
        let epoch = self.epoch.lock();
        if *epoch == started {
            self.entries.insert(user.id, user);
        }
    }
}
