//! Persistence for users and contracts.
//!
//! Two stores implement the repository traits, both on top of the same
//! retry core ([`retry`]):
//!
//! - [`PgStore`]: sqlx against `PostgreSQL`/`CockroachDB` (feature `postgres`)
//! - [`MemoryStore`]: in-process, first-committer-wins serializable snapshots
//!
//! [`UserCache`] fronts user reads for the HTTP layer.

pub mod cache;
pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod retry;

pub use cache::UserCache;
pub use error::{classify_sqlstate, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;
pub use retry::{Backoff, RetryPolicy};

/// Names of the uniqueness constraints reported in [`StoreError::Conflict`].
pub mod constraints {
    pub const USERS_PK: &str = "users_pkey";
    pub const USERS_EMAIL: &str = "users_email_key";
    pub const USERS_CPF: &str = "users_cpf_key";
    pub const CONTRACTS_PK: &str = "contracts_pkey";
}
