//! `PostgreSQL` (and `CockroachDB`) store via sqlx.
//!
//! Every repository call is one [`PgStore::execute`] unit of work: a
//! `SERIALIZABLE` transaction that is rolled back and re-run from scratch when
//! the server reports a serialization failure, whether from a statement or
//! from `COMMIT`.

use std::time::Duration;

use async_trait::async_trait;
use ffm_core::validation::normalize_cpf;
use ffm_core::{Contract, EntityId, File, UpdateLogEntry, User, UserChanges};
use futures_util::future::BoxFuture;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{classify_sqlstate, StoreError};
use super::retry::{Backoff, RetryPolicy};
use crate::traits::{ContractRepository, UserRepository};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                classify_sqlstate(db.code().as_deref(), db.constraint(), db.message())
            }
            sqlx::Error::RowNotFound => Self::NotFound,
            _ => Self::Backend(err.to_string()),
        }
    }
}

/// Schema bootstrap, applied in order by [`PgStore::migrate`].
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id UUID NOT NULL,
        name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        email TEXT NOT NULL,
        cpf TEXT NOT NULL,
        password TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        update_log JSONB NOT NULL DEFAULT '[]',
        CONSTRAINT users_pkey PRIMARY KEY (id),
        CONSTRAINT users_email_key UNIQUE (email),
        CONSTRAINT users_cpf_key UNIQUE (cpf)
    )",
    "CREATE TABLE IF NOT EXISTS contracts (
        id UUID NOT NULL,
        kind TEXT NOT NULL,
        customer TEXT NOT NULL,
        title TEXT NOT NULL,
        parties TEXT[] NOT NULL,
        object TEXT NOT NULL,
        extract UUID[] NOT NULL,
        invoice UUID[] NOT NULL,
        created_at BIGINT NOT NULL,
        CONSTRAINT contracts_pkey PRIMARY KEY (id)
    )",
    "CREATE INDEX IF NOT EXISTS contracts_customer_idx ON contracts (customer, created_at, id)",
];

const USER_COLUMNS: &str = "id, name, last_name, email, cpf, password, created_at, update_log";
const CONTRACT_COLUMNS: &str =
    "id, kind, customer, title, parties, object, extract, invoice, created_at";

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

/// Connection pool plus the retry policy applied to every transaction.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    /// Open a pool against `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the database is unreachable.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        policy: RetryPolicy,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        info!(max_connections, "connected to PostgreSQL");
        Ok(Self::new(pool, policy))
    }

    /// Create tables and indexes that do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns the first statement failure.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("database schema ready");
        Ok(())
    }

    /// Runs `unit` inside a `SERIALIZABLE` transaction.
    ///
    /// `unit` may be invoked several times; it must only issue statements on
    /// the connection it is given and must not keep state between calls.
    ///
    /// # Errors
    ///
    /// Returns the unit's first non-transient error, or
    /// [`StoreError::RetriesExhausted`] when a bounded policy runs out.
    pub async fn execute<T, F>(&self, label: &'static str, mut unit: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T, StoreError>> + Send,
    {
        let mut backoff = Backoff::new(self.policy.clone());
        loop {
            match self.attempt(&mut unit).await {
                Err(StoreError::TransientConflict) => {
                    metrics::counter!("ffm_store_transaction_retries_total", "unit" => label)
                        .increment(1);
                    debug!(unit = label, failures = backoff.failures() + 1, "serialization failure, re-running unit of work");
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
        F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T, StoreError>> + Send,
    {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        match unit(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    debug!(error = %rollback, "rollback failed; connection will be discarded");
                }
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    last_name: String,
    email: String,
    cpf: String,
    password: String,
    created_at: i64,
    update_log: Json<Vec<UpdateLogEntry>>,
}

impl UserRow {
    fn into_user(self) -> User {
        User {
            id: EntityId::from(self.id),
            name: self.name,
            last_name: self.last_name,
            email: self.email,
            cpf: self.cpf,
            password: self.password,
            created_at: self.created_at,
            update_log: self.update_log.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ContractRow {
    id: Uuid,
    kind: String,
    customer: String,
    title: String,
    parties: Vec<String>,
    object: String,
    extract: Vec<Uuid>,
    invoice: Vec<Uuid>,
    created_at: i64,
}

impl ContractRow {
    fn into_contract(self) -> Contract {
        Contract {
            id: EntityId::from(self.id),
            file: File {
                kind: self.kind,
                customer: self.customer,
            },
            title: self.title,
            parties: self.parties,
            object: self.object,
            extract: self.extract.into_iter().map(EntityId::from).collect(),
            invoice: self.invoice.into_iter().map(EntityId::from).collect(),
            created_at: self.created_at,
        }
    }
}

fn uuids(ids: &[EntityId]) -> Vec<Uuid> {
    ids.iter().map(|id| *id.as_uuid()).collect()
}

async fn fetch_user(conn: &mut PgConnection, column: &str, value: &str) -> Result<User, StoreError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1");
    sqlx::query_as::<_, UserRow>(&sql)
        .bind(value)
        .fetch_optional(&mut *conn)
        .await?
        .map(UserRow::into_user)
        .ok_or(StoreError::NotFound)
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

#[async_trait]
impl UserRepository for PgStore {
    async fn insert(&self, mut user: User) -> Result<User, StoreError> {
        if user.id.is_nil() {
            user.id = EntityId::new();
        }
        self.execute("users.insert", move |conn| {
            let user = user.clone();
            Box::pin(async move {
                sqlx::query(
                    "INSERT INTO users (id, name, last_name, email, cpf, password, created_at, update_log)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(*user.id.as_uuid())
                .bind(&user.name)
                .bind(&user.last_name)
                .bind(&user.email)
                .bind(&user.cpf)
                .bind(&user.password)
                .bind(user.created_at)
                .bind(Json(&user.update_log))
                .execute(&mut *conn)
                .await?;
                Ok(user)
            })
        })
        .await
    }

    async fn find_by_id(&self, id: EntityId) -> Result<User, StoreError> {
        self.execute("users.find_by_id", move |conn| {
            Box::pin(async move {
                let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
                sqlx::query_as::<_, UserRow>(&sql)
                    .bind(*id.as_uuid())
                    .fetch_optional(&mut *conn)
                    .await?
                    .map(UserRow::into_user)
                    .ok_or(StoreError::NotFound)
            })
        })
        .await
    }

    async fn find_by_email(&self, email: &str) -> Result<User, StoreError> {
        let email = email.trim().to_lowercase();
        self.execute("users.find_by_email", move |conn| {
            let email = email.clone();
            Box::pin(async move { fetch_user(conn, "email", &email).await })
        })
        .await
    }

    async fn find_by_cpf(&self, cpf: &str) -> Result<User, StoreError> {
        let cpf = normalize_cpf(cpf);
        self.execute("users.find_by_cpf", move |conn| {
            let cpf = cpf.clone();
            Box::pin(async move { fetch_user(conn, "cpf", &cpf).await })
        })
        .await
    }

    async fn update(&self, id: EntityId, changes: UserChanges, now: i64) -> Result<User, StoreError> {
        self.execute("users.update", move |conn| {
            let changes = changes.clone();
            Box::pin(async move {
                let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
                let mut user = sqlx::query_as::<_, UserRow>(&sql)
                    .bind(*id.as_uuid())
                    .fetch_optional(&mut *conn)
                    .await?
                    .map(UserRow::into_user)
                    .ok_or(StoreError::NotFound)?;

                if !user.apply(&changes, now) {
                    return Ok(user);
                }

                let result = sqlx::query(
                    "UPDATE users
                     SET name = $2, last_name = $3, email = $4, cpf = $5, password = $6, update_log = $7
                     WHERE id = $1",
                )
                .bind(*id.as_uuid())
                .bind(&user.name)
                .bind(&user.last_name)
                .bind(&user.email)
                .bind(&user.cpf)
                .bind(&user.password)
                .bind(Json(&user.update_log))
                .execute(&mut *conn)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound);
                }
                Ok(user)
            })
        })
        .await
    }

    async fn delete(&self, id: EntityId) -> Result<(), StoreError> {
        self.execute("users.delete", move |conn| {
            Box::pin(async move {
                let result = sqlx::query("DELETE FROM users WHERE id = $1")
                    .bind(*id.as_uuid())
                    .execute(&mut *conn)
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound);
                }
                Ok(())
            })
        })
        .await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.execute("users.count", |conn| {
            Box::pin(async move {
                let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
                    .fetch_one(&mut *conn)
                    .await?;
                Ok(u64::try_from(rows).unwrap_or_default())
            })
        })
        .await
    }
}

#[async_trait]
impl ContractRepository for PgStore {
    async fn insert(&self, mut contract: Contract) -> Result<Contract, StoreError> {
        if contract.id.is_nil() {
            contract.id = EntityId::new();
        }
        self.execute("contracts.insert", move |conn| {
            let contract = contract.clone();
            Box::pin(async move {
                sqlx::query(
                    "INSERT INTO contracts (id, kind, customer, title, parties, object, extract, invoice, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                )
                .bind(*contract.id.as_uuid())
                .bind(&contract.file.kind)
                .bind(&contract.file.customer)
                .bind(&contract.title)
                .bind(&contract.parties)
                .bind(&contract.object)
                .bind(uuids(&contract.extract))
                .bind(uuids(&contract.invoice))
                .bind(contract.created_at)
                .execute(&mut *conn)
                .await?;
                Ok(contract)
            })
        })
        .await
    }

    async fn find_by_id(&self, id: EntityId) -> Result<Contract, StoreError> {
        self.execute("contracts.find_by_id", move |conn| {
            Box::pin(async move {
                let sql = format!("SELECT {CONTRACT_COLUMNS} FROM contracts WHERE id = $1");
                sqlx::query_as::<_, ContractRow>(&sql)
                    .bind(*id.as_uuid())
                    .fetch_optional(&mut *conn)
                    .await?
                    .map(ContractRow::into_contract)
                    .ok_or(StoreError::NotFound)
            })
        })
        .await
    }

    async fn list_by_customer(&self, customer: &str) -> Result<Vec<Contract>, StoreError> {
        let customer = customer.to_string();
        self.execute("contracts.list_by_customer", move |conn| {
            let customer = customer.clone();
            Box::pin(async move {
                let sql = format!(
                    "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE customer = $1 ORDER BY created_at, id"
                );
                let rows = sqlx::query_as::<_, ContractRow>(&sql)
                    .bind(&customer)
                    .fetch_all(&mut *conn)
                    .await?;
                Ok(rows.into_iter().map(ContractRow::into_contract).collect())
            })
        })
        .await
    }

    async fn delete(&self, id: EntityId) -> Result<(), StoreError> {
        self.execute("contracts.delete", move |conn| {
            Box::pin(async move {
                let result = sqlx::query("DELETE FROM contracts WHERE id = $1")
                    .bind(*id.as_uuid())
                    .execute(&mut *conn)
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound);
                }
                Ok(())
            })
        })
        .await
    }
}
