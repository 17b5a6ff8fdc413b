//! HTTP handler definitions for the provisioning server.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod contracts;
pub mod error;
pub mod health;
pub mod users;

pub use contracts::{create_contract, delete_contract, get_contract, list_contracts};
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use users::{create_user, delete_user, get_user, lookup_user, update_user};

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::service::provisioning::{CoordinatorHealth, PendingCompletions};
use crate::service::ProvisioningPipeline;
use crate::storage::UserCache;
use crate::traits::{ContractRepository, UserRepository};

/// What the handlers talk to: the write pipeline and the read side.
#[derive(Clone)]
pub struct ApiBackend {
    /// Mutations go through here and wait for the coordinator.
    pub pipeline: ProvisioningPipeline,
    pub users: Arc<dyn UserRepository>,
    pub contracts: Arc<dyn ContractRepository>,
    pub user_cache: Arc<UserCache>,
    pub coordinator: Arc<CoordinatorHealth>,
    pub pending: Arc<PendingCompletions>,
}

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub backend: ApiBackend,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Network configuration (bind address, TLS, timeouts).
    pub config: Arc<NetworkConfig>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
