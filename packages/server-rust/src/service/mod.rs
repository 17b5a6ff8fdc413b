//! Provisioning service layer.
//!
//! 1. **Gateway** (`provisioning::gateway`): validate, publish, wait for completion
//! 2. **Middleware** (`middleware`): Tower layers (timeout, metrics, load-shedding)
//! 3. **Coordinator** (`provisioning::coordinator`): queue consumer applying requests
//! 4. **Supervision** (`supervisor`): restart-on-failure for the coordinator,
//!    started and stopped through [`ProvisioningService`]

pub mod config;
pub mod middleware;
pub mod provisioning;
pub mod supervisor;

pub use config::ServerConfig;
pub use middleware::ProvisioningPipeline;
pub use provisioning::{
    build as build_provisioning, CoordinatorHealth, CoordinatorState, Provisioning,
    ProvisioningDeps, ProvisioningError, ProvisioningOutcome, ProvisioningService,
};
pub use supervisor::{RestartPolicy, Supervised, Supervisor};
