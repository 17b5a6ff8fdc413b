//! Tower middleware layers for the provisioning pipeline.
//!
//! - [`timeout`]: Bounded wait for the completion signal
//! - [`metrics`]: Submission timing and counting
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`pipeline`]: Composes all layers around the gateway

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::ProvisioningPipeline;
pub use timeout::TimeoutLayer;
