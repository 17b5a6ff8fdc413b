//! Pipeline composition: combines all middleware layers into a single service stack.

use std::time::Duration;

use ffm_core::ProvisioningRequest;
use tower::{ServiceBuilder, ServiceExt};

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};
use crate::service::config::ServerConfig;
use crate::service::provisioning::{ProvisioningError, ProvisioningGateway, ProvisioningOutcome};

type Stack = LoadShedService<MetricsService<TimeoutService<ProvisioningGateway>>>;

/// The gateway wrapped in its middleware, cheap to clone into request handlers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded (fail fast before doing any work)
/// 2. `MetricsLayer` -- record timing and outcome, timeouts included
/// 3. `TimeoutLayer` -- bound the wait for the completion signal
#[derive(Clone)]
pub struct ProvisioningPipeline {
    service: Stack,
}

impl ProvisioningPipeline {
    #[must_use]
    pub fn new(gateway: ProvisioningGateway, config: &ServerConfig) -> Self {
        let service = ServiceBuilder::new()
            .layer(LoadShedLayer::new(config.max_concurrent_submissions))
            .layer(MetricsLayer)
            .layer(TimeoutLayer::new(Duration::from_millis(config.submit_timeout_ms)))
            .service(gateway);
        Self { service }
    }

    /// Run one request through the full stack.
    ///
    /// # Errors
    ///
    /// Any [`ProvisioningError`] raised by a layer or by the request itself.
    pub async fn submit(
        &self,
        request: ProvisioningRequest,
    ) -> Result<ProvisioningOutcome, ProvisioningError> {
        self.service.clone().oneshot(request).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
