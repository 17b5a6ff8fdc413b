//! Publishes provisioning requests and waits for their completion.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use ffm_core::{ClockSource, Envelope, ProvisioningRequest, RequestId};
use tower::Service;
use tracing::debug;

use super::coordinator::CoordinatorHealth;
use super::error::{ProvisioningError, ProvisioningOutcome};
use super::pending::PendingCompletions;
use crate::traits::{CredentialHasher, MessageBroker};

/// Innermost service of the provisioning pipeline.
///
/// A submission is validated, has its credentials sealed, is published, and
/// then waits on its own completion slot. It never times out by itself; the
/// timeout layer around it bounds the wait and drops the slot on expiry.
#[derive(Clone)]
pub struct ProvisioningGateway {
    broker: Arc<dyn MessageBroker>,
    queue: Arc<str>,
    pending: Arc<PendingCompletions>,
    hasher: Arc<dyn CredentialHasher>,
    clock: Arc<dyn ClockSource>,
    coordinator: Arc<CoordinatorHealth>,
}

impl ProvisioningGateway {
    #[must_use]
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        queue: &str,
        pending: Arc<PendingCompletions>,
        hasher: Arc<dyn CredentialHasher>,
        clock: Arc<dyn ClockSource>,
        coordinator: Arc<CoordinatorHealth>,
    ) -> Self {
        Self {
            broker,
            queue: Arc::from(queue),
            pending,
            hasher,
            clock,
            coordinator,
        }
    }

    /// # Errors
    ///
    /// - [`ProvisioningError::Validation`]: nothing was published.
    /// - [`ProvisioningError::CoordinatorDown`]: nothing was published.
    /// - [`ProvisioningError::Publish`]: the broker refused the envelope.
    /// - any error the coordinator reported for the request.
    pub async fn submit(
        &self,
        mut request: ProvisioningRequest,
    ) -> Result<ProvisioningOutcome, ProvisioningError> {
        request.validate()?;
        if !self.coordinator.is_running() {
            return Err(ProvisioningError::CoordinatorDown);
        }
        request.seal_credentials(|plaintext| self.hasher.digest(plaintext));

        let request_id = RequestId::new();
        let envelope = Envelope::new(request_id, self.clock.now_millis(), request);
        let body = envelope
            .encode()
            .map_err(|err| ProvisioningError::Decode(err.to_string()))?;

        // Registered before publishing so a fast coordinator cannot signal
        // an id nobody is waiting on yet.
        let slot = self.pending.register(request_id);
        self.broker.publish(&self.queue, body).await?;
        debug!(%request_id, operation = envelope.request.operation(), "published, awaiting completion");

        match slot.wait().await {
            Some(signal) => signal.outcome,
            None => Err(ProvisioningError::CoordinatorDown),
        }
    }
}

impl Service<ProvisioningRequest> for ProvisioningGateway {
    type Response = ProvisioningOutcome;
    type Error = ProvisioningError;
    type Future =
        Pin<Box<dyn Future<Output = Result<ProvisioningOutcome, ProvisioningError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ProvisioningRequest) -> Self::Future {
        let gateway = self.clone();
        Box::pin(async move { gateway.submit(request).await })
    }
}
