//! Timeout middleware for provisioning submissions.
//!
//! Bounds how long a caller waits for its completion signal. Expiry drops the
//! inner future, which releases the caller's completion slot; the request may
//! still be applied later, and its signal is then discarded.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use ffm_core::ProvisioningRequest;
use tower::{Layer, Service};

use crate::service::provisioning::{ProvisioningError, ProvisioningOutcome};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that fails submissions still pending after `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces the submission timeout.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Service<ProvisioningRequest> for TimeoutService<S>
where
    S: Service<ProvisioningRequest, Response = ProvisioningOutcome, Error = ProvisioningError>
        + Send,
    S::Future: Send + 'static,
{
    type Response = ProvisioningOutcome;
    type Error = ProvisioningError;
    type Future =
        Pin<Box<dyn Future<Output = Result<ProvisioningOutcome, ProvisioningError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: ProvisioningRequest) -> Self::Future {
        let timeout = self.timeout;
        let fut = self.inner.call(request);
        Box::pin(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(ProvisioningError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
