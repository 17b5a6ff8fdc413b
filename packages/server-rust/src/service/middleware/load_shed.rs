//! Load-shedding middleware for provisioning submissions.
//!
//! Rejects submissions when the server is overloaded (in-flight count at
//! `max_concurrent_submissions`) with `ProvisioningError::Overloaded`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use ffm_core::ProvisioningRequest;
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::service::provisioning::{ProvisioningError, ProvisioningOutcome};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent submissions via a semaphore.
///
/// When all permits are taken, incoming submissions are rejected immediately
/// rather than queued.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: self.semaphore.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces the concurrency limit.
#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<ProvisioningRequest> for LoadShedService<S>
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
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            return Box::pin(async { Err(ProvisioningError::Overloaded) });
        };

        let fut = self.inner.call(request);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
