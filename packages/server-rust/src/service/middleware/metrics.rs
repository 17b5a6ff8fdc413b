//! Metrics middleware for provisioning submissions.
//!
//! Wraps each submission in a `provisioning_submit` tracing span and records
//! its duration and outcome both on the span and as `metrics` counters and
//! histograms.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use ffm_core::ProvisioningRequest;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::provisioning::{ProvisioningError, ProvisioningOutcome};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments submissions with timing and counting.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records submission duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<ProvisioningRequest> for MetricsService<S>
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
        let operation = request.operation();

        let span = info_span!(
            "provisioning_submit",
            operation = operation,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(request);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(err) => err.kind(),
                };

                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::counter!("ffm_submissions_total", "operation" => operation, "outcome" => outcome)
                    .increment(1);
                metrics::histogram!("ffm_submission_duration_seconds", "operation" => operation)
                    .record(elapsed.as_secs_f64());

                tracing::info!(
                    operation = operation,
                    duration_ms = duration_ms,
                    outcome = outcome,
                    "submission complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
