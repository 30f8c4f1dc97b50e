//! Retry and circuit breaking around an [`Extractor`].

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use medx_models::MediaMetadata;
use medx_resilience::{CircuitBreaker, Classify, ErrorClass, RetryAttempt, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{MediaError, MediaResult};
use crate::extractor::{DownloadOptions, Extractor};

/// Decorator applying `Retry(CircuitBreaker(call))` to every operation.
///
/// Only transient errors count against the breaker; an open breaker
/// surfaces as [`MediaError::Rejected`] and is never retried.
pub struct ResilientExtractor {
    inner: Arc<dyn Extractor>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl ResilientExtractor {
    pub fn new(inner: Arc<dyn Extractor>, breaker: Arc<CircuitBreaker>, retry: RetryPolicy) -> Self {
        Self {
            inner,
            breaker,
            retry,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn log_retry(&self, operation: &str, url: &str) -> impl FnMut(&RetryAttempt, &MediaError) + '_ {
        let operation = operation.to_string();
        let url = url.to_string();
        move |attempt, error| {
            warn!(
                extractor = self.inner.name(),
                operation = %operation,
                url = %url,
                attempt = attempt.attempt,
                delay_ms = attempt.delay.as_millis() as u64,
                "Retrying after error: {}",
                error
            );
        }
    }
}

fn is_breaker_failure(error: &MediaError) -> bool {
    error.classify() == ErrorClass::Transient
}

/// One breaker-guarded call. A cancelled call, or one dropped mid-flight
/// by the retry loop, leaves the breaker counts untouched.
async fn guarded<T, Fut>(breaker: &CircuitBreaker, call: Fut) -> MediaResult<T>
where
    Fut: Future<Output = MediaResult<T>>,
{
    let permit = breaker.allow()?;
    let result = call.await;
    match &result {
        Ok(_) => permit.record(true),
        Err(MediaError::Cancelled) => permit.cancel(),
        Err(e) => permit.record(!is_breaker_failure(e)),
    }
    result
}

#[async_trait]
impl Extractor for ResilientExtractor {
    async fn extract_metadata(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> MediaResult<MediaMetadata> {
        self.retry
            .run_observed(
                token,
                |e: &MediaError| e.classify(),
                self.log_retry("metadata", url),
                || guarded(&self.breaker, self.inner.extract_metadata(url, token)),
            )
            .await
    }

    async fn download(
        &self,
        url: &str,
        output: &Path,
        options: &DownloadOptions,
        token: &CancellationToken,
    ) -> MediaResult<Option<MediaMetadata>> {
        self.retry
            .run_observed(
                token,
                |e: &MediaError| e.classify(),
                self.log_retry("download", url),
                || guarded(&self.breaker, self.inner.download(url, output, options, token)),
            )
            .await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
