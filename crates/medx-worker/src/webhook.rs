//! Terminal-state webhook notifications.

use std::sync::Arc;

use medx_models::{ExtractionJob, JobSummary};
use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics::WorkerMetrics;

/// POSTs a [`JobSummary`] to the job's webhook URL with bounded retries.
pub struct WebhookNotifier {
    client: Client,
    config: WebhookConfig,
    metrics: Arc<WorkerMetrics>,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig, metrics: Arc<WorkerMetrics>) -> WorkerResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            config,
            metrics,
        })
    }

    /// Deliver `summary` to `url`. Returns the attempt that succeeded.
    ///
    /// Attempt `n` that fails waits `n * backoff` before the next one.
    /// Any 2xx response counts as delivered.
    pub async fn notify(&self, url: &str, summary: &JobSummary) -> WorkerResult<u32> {
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            match self.client.post(url).json(summary).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(job_id = %summary.job_id, attempt, "Webhook delivered");
                    return Ok(attempt);
                }
                Ok(response) => {
                    last_error = format!("HTTP {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            warn!(
                job_id = %summary.job_id,
                attempt,
                max_attempts = self.config.max_attempts,
                "Webhook attempt failed: {}",
                last_error
            );
            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.config.backoff * attempt).await;
            }
        }

        Err(WorkerError::webhook_failed(format!(
            "{} after {} attempts",
            last_error, self.config.max_attempts
        )))
    }

    /// Fire-and-forget delivery for a job in a terminal state. Returns
    /// `None` when the job has no webhook.
    pub fn spawn_notify(self: &Arc<Self>, job: &ExtractionJob) -> Option<JoinHandle<()>> {
        let url = job.request.webhook_url.clone()?;
        let summary = JobSummary::from(job);
        let notifier = Arc::clone(self);

        Some(tokio::spawn(async move {
            match notifier.notify(&url, &summary).await {
                Ok(_) => {
                    info!(job_id = %summary.job_id, status = %summary.status, "Webhook sent");
                    notifier.metrics.webhook(true);
                }
                Err(e) => {
                    warn!(job_id = %summary.job_id, "Giving up on webhook: {}", e);
                    notifier.metrics.webhook(false);
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use medx_models::{ExtractionRequest, JobStatus};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notifier(metrics: Arc<WorkerMetrics>) -> Arc<WebhookNotifier> {
        let config = WebhookConfig {
            backoff: Duration::from_millis(10),
            ..WebhookConfig::default()
        };
        Arc::new(WebhookNotifier::new(config, metrics).unwrap())
    }

    fn failed_job(hook: &str) -> ExtractionJob {
        let mut job = ExtractionJob::new(
            ExtractionRequest::new("https://youtu.be/abc").with_webhook(hook),
        );
        job.apply_status(JobStatus::Processing, 10, None).unwrap();
        job.apply_status(JobStatus::Failed, 10, Some("Private video".to_string()))
            .unwrap();
        job
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("user-agent", "MediaExtraction-Webhook/1.0"))
            .and(body_partial_json(serde_json::json!({
                "status": "failed",
                "error": "Private video"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let job = failed_job(&format!("{}/hook", server.uri()));
        let attempt = notifier(Arc::new(WorkerMetrics::new()))
            .notify(job.request.webhook_url.as_deref().unwrap(), &JobSummary::from(&job))
            .await
            .unwrap();
        assert_eq!(attempt, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let metrics = Arc::new(WorkerMetrics::new());
        let job = failed_job(&format!("{}/hook", server.uri()));
        let handle = notifier(Arc::clone(&metrics)).spawn_notify(&job).unwrap();
        handle.await.unwrap();

        assert_eq!(metrics.snapshot().webhooks_failed, 1);
        assert_eq!(metrics.snapshot().webhooks_delivered, 0);
    }

    #[tokio::test]
    async fn test_no_webhook_url() {
        let job = ExtractionJob::new(ExtractionRequest::new("https://youtu.be/abc"));
        assert!(notifier(Arc::new(WorkerMetrics::new())).spawn_notify(&job).is_none());
    }
}
