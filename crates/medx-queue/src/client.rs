//! Queue client: submission and job state writes.

use std::sync::Arc;

use medx_models::{
    ExtractionJob, ExtractionRequest, ExtractionResult, JobId, JobStatus, Lane, MediaMetadata,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::broker::{Broker, EnqueueOutcome};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::store::JobStore;

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub lane: Lane,
    /// The request was folded into an existing job.
    pub duplicate: bool,
}

/// Persists jobs and routes them to priority lanes.
pub struct QueueClient {
    broker: Arc<dyn Broker>,
    store: Arc<dyn JobStore>,
    config: QueueConfig,
}

impl QueueClient {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            broker,
            store,
            config,
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Submit a request.
    ///
    /// The job record is written before the broker sees the job, so a
    /// worker never dequeues an id without a record. When an identical
    /// request is inside its uniqueness window the new record is dropped
    /// and the existing job id returned.
    pub async fn submit(&self, request: ExtractionRequest) -> QueueResult<SubmitReceipt> {
        request
            .validate()
            .map_err(|e| QueueError::InvalidRequest(e.to_string()))?;

        let lane = request.lane();
        let unique_key = self.config.unique_key(&request.dedup_key());
        let job = ExtractionJob::new(request);
        self.store.save(&job).await?;

        let outcome = self
            .broker
            .enqueue(lane, &job.id, &unique_key, self.config.unique_window)
            .await;

        match outcome {
            Ok(EnqueueOutcome::Enqueued { .. }) => {
                info!(job_id = %job.id, lane = %lane, url = %job.request.url, "Job submitted");
                Ok(SubmitReceipt {
                    job_id: job.id,
                    lane,
                    duplicate: false,
                })
            }
            Ok(EnqueueOutcome::Duplicate(existing)) => {
                self.discard(&job.id).await;
                info!(job_id = %existing, lane = %lane, "Duplicate submission, returning existing job");
                Ok(SubmitReceipt {
                    job_id: existing,
                    lane,
                    duplicate: true,
                })
            }
            Err(e) => {
                self.discard(&job.id).await;
                Err(e)
            }
        }
    }

    /// Submit several requests, one receipt or error per request in order.
    pub async fn submit_batch(
        &self,
        requests: Vec<ExtractionRequest>,
    ) -> Vec<QueueResult<SubmitReceipt>> {
        let mut receipts = Vec::with_capacity(requests.len());
        for request in requests {
            receipts.push(self.submit(request).await);
        }
        receipts
    }

    async fn discard(&self, id: &JobId) {
        if let Err(e) = self.store.delete(id).await {
            warn!(job_id = %id, "Failed to discard provisional job record: {}", e);
        }
    }

    pub async fn get_status(&self, id: &JobId) -> QueueResult<ExtractionJob> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
    }

    /// Write status, progress and error. Rejects transitions out of a
    /// terminal state.
    pub async fn update_status(
        &self,
        id: &JobId,
        status: JobStatus,
        progress: u8,
        error: Option<String>,
    ) -> QueueResult<ExtractionJob> {
        let mut job = self.get_status(id).await?;
        job.apply_status(status, progress, error)?;
        self.store.save(&job).await?;
        debug!(job_id = %id, status = %status, progress = job.progress, "Updated job status");
        Ok(job)
    }

    /// Mark the job completed with its result.
    pub async fn update_result(
        &self,
        id: &JobId,
        result: ExtractionResult,
        metadata: Option<MediaMetadata>,
    ) -> QueueResult<ExtractionJob> {
        let mut job = self.get_status(id).await?;
        job.complete(result, metadata)?;
        self.store.save(&job).await?;
        info!(job_id = %id, "Job completed");
        Ok(job)
    }

    /// Record metadata while the job is running.
    pub async fn update_metadata(
        &self,
        id: &JobId,
        metadata: MediaMetadata,
    ) -> QueueResult<ExtractionJob> {
        let mut job = self.get_status(id).await?;
        job.apply_metadata(metadata)?;
        self.store.save(&job).await?;
        Ok(job)
    }

    /// Free the uniqueness key held by `job` so the same request can be
    /// resubmitted before the window ends.
    pub async fn release_uniqueness(&self, job: &ExtractionJob) -> QueueResult<bool> {
        let key = self.config.unique_key(&job.request.dedup_key());
        self.broker.release_unique(&key, &job.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, MemoryJobStore};
    use chrono::Utc;

    fn client() -> (QueueClient, Arc<MemoryBroker>, Arc<MemoryJobStore>) {
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(MemoryJobStore::default());
        let client = QueueClient::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&store) as Arc<dyn JobStore>,
            QueueConfig::default(),
        );
        (client, broker, store)
    }

    fn request() -> ExtractionRequest {
        ExtractionRequest::new("https://www.youtube.com/watch?v=abc")
            .with_quality("1080p")
            .with_format("mp4")
    }

    #[tokio::test]
    async fn test_submit_routes_by_quality_and_dedups() {
        let (client, broker, store) = client();

        let first = client.submit(request()).await.unwrap();
        assert_eq!(first.lane, Lane::Default);
        assert!(!first.duplicate);

        let second = client.submit(request()).await.unwrap();
        assert_eq!(second.job_id, first.job_id);
        assert!(second.duplicate);
        assert_eq!(store.len(), 1);
        assert_eq!(broker.len(Lane::Default).await.unwrap(), 1);

        let other = client.submit(request().with_quality("4k")).await.unwrap();
        assert_eq!(other.lane, Lane::Critical);
        assert_ne!(other.job_id, first.job_id);

        let job = client.get_status(&first.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_persisted() {
        let (client, _, store) = client();
        let err = client.submit(ExtractionRequest::new("not a url")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidRequest(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_status_lifecycle_and_terminal_guard() {
        let (client, _, _) = client();
        let id = client.submit(request()).await.unwrap().job_id;

        client.update_status(&id, JobStatus::Processing, 10, None).await.unwrap();
        let job = client.update_status(&id, JobStatus::Processing, 5, None).await.unwrap();
        assert_eq!(job.progress, 10);

        client
            .update_metadata(&id, MediaMetadata { title: "t".into(), ..Default::default() })
            .await
            .unwrap();

        let result = ExtractionResult {
            download_url: "https://cdn/x.mp4".into(),
            filename: "x.mp4".into(),
            size_bytes: 3,
            format: "mp4".into(),
            subtitle_urls: Vec::new(),
            thumbnail_url: None,
            expires_at: Utc::now(),
        };
        let job = client.update_result(&id, result, None).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.metadata.unwrap().title, "t");

        let err = client
            .update_status(&id, JobStatus::Failed, 0, Some("late".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_release_uniqueness_allows_resubmit() {
        let (client, _, _) = client();
        let first = client.submit(request()).await.unwrap();
        let job = client
            .update_status(&first.job_id, JobStatus::Processing, 10, None)
            .await
            .unwrap();
        let job = {
            let mut job = job;
            job.apply_status(JobStatus::Failed, 0, Some("boom".into())).unwrap();
            job
        };

        assert!(client.release_uniqueness(&job).await.unwrap());
        let again = client.submit(request()).await.unwrap();
        assert!(!again.duplicate);
        assert_ne!(again.job_id, first.job_id);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (client, _, _) = client();
        let err = client.get_status(&JobId::from_string("missing")).await.unwrap_err();
        assert!(matches!(err, QueueError::JobNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_submit_batch_keeps_order() {
        let (client, _, _) = client();
        let receipts = client
            .submit_batch(vec![request(), ExtractionRequest::new(""), request()])
            .await;
        assert_eq!(receipts.len(), 3);
        assert!(receipts[0].is_ok());
        assert!(receipts[1].is_err());
        assert!(receipts[2].as_ref().unwrap().duplicate);
    }
}
