//! Extraction pipeline for a single job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use medx_cache::UrlMetadataCache;
use medx_media::{
    can_remux, cleanup_file, find_downloaded_file, write_cookies_file, DownloadOptions, Extractor,
    ProgressFn, Transcoder,
};
use medx_models::{
    ExtractionJob, ExtractionResult, JobId, JobStatus, MediaMetadata, Platform, UrlMetadata,
};
use medx_queue::{QueueClient, QueueError};
use medx_storage::{generate_key, Storage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics::WorkerMetrics;
use crate::progress::{ProgressPhase, ProgressTracker};
use crate::webhook::WebhookNotifier;

/// What happened to a delivered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    /// Nothing to do: unknown id or already terminal.
    Skipped,
    /// Interrupted before a terminal state was written. The delivery
    /// must not be acknowledged.
    Abandoned,
}

impl JobOutcome {
    pub fn should_ack(&self) -> bool {
        !matches!(self, JobOutcome::Abandoned)
    }
}

/// Processes one delivered job id.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job_id: &JobId, token: &CancellationToken) -> JobOutcome;
}

/// Video codec used when a container change needs a re-encode.
const REENCODE_CODEC: &str = "libx264";

/// Capacity of the progress write queue; reports beyond it are dropped.
const PROGRESS_BUFFER: usize = 16;

/// Output of a successful pipeline run.
struct Completion {
    result: ExtractionResult,
    metadata: Option<MediaMetadata>,
}

/// Runs metadata, download, post-processing and upload for a job and
/// persists its terminal state.
pub struct ExtractionHandler {
    client: Arc<QueueClient>,
    extractor: Arc<dyn Extractor>,
    transcoder: Arc<dyn Transcoder>,
    storage: Arc<dyn Storage>,
    metrics: Arc<WorkerMetrics>,
    work_dir: PathBuf,
    metadata_cache: Option<UrlMetadataCache>,
    notifier: Option<Arc<WebhookNotifier>>,
}

impl ExtractionHandler {
    pub fn new(
        client: Arc<QueueClient>,
        extractor: Arc<dyn Extractor>,
        transcoder: Arc<dyn Transcoder>,
        storage: Arc<dyn Storage>,
        metrics: Arc<WorkerMetrics>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            extractor,
            transcoder,
            storage,
            metrics,
            work_dir: work_dir.into(),
            metadata_cache: None,
            notifier: None,
        }
    }

    pub fn with_metadata_cache(mut self, cache: UrlMetadataCache) -> Self {
        self.metadata_cache = Some(cache);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<WebhookNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    async fn load(&self, job_id: &JobId) -> Result<ExtractionJob, JobOutcome> {
        match self.client.get_status(job_id).await {
            Ok(job) if job.is_terminal() => {
                debug!(job_id = %job_id, status = %job.status, "Skipping redelivered terminal job");
                Err(JobOutcome::Skipped)
            }
            Ok(job) => Ok(job),
            Err(QueueError::JobNotFound(_)) => {
                warn!(job_id = %job_id, "Delivered job has no record, dropping");
                Err(JobOutcome::Skipped)
            }
            Err(e) => {
                error!(job_id = %job_id, "Failed to load job: {}", e);
                Err(JobOutcome::Abandoned)
            }
        }
    }

    async fn run(&self, job: ExtractionJob, token: &CancellationToken) -> JobOutcome {
        let platform = Platform::detect(&job.request.url).as_str();
        let logger = JobLogger::new(&job, platform);
        let started = Instant::now();

        logger.log_start(&job.request.url);
        self.metrics.job_started(platform);

        let tracker = Arc::new(ProgressTracker::new(job.progress));
        tracker.advance(ProgressPhase::Started, 100);
        if let Err(e) = self
            .client
            .update_status(&job.id, JobStatus::Processing, tracker.current(), None)
            .await
        {
            logger.log_warning(&format!("failed to mark processing: {}", e));
        }

        let (progress_tx, persister) = self.spawn_progress_writer(&job.id, &logger);
        let result = self
            .pipeline(&job, &logger, &tracker, &progress_tx, token)
            .await;
        drop(progress_tx);
        if let Err(e) = persister.await {
            logger.log_warning(&format!("progress writer failed: {}", e));
        }

        self.cleanup_job_dir(&job.id).await;

        match result {
            Ok(completion) => {
                let size = completion.result.size_bytes;
                let filename = completion.result.filename.clone();
                match self
                    .client
                    .update_result(&job.id, completion.result, completion.metadata)
                    .await
                {
                    Ok(done) => self.notify(&done),
                    Err(e) => logger.log_warning(&format!("failed to persist result: {}", e)),
                }
                logger.log_completion(&filename, size, started.elapsed());
                self.metrics.job_completed(platform, started.elapsed(), size);
                JobOutcome::Completed
            }
            Err(e) if e.is_cancelled() || token.is_cancelled() => {
                logger.log_warning("interrupted, leaving for redelivery");
                self.metrics.job_abandoned();
                JobOutcome::Abandoned
            }
            Err(e) => {
                let message = e.to_string();
                logger.log_failure(&message, started.elapsed());
                self.fail(&job, tracker.current(), message, &logger).await;
                self.metrics.job_failed(platform, started.elapsed());
                JobOutcome::Failed
            }
        }
    }

    async fn fail(&self, job: &ExtractionJob, progress: u8, message: String, logger: &JobLogger) {
        match self
            .client
            .update_status(&job.id, JobStatus::Failed, progress, Some(message))
            .await
        {
            Ok(failed) => self.notify(&failed),
            Err(e) => logger.log_warning(&format!("failed to persist failure: {}", e)),
        }

        if let Err(e) = self.client.release_uniqueness(job).await {
            logger.log_warning(&format!("failed to release uniqueness key: {}", e));
        }
    }

    fn notify(&self, job: &ExtractionJob) {
        if let Some(notifier) = &self.notifier {
            notifier.spawn_notify(job);
        }
    }

    /// Persist progress off the pipeline's path. Reports arrive through
    /// a bounded channel and are dropped when it is full.
    fn spawn_progress_writer(
        &self,
        job_id: &JobId,
        logger: &JobLogger,
    ) -> (mpsc::Sender<(ProgressPhase, u8)>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<(ProgressPhase, u8)>(PROGRESS_BUFFER);
        let client = Arc::clone(&self.client);
        let job_id = job_id.clone();
        let logger = logger.clone();

        let handle = tokio::spawn(async move {
            while let Some((phase, progress)) = rx.recv().await {
                logger.log_progress(phase.as_str(), progress);
                if let Err(e) = client
                    .update_status(&job_id, JobStatus::Processing, progress, None)
                    .await
                {
                    logger.log_warning(&format!("failed to persist progress: {}", e));
                }
            }
        });
        (tx, handle)
    }

    async fn pipeline(
        &self,
        job: &ExtractionJob,
        logger: &JobLogger,
        tracker: &Arc<ProgressTracker>,
        progress: &mpsc::Sender<(ProgressPhase, u8)>,
        token: &CancellationToken,
    ) -> WorkerResult<Completion> {
        let report = |phase: ProgressPhase, percent: u8| {
            if let Some(value) = tracker.advance(phase, percent) {
                let _ = progress.try_send((phase, value));
            }
        };
        let request = &job.request;

        let metadata = self.metadata(&request.url, token).await?;
        if let Err(e) = self.client.update_metadata(&job.id, metadata.clone()).await {
            logger.log_warning(&format!("failed to persist metadata: {}", e));
        }
        report(ProgressPhase::Metadata, 100);

        let job_dir = self.work_dir.join(job.id.as_str());
        tokio::fs::create_dir_all(&job_dir).await?;
        let output = job_dir.join(format!("{}.%(ext)s", job.id));

        let cookies = match &request.cookies_base64 {
            Some(cookies) if !cookies.trim().is_empty() => {
                Some(write_cookies_file(&job_dir, cookies)?)
            }
            _ => None,
        };

        let download_progress: ProgressFn = {
            let tracker = Arc::clone(tracker);
            let progress = progress.clone();
            Arc::new(move |percent| {
                if let Some(value) = tracker.advance(ProgressPhase::Download, percent) {
                    let _ = progress.try_send((ProgressPhase::Download, value));
                }
            })
        };
        let mut options = DownloadOptions::from_request(request).with_progress(download_progress);
        if let Some(cookies) = &cookies {
            options = options.with_cookies_file(cookies.path());
        }

        let reported = self
            .extractor
            .download(&request.url, &output, &options, token)
            .await?;
        drop(cookies);
        report(ProgressPhase::Download, 100);

        let downloaded = find_downloaded_file(&job_dir, job.id.as_str()).await?;
        let subtitles = find_subtitles(&job_dir, job.id.as_str()).await;

        let file = self.post_process(job, downloaded, logger, token).await?;
        report(ProgressPhase::PostProcess, 100);

        let result = self.upload(&job.id, &file, &subtitles, &metadata).await?;
        report(ProgressPhase::Upload, 100);

        Ok(Completion {
            result,
            metadata: Some(reported.unwrap_or(metadata)),
        })
    }

    /// Metadata from the cache, or from the extractor on a miss. Cache
    /// trouble never fails the job.
    async fn metadata(&self, url: &str, token: &CancellationToken) -> WorkerResult<MediaMetadata> {
        if let Some(cache) = &self.metadata_cache {
            if let Some(cached) = cache.get(url).await {
                self.metrics.cache_lookup(true);
                return Ok(cached.to_media());
            }
            self.metrics.cache_lookup(false);
        }

        let metadata = self.extractor.extract_metadata(url, token).await?;

        if let Some(cache) = &self.metadata_cache {
            if let Err(e) = cache.set(&UrlMetadata::from_media(url, &metadata)).await {
                warn!(url = %url, "Failed to cache metadata: {}", e);
            }
        }
        Ok(metadata)
    }

    /// Change the container when the request asks for one the download
    /// did not produce. Audio extraction already yields the final file.
    async fn post_process(
        &self,
        job: &ExtractionJob,
        downloaded: PathBuf,
        logger: &JobLogger,
        token: &CancellationToken,
    ) -> WorkerResult<PathBuf> {
        let request = &job.request;
        let target = request.format.trim().to_ascii_lowercase();
        if request.extract_audio || target.is_empty() {
            return Ok(downloaded);
        }

        let current = extension_of(&downloaded);
        if current == target {
            return Ok(downloaded);
        }

        let codec = if can_remux(&format!(".{}", current), &format!(".{}", target)) {
            "copy"
        } else {
            REENCODE_CODEC
        };
        info!(
            job_id = logger.job_id(),
            from = %current,
            to = %target,
            codec,
            "Converting downloaded container"
        );

        let converted = self
            .transcoder
            .convert_format(&downloaded, &target, codec, None, token)
            .await?;
        cleanup_file(&downloaded).await;
        Ok(converted)
    }

    async fn upload(
        &self,
        job_id: &JobId,
        file: &Path,
        subtitles: &[PathBuf],
        metadata: &MediaMetadata,
    ) -> WorkerResult<ExtractionResult> {
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| WorkerError::job_failed(format!("no file name in {}", file.display())))?;
        let size_bytes = tokio::fs::metadata(file).await?.len();

        let key = generate_key(job_id.as_str(), &filename);
        self.storage.upload(file, &key).await?;
        let download_url = self.storage.presigned_url(&key).await?;

        let mut subtitle_urls = Vec::with_capacity(subtitles.len());
        for subtitle in subtitles {
            let Some(name) = subtitle.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let key = generate_key(job_id.as_str(), &name);
            self.storage.upload(subtitle, &key).await?;
            subtitle_urls.push(self.storage.presigned_url(&key).await?);
        }

        let ttl = chrono::Duration::from_std(self.storage.url_ttl())
            .unwrap_or_else(|_| chrono::Duration::hours(24));

        Ok(ExtractionResult {
            download_url,
            filename,
            size_bytes,
            format: extension_of(file),
            subtitle_urls,
            thumbnail_url: (!metadata.thumbnail.is_empty()).then(|| metadata.thumbnail.clone()),
            expires_at: Utc::now() + ttl,
        })
    }

    async fn cleanup_job_dir(&self, job_id: &JobId) {
        let dir = self.work_dir.join(job_id.as_str());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %job_id, "Failed to remove job directory: {}", e),
        }
    }
}

#[async_trait]
impl JobHandler for ExtractionHandler {
    async fn handle(&self, job_id: &JobId, token: &CancellationToken) -> JobOutcome {
        let job = match self.load(job_id).await {
            Ok(job) => job,
            Err(outcome) => return outcome,
        };
        let span = JobLogger::new(&job, Platform::detect(&job.request.url).as_str()).create_span();
        self.run(job, token).instrument(span).await
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Subtitle sidecars written next to the download, e.g. `{id}.en.vtt`.
async fn find_subtitles(dir: &Path, id: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return found;
    };
    let prefix = format!("{}.", id);
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && matches!(extension_of(&path).as_str(), "vtt" | "srt") {
            found.push(path);
        }
    }
    found.sort();
    found
}
