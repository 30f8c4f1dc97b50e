//! Media extraction worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use medx_cache::{CacheConfig, DistributedCache, UrlMetadataCache};
use medx_media::{
    check_ffmpeg, check_ytdlp, Extractor, ExtractorConfig, FfmpegTranscoder, ResilientExtractor,
    YtDlpExtractor,
};
use medx_queue::{
    Broker, JobStore, MemoryBroker, MemoryJobStore, QueueBackend, QueueClient, QueueConfig,
    RedisBroker, RedisJobStore,
};
use medx_resilience::{BreakerState, CircuitBreaker};
use medx_storage::{create_storage, StorageConfig};
use medx_worker::{
    init_prometheus, spawn_temp_sweeper, ExtractionHandler, JobServer, WebhookConfig,
    WebhookNotifier, WorkerConfig, WorkerMetrics,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("medx=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }

    info!("Starting medx-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);
    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("creating work dir {}", config.work_dir.display()))?;

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr: SocketAddr = addr.parse().context("parsing METRICS_ADDR")?;
        init_prometheus(addr)?;
        info!(%addr, "Prometheus exporter listening");
    }
    let metrics = Arc::new(WorkerMetrics::new());

    let queue_config = QueueConfig::from_env();
    let (broker, store): (Arc<dyn Broker>, Arc<dyn JobStore>) = match queue_config.backend {
        QueueBackend::Redis => (
            Arc::new(RedisBroker::new(queue_config.clone())?),
            Arc::new(RedisJobStore::new(&queue_config)?),
        ),
        QueueBackend::Memory => {
            warn!("Using in-memory queue; jobs are not shared with other processes");
            (
                Arc::new(MemoryBroker::new()),
                Arc::new(MemoryJobStore::new(queue_config.job_retention)),
            )
        }
    };
    let client = Arc::new(QueueClient::new(broker, store, queue_config.clone()));

    let cache_config = CacheConfig::from_env();
    let cache = match queue_config.backend {
        QueueBackend::Redis => DistributedCache::redis(cache_config)?,
        QueueBackend::Memory => DistributedCache::in_memory(cache_config),
    };
    let metadata_cache = UrlMetadataCache::new(Arc::new(cache));

    let storage = create_storage(&StorageConfig::from_env()?).await?;
    info!(backend = storage.name(), "Storage ready");

    let extractor_config = ExtractorConfig::from_env();
    for check in [
        check_ytdlp(&extractor_config.ytdlp_path),
        check_ffmpeg(&extractor_config.ffmpeg_path),
    ] {
        if let Err(e) = check {
            warn!("{}", e);
        }
    }

    let breaker_metrics = Arc::clone(&metrics);
    let breaker = Arc::new(
        CircuitBreaker::new(extractor_config.breaker_settings()).with_observer(Arc::new(
            move |name: &str, _from: BreakerState, to: BreakerState| {
                breaker_metrics.breaker_state(name, to)
            },
        )),
    );
    let extractor: Arc<dyn Extractor> = Arc::new(ResilientExtractor::new(
        Arc::new(YtDlpExtractor::new(&extractor_config)),
        breaker,
        extractor_config.retry_policy(),
    ));
    let transcoder = Arc::new(FfmpegTranscoder::new(
        extractor_config.ffmpeg_path.clone(),
        extractor_config.timeout,
    ));

    let notifier = Arc::new(WebhookNotifier::new(
        WebhookConfig::from_env(),
        Arc::clone(&metrics),
    )?);

    let handler = ExtractionHandler::new(
        Arc::clone(&client),
        extractor,
        transcoder,
        storage,
        Arc::clone(&metrics),
        config.work_dir.clone(),
    )
    .with_metadata_cache(metadata_cache)
    .with_notifier(notifier);

    let shutdown = CancellationToken::new();
    let sweeper = spawn_temp_sweeper(
        config.work_dir.clone(),
        config.temp_sweep_interval,
        config.temp_max_age,
        shutdown.clone(),
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_token.cancel();
    });

    let server = JobServer::new(config, client, Arc::new(handler));
    server.run(shutdown.clone()).await?;

    shutdown.cancel();
    sweeper.await.ok();

    info!(snapshot = ?metrics.snapshot(), "Worker shutdown complete");
    Ok(())
}
