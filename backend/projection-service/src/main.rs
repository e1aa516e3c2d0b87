use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use idempotent_consumer::{
    IdempotencyTracker, MemoryProgressStore, MemoryWatermarkStore, PgProgressStore,
    PgWatermarkStore, ProgressStore, WatermarkStore, MIGRATOR,
};
use projection_service::config::{Config, QualityProvider};
use projection_service::consumer::{KafkaConnector, KafkaConnectorConfig};
use projection_service::enrichment::{
    Enricher, HeuristicQualityValidator, LlmQualityValidator, QualityValidator,
};
use projection_service::health::{build_server, HealthState};
use projection_service::services::{ElasticsearchIndexStore, IndexStore, RedisNotificationSink};
use projection_service::{EngineDeps, EngineSettings, FanoutDispatcher, FanoutSettings, ProjectionEngine};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const WATERMARK_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("projection_service=info,idempotent_consumer=info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_enricher(config: &Config) -> Option<Arc<Enricher>> {
    if !config.quality.enabled {
        return None;
    }

    let quality = &config.quality;
    let validator: Arc<dyn QualityValidator> = match (&quality.provider, &quality.api_key) {
        (QualityProvider::Llm, Some(api_key)) => Arc::new(LlmQualityValidator::new(
            &quality.api_base,
            api_key,
            &quality.model,
            quality.min_quality_score,
        )),
        _ => Arc::new(HeuristicQualityValidator::new(quality.min_quality_score)),
    };

    let mut settings = resilience::enrichment_config();
    settings.timeout.duration = Duration::from_secs(quality.timeout_secs);

    info!(
        provider = validator.provider(),
        model = validator.model(),
        block_low_quality = quality.block_low_quality,
        "Quality enrichment enabled"
    );
    Some(Arc::new(Enricher::new(
        validator,
        settings,
        quality.block_low_quality,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting projection-service");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        topic = %config.kafka.topic,
        index = %config.elasticsearch.index,
        batch_max_size = config.projection.batch_max_size,
        batch_max_linger_ms = config.projection.batch_max_linger_ms,
        "Configuration loaded"
    );

    // Progress markers and watermarks
    let (progress, watermarks): (Arc<dyn ProgressStore>, Arc<dyn WatermarkStore>) =
        match &config.database.url {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.database.max_connections)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(url)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                MIGRATOR
                    .run(&pool)
                    .await
                    .context("Failed to run progress store migrations")?;
                info!("Progress store: PostgreSQL");
                (
                    Arc::new(PgProgressStore::new(pool.clone())),
                    Arc::new(PgWatermarkStore::new(pool)),
                )
            }
            None => {
                warn!("DATABASE_URL not set; progress markers are kept in memory and lost on restart");
                (
                    Arc::new(MemoryProgressStore::new()),
                    Arc::new(MemoryWatermarkStore::new()),
                )
            }
        };
    let tracker = IdempotencyTracker::new(watermarks, config.kafka.topic.clone());

    let index: Arc<dyn IndexStore> = Arc::new(
        ElasticsearchIndexStore::new(&config.elasticsearch.url, &config.elasticsearch.index)
            .await
            .context("Failed to initialize Elasticsearch")?,
    );

    let connector = Arc::new(KafkaConnector::new(KafkaConnectorConfig::from_kafka(
        &config.kafka,
        &config.kafka.group_id,
    )));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = ProjectionEngine::new(
        EngineSettings::from_config(&config),
        EngineDeps {
            connector,
            index: index.clone(),
            progress,
            tracker: tracker.clone(),
            enricher: build_enricher(&config),
        },
    )
    .start(shutdown_rx.clone())
    .await
    .context("Failed to start projection engine")?;

    // Health + metrics
    let http_addr = format!("{}:{}", config.http.host, config.http.port);
    let http_server = build_server(HealthState::new(engine.state_receivers(), index), &http_addr)
        .context("Failed to bind HTTP server")?;
    let http_handle = http_server.handle();
    let http_task = tokio::spawn(http_server);
    info!("HTTP health server listening on http://{}", http_addr);

    // Fan-out
    let fanout_task = if config.fanout.enabled {
        match RedisNotificationSink::new(&config.redis.url, &config.fanout.channel_prefix).await {
            Ok(sink) => {
                let fanout_connector = Arc::new(KafkaConnector::new(
                    KafkaConnectorConfig::from_kafka(&config.kafka, &config.fanout.group_id),
                ));
                let dispatcher = FanoutDispatcher::new(
                    FanoutSettings::from_config(&config),
                    fanout_connector,
                    Arc::new(sink),
                );
                let rx = shutdown_rx.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = dispatcher.run(rx).await {
                        error!("Fan-out dispatcher stopped: {}", e);
                    }
                }))
            }
            Err(e) => {
                warn!("Fan-out disabled, Redis unavailable: {}", e);
                None
            }
        }
    } else {
        info!("Fan-out disabled by configuration");
        None
    };

    // Watermark retention
    let retention = config.watermark_retention();
    let mut cleanup_shutdown = shutdown_rx.clone();
    let cleanup_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(WATERMARK_CLEANUP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match tracker.cleanup(retention).await {
                        Ok(removed) if removed > 0 => info!(removed, "Expired watermarks removed"),
                        Ok(_) => {}
                        Err(e) => warn!("Watermark cleanup failed: {}", e),
                    }
                }
                _ = cleanup_shutdown.changed() => break,
            }
        }
    });

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining lanes");
        let _ = shutdown_tx.send(true);
    });

    info!("projection-service is running");
    let outcome = engine.join().await;

    http_handle.stop(true).await;
    let _ = http_task.await;
    if let Some(task) = fanout_task {
        task.abort();
        let _ = task.await;
    }
    cleanup_task.abort();

    match outcome {
        Ok(()) => {
            info!("projection-service stopped");
            Ok(())
        }
        Err(e) => {
            error!("Projection engine failed: {}", e);
            Err(e.into())
        }
    }
}
