use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cache;
mod config;
mod consumer;
mod health;
mod messaging;
mod metrics;
mod models;
mod service;
mod store;
mod utils;

use cache::LruOrderCache;
use config::Config;
use consumer::OrderConsumer;
use health::{HealthRegistry, HealthStatus};
use messaging::{KafkaDeadLetterSink, KafkaOrderSource};
use service::OrderService;
use store::PgOrderStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional .env next to the binary; real environment variables win
    dotenvy::dotenv().ok();

    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=order_pipeline=trace cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,order_pipeline=debug")),
        )
        .init();

    tracing::info!("🚀 Starting order ingestion pipeline");

    let config = Config::from_env()?;
    let health = Arc::new(HealthRegistry::new());

    let metrics = Arc::new(metrics::Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // === 1. Durable store ===
    tracing::info!("Connecting to PostgreSQL...");
    let pool = PgOrderStore::connect(&config.database_url, config.db_max_connections).await?;
    let store = Arc::new(PgOrderStore::new(pool, &config.retry).with_metrics(metrics.clone()));
    store.ensure_schema().await?;
    health.update(health::DATABASE, HealthStatus::Healthy).await;

    // === 2. Metrics and health endpoints ===

    // Metrics server runs on its own thread and runtime
    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_health = health.clone();
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("Metrics runtime error: {}", e);
                return;
            }
        };
        rt.block_on(async {
            if let Err(e) =
                metrics::start_metrics_server(metrics_registry, metrics_health, metrics_port).await
            {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    });

    // === 3. Cache and service ===
    let cache = Arc::new(LruOrderCache::from_config(&config.cache).with_metrics(metrics.clone()));
    let service = OrderService::new(store.clone(), cache.clone());

    if config.cache.warmup_limit > 0 {
        if let Err(e) = service.warm_cache(config.cache.warmup_limit).await {
            tracing::warn!(error = %e, "Cache warm-up failed, starting cold");
        }
        tracing::debug!(cached = cache.len().await, "Cache size after warm-up");
    }

    let shutdown = CancellationToken::new();
    let sweeper = cache
        .clone()
        .spawn_sweeper(config.cache.sweep_interval, shutdown.clone());

    // === 4. Stream consumer ===
    let source = Arc::new(KafkaOrderSource::new(&config.kafka)?);
    let mut consumer = OrderConsumer::new(
        source,
        service.clone(),
        &config.retry,
        health.clone(),
        metrics.clone(),
    );

    if let Some(topic) = &config.kafka.dead_letter_topic {
        let sink = KafkaDeadLetterSink::new(
            &config.kafka.bootstrap_servers(),
            topic,
            config.retry.producer_send.clone(),
        )?;
        consumer = consumer.with_dead_letters(Arc::new(sink));
        tracing::info!(topic = %topic, "Dead letter topic enabled");
    }

    let mut consumer_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { consumer.run(shutdown).await }
    });

    // === 5. Wait for a signal or for the consumer to give up ===
    let consumer_result = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
            shutdown.cancel();

            match tokio::time::timeout(config.shutdown_timeout, &mut consumer_task).await {
                Ok(result) => Some(result),
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = config.shutdown_timeout.as_secs(),
                        "Consumer did not stop in time, abandoning in-flight message"
                    );
                    consumer_task.abort();
                    None
                }
            }
        }
        result = &mut consumer_task => {
            shutdown.cancel();
            Some(result)
        }
    };

    if sweeper.await.is_err() {
        tracing::warn!("Cache sweeper task panicked");
    }

    store.pool().close().await;
    tracing::info!("Database pool closed");

    match consumer_result {
        Some(Ok(Err(e))) => Err(anyhow::anyhow!("consumer stopped: {e}")),
        Some(Err(e)) => Err(anyhow::anyhow!("consumer task failed: {e}")),
        _ => {
            tracing::info!("👋 Shutdown complete");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
