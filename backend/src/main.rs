use std::backtrace::Backtrace;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use token_intel_backend::api::{create_admin_router, AdminApiState};
use token_intel_backend::cache::{CacheStore, HotDataLedger, RedisCacheStore, TokenSnapshotStore};
use token_intel_backend::intake::{IntelligenceConsumer, RedisWorkQueue, WorkQueue};
use token_intel_backend::market_data::{MarketDataEnricher, QuoteApiClient};
use token_intel_backend::pipeline::{DetectionScheduler, IntelligencePipeline};
use token_intel_backend::projection::{NoopProjection, PgShowedTokensProjection, ShowedTokensProjection};
use token_intel_backend::ranking::{AdminRankingClient, FallbackRanking, RankingAuthority};
use token_intel_backend::shutdown::ShutdownSignal;
use token_intel_backend::AppConfig;

/// Logs every panic with the backtrace of the panicking thread; workers are
/// recovered by the consumer afterwards.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();
        error!(panic = %panic_info, backtrace = %backtrace, "Panic captured");
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    install_panic_hook();

    let config = AppConfig::load()?;
    info!("✅ Configuration loaded (detection mode: {:?})", config.detection.mode);

    let store: Arc<dyn CacheStore> = Arc::new(RedisCacheStore::connect(&config.redis).await?);
    let snapshots = TokenSnapshotStore::new(store.clone(), &config.cache);
    let ledger = HotDataLedger::new(store.clone(), &config.cache);
    info!("✅ Cache store initialized");

    let quotes = Arc::new(QuoteApiClient::new(config.market_data.clone())?);
    let enricher = MarketDataEnricher::new(quotes, &config.market_data.supported_chains);

    let authority: Arc<dyn RankingAuthority> = Arc::new(AdminRankingClient::new(config.ranking.clone())?);
    let ranking: Arc<dyn RankingAuthority> = if config.ranking.local_fallback {
        info!("Local ranking fallback enabled");
        Arc::new(FallbackRanking::new(authority))
    } else {
        authority
    };

    let projection: Arc<dyn ShowedTokensProjection> = match &config.projection.database_url {
        Some(url) => match PgShowedTokensProjection::connect(&config.projection, url).await {
            Ok(projection) => Arc::new(projection),
            Err(e) => {
                warn!("⚠️ Showed-tokens projection disabled: {}", e);
                Arc::new(NoopProjection)
            }
        },
        None => Arc::new(NoopProjection),
    };

    let pipeline = Arc::new(IntelligencePipeline::new(
        snapshots.clone(),
        ledger.clone(),
        enricher,
        ranking,
        projection,
        config.detection.top_n,
    ));
    info!("✅ Intelligence pipeline initialized");

    let shutdown = ShutdownSignal::new();
    let scheduler = Arc::new(DetectionScheduler::new(
        pipeline,
        store,
        config.detection.clone(),
        config.cache.lease_key_prefix.clone(),
        shutdown.clone(),
    ));

    let queue: Arc<dyn WorkQueue> =
        Arc::new(RedisWorkQueue::connect(&config.redis, &config.consumer.queue_name).await?);
    let consumer = Arc::new(IntelligenceConsumer::new(
        queue.clone(),
        scheduler,
        config.consumer.clone(),
        config.detection.mode,
        shutdown.clone(),
    ));
    let consumer_task = tokio::spawn(consumer.run());
    info!("✅ Intelligence consumer initialized");

    if config.admin.enabled {
        let state = Arc::new(AdminApiState::new(snapshots, ledger, queue));
        let app = create_admin_router(state);
        let listener = tokio::net::TcpListener::bind(&config.admin.bind_addr).await?;
        info!("🚀 Admin API listening on {}", config.admin.bind_addr);
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await
            {
                error!("Admin API stopped: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, draining workers...");
    shutdown.trigger();

    match consumer_task.await {
        Ok(Ok(())) => info!("👋 Shutdown complete"),
        Ok(Err(e)) => error!("Consumer stopped with error: {}", e),
        Err(e) => error!("Consumer task failed: {}", e),
    }
    Ok(())
}
