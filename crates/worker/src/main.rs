//! Worker binary: connects storage and the provider, then runs the
//! worker pool until SIGINT.

use std::sync::Arc;

use anyhow::Context;
use coursecast_db::postgres::PgStore;
use coursecast_db::store::{JobStore, WorkQueue};
use coursecast_events::bus::EventBus;
use coursecast_pipeline::config::PipelineConfig;
use coursecast_pipeline::limiter::SubmitLimiter;
use coursecast_pipeline::pool::WorkerPool;
use coursecast_pipeline::runner::JobRunner;
use coursecast_provider::client::ProviderClient;
use coursecast_provider::http::HttpProviderClient;
use coursecast_provider::publisher::{ArtifactPublisher, HttpArtifactPublisher};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coursecast=info,coursecast_pipeline=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let provider_api_url =
        std::env::var("PROVIDER_API_URL").context("PROVIDER_API_URL must be set")?;
    let media_ingest_url =
        std::env::var("MEDIA_INGEST_URL").context("MEDIA_INGEST_URL must be set")?;

    let config = PipelineConfig::from_env();

    let pg = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to PostgreSQL")?;
    sqlx::migrate!("../db/migrations")
        .run(&pg)
        .await
        .context("failed to run migrations")?;

    let store = Arc::new(PgStore::with_retry_policy(
        pg.clone(),
        config.retry_policy.clone(),
    ));

    let mut provider = HttpProviderClient::new(provider_api_url);
    if let Ok(api_key) = std::env::var("PROVIDER_API_KEY") {
        provider = provider.with_api_key(api_key);
    }
    let provider = Arc::new(provider);
    let publisher = Arc::new(HttpArtifactPublisher::new(media_ingest_url));

    let bus = Arc::new(EventBus::default());
    let limiter = Arc::new(SubmitLimiter::per_minute(config.submits_per_minute));

    let runner = Arc::new(JobRunner::new(
        store.clone() as Arc<dyn JobStore>,
        store.clone() as Arc<dyn WorkQueue>,
        provider as Arc<dyn ProviderClient>,
        publisher as Arc<dyn ArtifactPublisher>,
        bus,
        limiter,
        &config,
    ));
    let pool = WorkerPool::start(runner, store as Arc<dyn WorkQueue>, config);

    tracing::info!("Worker ready, processing generation jobs");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received");
    pool.shutdown().await;
    Ok(())
}
