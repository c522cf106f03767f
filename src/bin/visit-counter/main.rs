use anyhow::Context;
use std::sync::Arc;
use visit_counter::{
    app::{AppData, RuntimeData},
    cache::AggregateCache,
    config::Config,
    coordinator::Coordinator,
    server,
    service::VisitService,
    storage::{EventLog, SqliteEventLog},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().with_context(|| "fail to load configuration")?;
    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level()?)
        .init();

    let app_data = prepare_app_data(&config)?;
    server::serve(app_data, config.port).await
}

fn prepare_log(config: &Config) -> anyhow::Result<Arc<dyn EventLog>> {
    let log = SqliteEventLog::open(&config.database_url)
        .with_context(|| format!("fail to open visit log `{}`", config.database_url))?;
    Ok(Arc::new(log))
}

#[cfg(feature = "redis")]
fn prepare_cache(config: &Config) -> anyhow::Result<Arc<dyn AggregateCache>> {
    let cache = visit_counter::cache::RedisCache::open(&config.redis_url)
        .with_context(|| format!("invalid redis address `{}`", config.redis_url))?;
    Ok(Arc::new(cache))
}

#[cfg(not(feature = "redis"))]
fn prepare_cache(_: &Config) -> anyhow::Result<Arc<dyn AggregateCache>> {
    tracing::warn!("built without redis support, using an in-process cache");
    Ok(Arc::new(visit_counter::cache::MemoryCache::new()))
}

fn prepare_app_data(config: &Config) -> anyhow::Result<AppData> {
    let log = prepare_log(config)?;
    let coordinator = Coordinator::builder()
        .log(Arc::clone(&log))
        .cache(prepare_cache(config)?)
        .policy(config.cache_policy())
        .key(config.cache_key.as_str())
        .io_timeout(config.io_timeout())
        .build();
    tracing::info!("cache policy: {:?}", coordinator.policy());

    let data = RuntimeData::builder()
        .visits(
            VisitService::builder()
                .log(log)
                .coordinator(coordinator)
                .io_timeout(config.io_timeout())
                .build(),
        )
        .build();

    Ok(data.into())
}
