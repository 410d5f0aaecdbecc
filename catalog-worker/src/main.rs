use std::sync::Arc;

use catalog_broker::{BrokerPort, adapters::kafka::KafkaBroker, in_memory::InMemoryBroker};
use catalog_database::{
    in_memory::InMemoryUnitOfWorkFactory, interfaces::UnitOfWorkFactory, postgres::PostgresDb,
};
use catalog_models::errors::{RuntimeError, SendableError};
use catalog_services::{
    ADD_PRODUCT_TOPIC, ProductCache,
    cache::{InMemoryProductCache, RedisProductCache},
    products::AddProduct,
};
use catalog_utilities::startup;
use catalog_worker::{
    ConsumerWorker,
    config::{BrokerBackend, CacheBackend, Config, DatabaseBackend, parse_config},
};
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let config = parse_config()?;
    startup::startup("Catalog Worker", &config.log)?;

    let broker = build_broker(&config)?;
    let cache = build_cache(&config).await?;

    match config.database {
        DatabaseBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                Box::new(RuntimeError::new(
                    "worker.database.url",
                    "no database connection string configured",
                )) as SendableError
            })?;
            let db = PostgresDb::new(url, config.db_pool_min, config.db_pool_max).await?;
            db.run_init_scripts(&config.init_scripts).await?;
            let factory = Arc::new(db.unit_of_work_factory());
            let result = run_worker(&config, broker, cache, factory).await;
            db.close().await;
            result
        }
        DatabaseBackend::InMemory => {
            info!("Using in-memory product store");
            let factory = Arc::new(InMemoryUnitOfWorkFactory::default());
            run_worker(&config, broker, cache, factory).await
        }
    }
}

fn build_broker(config: &Config) -> Result<Arc<dyn BrokerPort>, SendableError> {
    match config.broker {
        BrokerBackend::Kafka => {
            info!(
                "Using Kafka broker at {}",
                config.kafka.bootstrap_servers.join(",")
            );
            Ok(Arc::new(KafkaBroker::new(config.kafka.clone())?))
        }
        BrokerBackend::InMemory => Ok(Arc::new(InMemoryBroker::new())),
    }
}

async fn build_cache(config: &Config) -> Result<Arc<dyn ProductCache>, SendableError> {
    match config.cache {
        CacheBackend::Redis => {
            info!("Using Redis product cache");
            let cache = RedisProductCache::connect(&config.redis_url, config.cache_ttl).await?;
            Ok(Arc::new(cache))
        }
        CacheBackend::InMemory => Ok(Arc::new(InMemoryProductCache::with_ttl(config.cache_ttl))),
    }
}

async fn run_worker<F: UnitOfWorkFactory>(
    config: &Config,
    broker: Arc<dyn BrokerPort>,
    cache: Arc<dyn ProductCache>,
    factory: Arc<F>,
) -> Result<(), SendableError> {
    let add_product = Arc::new(AddProduct::new(factory, cache));

    let worker = ConsumerWorker::new(broker, config.topics.clone(), config.prefetch_count);
    worker.register_handler(ADD_PRODUCT_TOPIC, move |context, message| {
        let add_product = Arc::clone(&add_product);
        async move { add_product.handle_message(context, message).await }
    });
    worker.start().await?;

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", err);
    }
    info!("Shutdown signal received. Stopping worker...");
    worker.stop().await?;

    Ok(())
}
