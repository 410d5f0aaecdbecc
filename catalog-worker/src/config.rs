use std::{path::PathBuf, time::Duration};

use catalog_broker::adapters::kafka::KafkaSettings;
use catalog_models::errors::{RuntimeError, SendableError};
use catalog_utilities::LogSettings;
use clap::{Parser, ValueEnum};
use log::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrokerBackend {
    Kafka,
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DatabaseBackend {
    Postgres,
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheBackend {
    Redis,
    InMemory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseBackend,
    pub database_url: Option<String>,
    pub db_pool_min: u32,
    pub db_pool_max: u32,
    pub init_scripts: Vec<String>,
    pub broker: BrokerBackend,
    pub kafka: KafkaSettings,
    pub prefetch_count: usize,
    pub topics: Vec<String>,
    pub cache: CacheBackend,
    pub redis_url: String,
    pub cache_ttl: Duration,
    pub log: LogSettings,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[arg(long, value_enum, default_value = "postgres")]
    database: DatabaseBackend,

    #[arg(long, env = "DATABASE_CONNECTION_STRING")]
    database_url: Option<String>,

    #[arg(long, env = "DATABASE_POOL_MIN", default_value_t = 10)]
    db_pool_min: u32,

    #[arg(long, env = "DATABASE_POOL_MAX", default_value_t = 45)]
    db_pool_max: u32,

    /// Extra `.sql` files run after the built-in table script.
    #[arg(long)]
    init_script: Vec<String>,

    #[arg(long, value_enum, default_value = "kafka")]
    broker: BrokerBackend,

    #[arg(
        long,
        env = "KAFKA_BOOTSTRAP_SERVERS",
        value_delimiter = ',',
        default_value = "localhost:9092"
    )]
    kafka_bootstrap_servers: Vec<String>,

    #[arg(long, env = "KAFKA_GROUP_ID", default_value = "catalog")]
    kafka_group_id: String,

    #[arg(long, env = "KAFKA_PRODUCER_ACKS", default_value = "all")]
    kafka_producer_acks: String,

    #[arg(long, default_value_t = 30_000)]
    kafka_session_timeout_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    kafka_heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = 60_000)]
    kafka_rebalance_timeout_ms: u64,

    #[arg(long, default_value_t = 30)]
    shutdown_timeout_seconds: u64,

    /// Raw client option passed through to the Kafka client, e.g.
    /// `security.protocol=SASL_SSL`. May be repeated.
    #[arg(long = "kafka-option", value_name = "KEY=VALUE")]
    kafka_options: Vec<String>,

    #[arg(long, default_value_t = 10)]
    prefetch_count: usize,

    #[arg(long, value_delimiter = ',', default_value = "products.add")]
    topics: Vec<String>,

    #[arg(long, value_enum, default_value = "redis")]
    cache: CacheBackend,

    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    redis_url: String,

    #[arg(long, env = "PRODUCT_CACHE_TTL_SECONDS", default_value_t = 1800)]
    cache_ttl_seconds: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: LevelFilter,

    #[arg(long)]
    log_file: Option<PathBuf>,
}

pub fn parse_config() -> Result<Config, SendableError> {
    build_config(CliArgs::parse())
}

pub fn build_config(args: CliArgs) -> Result<Config, SendableError> {
    if args.db_pool_min > args.db_pool_max {
        return Err(Box::new(RuntimeError::new(
            "worker.config.pool_size",
            format!(
                "database pool min ({}) exceeds max ({})",
                args.db_pool_min, args.db_pool_max
            ),
        )));
    }
    if args.database == DatabaseBackend::Postgres && args.database_url.is_none() {
        return Err(Box::new(RuntimeError::new(
            "worker.config.database_url",
            "DATABASE_CONNECTION_STRING must be set for the postgres backend",
        )));
    }

    let security = args
        .kafka_options
        .iter()
        .map(String::as_str)
        .map(parse_key_value)
        .collect::<Result<Vec<_>, _>>()?;

    let kafka = KafkaSettings {
        bootstrap_servers: args
            .kafka_bootstrap_servers
            .into_iter()
            .map(|server| server.trim().to_string())
            .filter(|server| !server.is_empty())
            .collect(),
        consumer_group_id: args.kafka_group_id,
        producer_acks: args.kafka_producer_acks,
        session_timeout: Duration::from_millis(args.kafka_session_timeout_ms),
        heartbeat_interval: Duration::from_millis(args.kafka_heartbeat_interval_ms),
        rebalance_timeout: Duration::from_millis(args.kafka_rebalance_timeout_ms),
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout_seconds),
        security,
    };

    let topics = args
        .topics
        .into_iter()
        .map(|topic| topic.trim().to_string())
        .filter(|topic| !topic.is_empty())
        .collect();

    Ok(Config {
        database: args.database,
        database_url: args.database_url,
        db_pool_min: args.db_pool_min,
        db_pool_max: args.db_pool_max,
        init_scripts: args.init_script,
        broker: args.broker,
        kafka,
        prefetch_count: args.prefetch_count.max(1),
        topics,
        cache: args.cache,
        redis_url: args.redis_url,
        cache_ttl: Duration::from_secs(args.cache_ttl_seconds),
        log: LogSettings {
            level: args.log_level,
            file: args.log_file,
        },
    })
}

fn parse_key_value(option: &str) -> Result<(String, String), SendableError> {
    match option.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(Box::new(RuntimeError::new(
            "worker.config.kafka_option",
            format!("expected KEY=VALUE, got '{option}'"),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, SendableError> {
        let mut argv = vec!["catalog-worker"];
        argv.extend_from_slice(args);
        build_config(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_match_kafka_settings() {
        let config = parse(&["--database", "in-memory", "--broker", "in-memory"]).unwrap();
        assert_eq!(config.db_pool_min, 10);
        assert_eq!(config.db_pool_max, 45);
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.topics, vec!["products.add".to_string()]);
        assert_eq!(config.kafka.producer_acks, "all");
        assert_eq!(config.kafka.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.log.level, LevelFilter::Info);
        assert_eq!(config.cache, CacheBackend::Redis);
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.cache_ttl, Duration::from_secs(1800));
    }

    #[test]
    fn cache_settings_are_read() {
        let config = parse(&[
            "--database",
            "in-memory",
            "--cache",
            "in-memory",
            "--redis-url",
            "rediss://cache:6380",
            "--cache-ttl-seconds",
            "60",
        ])
        .unwrap();
        assert_eq!(config.cache, CacheBackend::InMemory);
        assert_eq!(config.redis_url, "rediss://cache:6380");
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
    }

    #[test]
    fn kafka_options_are_split() {
        let config = parse(&[
            "--database",
            "in-memory",
            "--kafka-option",
            "security.protocol=SASL_SSL",
            "--kafka-option",
            "sasl.mechanism=PLAIN",
            "--kafka-bootstrap-servers",
            "a:9092, b:9092",
        ])
        .unwrap();
        assert_eq!(
            config.kafka.security,
            vec![
                ("security.protocol".to_string(), "SASL_SSL".to_string()),
                ("sasl.mechanism".to_string(), "PLAIN".to_string()),
            ]
        );
        assert_eq!(config.kafka.bootstrap_servers, vec!["a:9092", "b:9092"]);
    }

    #[test]
    fn malformed_kafka_option_is_rejected() {
        assert!(parse(&["--database", "in-memory", "--kafka-option", "novalue"]).is_err());
    }

    #[test]
    fn inverted_pool_bounds_are_rejected() {
        assert!(
            parse(&[
                "--database",
                "in-memory",
                "--db-pool-min",
                "50",
                "--db-pool-max",
                "5"
            ])
            .is_err()
        );
    }
}
