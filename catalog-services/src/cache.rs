use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use catalog_models::core::Product;
use log::{debug, info};
use parking_lot::Mutex;
use redis::{AsyncCommands, aio::ConnectionManager};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_PRODUCT_TTL: Duration = Duration::from_secs(1800);

const PRODUCT_KEY_PREFIX: &str = "product:";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cached product is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait ProductCache: Send + Sync {
    async fn put(&self, guid: Uuid, product: &Product) -> Result<(), CacheError>;

    async fn get(&self, guid: Uuid) -> Result<Option<Product>, CacheError>;

    async fn delete(&self, guid: Uuid) -> Result<(), CacheError>;
}

pub fn product_key(guid: Uuid) -> String {
    format!("{PRODUCT_KEY_PREFIX}{}", guid.simple())
}

fn encode_product(product: &Product) -> Result<String, CacheError> {
    Ok(serde_json::to_string(product)?)
}

fn decode_product(json: &str) -> Result<Product, CacheError> {
    Ok(serde_json::from_str(json)?)
}

/// Redis-backed product cache. Values are JSON documents under
/// `product:<hex guid>`, written with `SET .. EX`.
#[derive(Clone)]
pub struct RedisProductCache {
    connection: ConnectionManager,
    ttl: Duration,
}

impl RedisProductCache {
    /// Accepts `redis://` and `rediss://` URLs.
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to Redis product cache");
        Ok(Self { connection, ttl })
    }

    fn ttl_seconds(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

#[async_trait]
impl ProductCache for RedisProductCache {
    async fn put(&self, guid: Uuid, product: &Product) -> Result<(), CacheError> {
        let value = encode_product(product)?;
        let mut connection = self.connection.clone();
        let _: () = connection
            .set_ex(product_key(guid), value, self.ttl_seconds())
            .await?;
        debug!("Cached product {}", guid);
        Ok(())
    }

    async fn get(&self, guid: Uuid) -> Result<Option<Product>, CacheError> {
        let mut connection = self.connection.clone();
        let cached: Option<String> = connection.get(product_key(guid)).await?;
        cached.as_deref().map(decode_product).transpose()
    }

    async fn delete(&self, guid: Uuid) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let _: i64 = connection.del(product_key(guid)).await?;
        debug!("Invalidated cached product {}", guid);
        Ok(())
    }
}

struct CacheEntry {
    product: Product,
    expires_at: Instant,
}

/// Process-local cache with the same key and expiry rules as
/// [`RedisProductCache`]. Expired entries are dropped lazily on read.
pub struct InMemoryProductCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl InMemoryProductCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_PRODUCT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryProductCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProductCache for InMemoryProductCache {
    async fn put(&self, guid: Uuid, product: &Product) -> Result<(), CacheError> {
        let entry = CacheEntry {
            product: product.clone(),
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().insert(product_key(guid), entry);
        Ok(())
    }

    async fn get(&self, guid: Uuid) -> Result<Option<Product>, CacheError> {
        let key = product_key(guid);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.product.clone())),
            Some(_) => {
                debug!("Cache entry {} expired", key);
                entries.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, guid: Uuid) -> Result<(), CacheError> {
        self.entries.lock().remove(&product_key(guid));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_use_hex_guid() {
        let guid = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(product_key(guid), "product:67e5504410b1426f9247bb680e5fe0c8");
    }

    #[test]
    fn cached_json_keeps_every_field() {
        let product = Product::new("Chair", "chair", 100, Some("oak".into()));
        let json = encode_product(&product).unwrap();
        assert!(json.contains("\"slug\":\"chair\""));
        assert_eq!(decode_product(&json).unwrap(), product);
    }

    #[test]
    fn corrupt_cached_value_is_an_error() {
        let err = decode_product("{\"guid\":").unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[tokio::test]
    async fn bad_redis_url_is_rejected() {
        let result = RedisProductCache::connect("not a url", DEFAULT_PRODUCT_TTL).await;
        assert!(matches!(result, Err(CacheError::Redis(_))));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryProductCache::with_ttl(Duration::from_millis(20));
        let product = Product::new("Chair", "chair", 100, None);
        cache.put(product.guid, &product).await.unwrap();
        assert_eq!(cache.get(product.guid).await.unwrap(), Some(product.clone()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(product.guid).await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = InMemoryProductCache::new();
        let product = Product::new("Lamp", "lamp", 100, None);
        cache.put(product.guid, &product).await.unwrap();
        cache.delete(product.guid).await.unwrap();
        assert_eq!(cache.get(product.guid).await.unwrap(), None);
    }
}
