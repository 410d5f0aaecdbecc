use std::sync::Arc;

use catalog_broker::{BrokerMessage, DeliveryTag};
use catalog_database::{
    errors::RepositoryError,
    in_memory::{InMemoryStore, InMemoryUnitOfWorkFactory},
};
use async_trait::async_trait;
use catalog_models::{context::RequestContext, core::Product};
use catalog_services::{
    ADD_PRODUCT_TOPIC, ProductError,
    cache::{CacheError, InMemoryProductCache, ProductCache},
    products::{AddProduct, AddProductRequest, GetProduct, GetProductRequest},
};
use uuid::Uuid;

/// Cache whose every call fails, standing in for an unreachable Redis.
struct UnavailableCache;

fn unavailable() -> CacheError {
    CacheError::Serialization(serde_json::from_str::<Product>("").unwrap_err())
}

#[async_trait]
impl ProductCache for UnavailableCache {
    async fn put(&self, _guid: Uuid, _product: &Product) -> Result<(), CacheError> {
        Err(unavailable())
    }

    async fn get(&self, _guid: Uuid) -> Result<Option<Product>, CacheError> {
        Err(unavailable())
    }

    async fn delete(&self, _guid: Uuid) -> Result<(), CacheError> {
        Err(unavailable())
    }
}

struct Fixture {
    store: InMemoryStore,
    add: AddProduct<InMemoryUnitOfWorkFactory>,
    get: GetProduct<InMemoryUnitOfWorkFactory>,
    cache: Arc<InMemoryProductCache>,
}

fn fixture() -> Fixture {
    let store = InMemoryStore::new();
    let factory = Arc::new(InMemoryUnitOfWorkFactory::new(store.clone()));
    let cache = Arc::new(InMemoryProductCache::new());
    Fixture {
        store,
        add: AddProduct::new(factory.clone(), cache.clone()),
        get: GetProduct::new(factory, cache.clone()),
        cache,
    }
}

fn request(slug: &str) -> AddProductRequest {
    AddProductRequest {
        name: "Oak chair".into(),
        slug: slug.into(),
        price_cents: 12_500,
        description: Some("solid oak".into()),
    }
}

fn message(body: Option<&str>) -> BrokerMessage {
    BrokerMessage {
        body: body.map(str::to_owned),
        routing_key: ADD_PRODUCT_TOPIC.to_owned(),
        delivery_tag: DeliveryTag {
            partition: 0,
            offset: 0,
        },
        raw: None,
    }
}

#[tokio::test]
async fn added_product_can_be_read_back() {
    let fx = fixture();
    let added = fx
        .add
        .handle(RequestContext::new(), request("oak-chair"))
        .await
        .unwrap();

    let fetched = fx
        .get
        .handle(RequestContext::new(), GetProductRequest { guid: added.guid })
        .await
        .unwrap();

    assert_eq!(fetched.slug, "oak-chair");
    assert_eq!(fetched.description.as_deref(), Some("solid oak"));
    // the read is served by the write-through cache entry
    assert_eq!(fx.store.stats().commits(), 1);
}

#[tokio::test]
async fn cache_miss_reads_the_database_and_fills_the_cache() {
    let fx = fixture();
    let added = fx
        .add
        .handle(RequestContext::new(), request("shelf"))
        .await
        .unwrap();
    fx.cache.delete(added.guid).await.unwrap();

    let fetched = fx
        .get
        .handle(RequestContext::new(), GetProductRequest { guid: added.guid })
        .await
        .unwrap();

    assert_eq!(fetched.slug, "shelf");
    assert_eq!(fx.store.stats().commits(), 2);
    assert!(fx.cache.get(added.guid).await.unwrap().is_some());
}

#[tokio::test]
async fn unavailable_cache_falls_back_to_the_database() {
    let store = InMemoryStore::new();
    let factory = Arc::new(InMemoryUnitOfWorkFactory::new(store.clone()));
    let cache: Arc<dyn ProductCache> = Arc::new(UnavailableCache);
    let add = AddProduct::new(factory.clone(), cache.clone());
    let get = GetProduct::new(factory, cache);

    let added = add
        .handle(RequestContext::new(), request("bench"))
        .await
        .unwrap();
    let fetched = get
        .handle(RequestContext::new(), GetProductRequest { guid: added.guid })
        .await
        .unwrap();

    assert_eq!(fetched.guid, added.guid);
    assert_eq!(store.stats().commits(), 2);
}

#[tokio::test]
async fn second_read_is_served_from_cache() {
    let fx = fixture();
    let added = fx
        .add
        .handle(RequestContext::new(), request("lamp"))
        .await
        .unwrap();
    let request = GetProductRequest { guid: added.guid };

    fx.get.handle(RequestContext::new(), request).await.unwrap();
    let begins = fx.store.stats().begins();
    fx.get.handle(RequestContext::new(), request).await.unwrap();

    assert_eq!(fx.store.stats().begins(), begins);
    assert!(fx.cache.get(added.guid).await.unwrap().is_some());
}

#[tokio::test]
async fn missing_product_is_not_found() {
    let fx = fixture();
    let guid = Uuid::new_v4();

    let err = fx
        .get
        .handle(RequestContext::new(), GetProductRequest { guid })
        .await
        .unwrap_err();

    assert!(matches!(err, ProductError::NotFound { guid: missing } if missing == guid));
    assert_eq!(err.code(), "404");
    assert_eq!(fx.store.stats().rollbacks(), 1);
}

#[tokio::test]
async fn duplicate_slug_rolls_back() {
    let fx = fixture();
    fx.add
        .handle(RequestContext::new(), request("desk"))
        .await
        .unwrap();

    let err = fx
        .add
        .handle(RequestContext::new(), request("desk"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProductError::Repository(RepositoryError::DuplicateSlug(_))
    ));
    assert_eq!(fx.store.products().len(), 1);
    assert_eq!(fx.store.stats().rollbacks(), 1);
}

#[tokio::test]
async fn invalid_request_never_opens_transaction() {
    let fx = fixture();
    let mut bad = request("free");
    bad.price_cents = -1;

    let err = fx.add.handle(RequestContext::new(), bad).await.unwrap_err();

    assert!(matches!(err, ProductError::InvalidPayload(_)));
    assert_eq!(fx.store.stats().begins(), 0);
}

#[tokio::test]
async fn add_message_is_ingested() {
    let fx = fixture();
    let body = r#"{"name":"Stool","slug":"stool","price_cents":3000}"#;

    fx.add
        .handle_message(RequestContext::new(), message(Some(body)))
        .await
        .unwrap();

    let products = fx.store.products();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].slug, "stool");
    assert_eq!(products[0].description, None);
}

#[tokio::test]
async fn malformed_or_empty_messages_fail() {
    let fx = fixture();

    assert!(
        fx.add
            .handle_message(RequestContext::new(), message(Some("{not json")))
            .await
            .is_err()
    );
    assert!(
        fx.add
            .handle_message(RequestContext::new(), message(None))
            .await
            .is_err()
    );
    assert!(fx.store.products().is_empty());
}
