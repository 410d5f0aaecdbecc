use catalog_database::{
    errors::{RepositoryError, UowError},
    in_memory::{InMemoryStore, InMemoryUnitOfWorkFactory},
    interfaces::{ProductRepository, UnitOfWorkFactory},
};
use catalog_models::{context::RequestContext, core::Product};
use futures_util::FutureExt;

#[derive(Debug, thiserror::Error)]
enum TestError {
    #[error(transparent)]
    Uow(#[from] UowError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("business rule violated")]
    Rule,
}

fn factory() -> (InMemoryStore, InMemoryUnitOfWorkFactory) {
    let store = InMemoryStore::new();
    (store.clone(), InMemoryUnitOfWorkFactory::new(store))
}

#[tokio::test]
async fn nested_enter_fails_without_second_begin() {
    let (store, factory) = factory();
    let mut uow = factory.create(RequestContext::new()).await.unwrap();

    uow.enter().await.unwrap();
    let err = uow.enter().await.unwrap_err();

    assert!(matches!(err, UowError::NestedTransaction));
    assert_eq!(store.stats().begins(), 1);
    assert!(uow.in_transaction());
}

#[tokio::test]
async fn failing_work_rolls_back_and_returns_original_error() {
    let (store, factory) = factory();
    let mut uow = factory.create(RequestContext::new()).await.unwrap();

    let result: Result<(), TestError> = uow
        .transaction(|uow| {
            async move {
                uow.products()?
                    .add(&Product::new("Chair", "chair", 4_500, None))
                    .await?;
                Err(TestError::Rule)
            }
            .boxed()
        })
        .await;

    assert!(matches!(result, Err(TestError::Rule)));
    assert_eq!(store.stats().rollbacks(), 1);
    assert_eq!(store.stats().commits(), 0);
    assert!(store.products().is_empty());
    assert!(!uow.in_transaction());
}

#[tokio::test]
async fn successful_work_commits_once() {
    let (store, factory) = factory();
    let mut uow = factory.create(RequestContext::new()).await.unwrap();

    let guid = uow
        .transaction(|uow| {
            async move {
                let product = Product::new("Lamp", "lamp", 1_999, Some("brass".into()));
                uow.products()?.add(&product).await?;
                Ok::<_, TestError>(product.guid)
            }
            .boxed()
        })
        .await
        .unwrap();

    assert_eq!(store.stats().commits(), 1);
    assert_eq!(store.stats().rollbacks(), 0);
    assert_eq!(store.products()[0].guid, guid);
}

#[tokio::test]
async fn commit_failure_is_wrapped() {
    let (store, factory) = factory();
    store.fail_next_commit();
    let mut uow = factory.create(RequestContext::new()).await.unwrap();

    let result: Result<(), TestError> = uow
        .transaction(|_| async move { Ok(()) }.boxed())
        .await;

    assert!(matches!(result, Err(TestError::Uow(UowError::Commit(_)))));
    assert!(!uow.in_transaction());
}

#[tokio::test]
async fn rollback_failure_is_wrapped() {
    let (store, factory) = factory();
    store.fail_next_rollback();
    let mut uow = factory.create(RequestContext::new()).await.unwrap();

    let result: Result<(), TestError> = uow
        .transaction(|_| async move { Err(TestError::Rule) }.boxed())
        .await;

    assert!(matches!(result, Err(TestError::Uow(UowError::Rollback(_)))));
    assert!(!uow.in_transaction());
}

#[tokio::test]
async fn begin_failure_leaves_scope_inactive() {
    let (store, factory) = factory();
    store.fail_next_begin();
    let mut uow = factory.create(RequestContext::new()).await.unwrap();

    let err = uow.enter().await.unwrap_err();
    assert!(matches!(err, UowError::Begin(_)));
    assert!(!uow.in_transaction());
    assert_eq!(store.stats().begins(), 0);
}

#[tokio::test]
async fn explicit_commit_outside_transaction_is_noop() {
    let (store, factory) = factory();
    let mut uow = factory.create(RequestContext::new()).await.unwrap();

    uow.commit().await.unwrap();
    uow.rollback().await.unwrap();
    uow.exit(false).await.unwrap();

    assert_eq!(store.stats().commits(), 0);
    assert_eq!(store.stats().rollbacks(), 0);
}

#[tokio::test]
async fn repositories_require_active_transaction() {
    let (_, factory) = factory();
    let mut uow = factory.create(RequestContext::new()).await.unwrap();

    assert!(matches!(uow.products(), Err(UowError::Inactive)));

    uow.enter().await.unwrap();
    assert!(uow.products().is_ok());
    uow.exit(false).await.unwrap();
    assert!(matches!(uow.products(), Err(UowError::Inactive)));
}

#[tokio::test]
async fn explicit_commit_ends_scope() {
    let (store, factory) = factory();
    let mut uow = factory.create(RequestContext::new()).await.unwrap();

    uow.enter().await.unwrap();
    uow.products()
        .unwrap()
        .add(&Product::new("Desk", "desk", 25_000, None))
        .await
        .unwrap();
    uow.commit().await.unwrap();
    uow.exit(false).await.unwrap();

    assert_eq!(store.stats().commits(), 1);
    assert_eq!(store.products().len(), 1);
}
