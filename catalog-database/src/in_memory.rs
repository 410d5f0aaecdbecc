//! Process-local product store with commit/rollback semantics. A transaction
//! reads from a snapshot taken at `begin` and records its writes as a change
//! set; `commit` replays that change set onto the live map under its lock and
//! re-checks slug uniqueness. Used by the worker's `in-memory` database
//! backend and by tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use catalog_models::{context::RequestContext, core::Product};
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    errors::{RepositoryError, UowError},
    interfaces::{ProductRepository, UnitOfWorkConnection, UnitOfWorkFactory},
    uow::UnitOfWork,
};

#[derive(Debug, Default)]
pub struct TransactionStats {
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl TransactionStats {
    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FailureInjection {
    begin: AtomicBool,
    commit: AtomicBool,
    rollback: AtomicBool,
}

impl FailureInjection {
    fn take(flag: &AtomicBool, operation: &str) -> Result<(), sqlx::Error> {
        if flag.swap(false, Ordering::SeqCst) {
            return Err(sqlx::Error::Protocol(format!("injected {operation} failure")));
        }
        Ok(())
    }
}

#[derive(Default)]
struct StoreInner {
    products: Mutex<HashMap<Uuid, Product>>,
    stats: TransactionStats,
    failures: FailureInjection,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<StoreInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &TransactionStats {
        &self.inner.stats
    }

    /// Committed products, in no particular order.
    pub fn products(&self) -> Vec<Product> {
        self.inner.products.lock().values().cloned().collect()
    }

    pub fn fail_next_begin(&self) {
        self.inner.failures.begin.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_commit(&self) {
        self.inner.failures.commit.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_rollback(&self) {
        self.inner.failures.rollback.store(true, Ordering::SeqCst);
    }

    pub fn connect(&self) -> InMemoryConnection {
        InMemoryConnection {
            store: self.clone(),
            working: HashMap::new(),
            changes: Vec::new(),
        }
    }
}

/// One staged write, replayed against the live map at commit.
#[derive(Debug, Clone)]
enum Change {
    Insert(Product),
    Update(Product),
    Delete(Uuid),
}

fn slug_taken(products: &HashMap<Uuid, Product>, product: &Product) -> bool {
    products
        .values()
        .any(|existing| existing.guid != product.guid && existing.slug == product.slug)
}

/// Applies `changes` to a copy of `live` and swaps it in only if every change
/// fits; a conflicting change leaves `live` untouched.
fn apply_changes(
    live: &mut HashMap<Uuid, Product>,
    changes: Vec<Change>,
) -> Result<(), sqlx::Error> {
    let mut next = live.clone();
    for change in changes {
        match change {
            Change::Insert(product) => {
                if next.contains_key(&product.guid) || slug_taken(&next, &product) {
                    return Err(sqlx::Error::Protocol(format!(
                        "duplicate product slug {} on commit",
                        product.slug
                    )));
                }
                next.insert(product.guid, product);
            }
            Change::Update(product) => {
                if slug_taken(&next, &product) {
                    return Err(sqlx::Error::Protocol(format!(
                        "duplicate product slug {} on commit",
                        product.slug
                    )));
                }
                if let Some(existing) = next.get_mut(&product.guid) {
                    *existing = product;
                }
            }
            Change::Delete(guid) => {
                next.remove(&guid);
            }
        }
    }
    *live = next;
    Ok(())
}

/// Reads a private snapshot between `begin` and `commit`; writes are staged
/// and invisible to other connections until commit.
pub struct InMemoryConnection {
    store: InMemoryStore,
    working: HashMap<Uuid, Product>,
    changes: Vec<Change>,
}

#[async_trait]
impl UnitOfWorkConnection for InMemoryConnection {
    type Products<'a> = InMemoryProductRepository<'a>;

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        let inner = &self.store.inner;
        FailureInjection::take(&inner.failures.begin, "begin")?;
        inner.stats.begins.fetch_add(1, Ordering::SeqCst);
        self.working = inner.products.lock().clone();
        self.changes.clear();
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        let inner = &self.store.inner;
        inner.stats.commits.fetch_add(1, Ordering::SeqCst);
        FailureInjection::take(&inner.failures.commit, "commit")?;
        let changes = std::mem::take(&mut self.changes);
        self.working.clear();
        apply_changes(&mut inner.products.lock(), changes)
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        let inner = &self.store.inner;
        inner.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        FailureInjection::take(&inner.failures.rollback, "rollback")?;
        self.working.clear();
        self.changes.clear();
        Ok(())
    }

    fn products(&mut self, context: &RequestContext) -> InMemoryProductRepository<'_> {
        InMemoryProductRepository {
            products: &mut self.working,
            changes: &mut self.changes,
            context: *context,
        }
    }
}

pub struct InMemoryProductRepository<'a> {
    products: &'a mut HashMap<Uuid, Product>,
    changes: &'a mut Vec<Change>,
    context: RequestContext,
}

impl InMemoryProductRepository<'_> {
    fn sorted_by_created(&self) -> Vec<Product> {
        let mut products: Vec<Product> = self.products.values().cloned().collect();
        products.sort_by_key(|product| product.created_at);
        products
    }
}

#[async_trait]
impl ProductRepository for InMemoryProductRepository<'_> {
    async fn add(&mut self, product: &Product) -> Result<(), RepositoryError> {
        if self.products.values().any(|p| p.slug == product.slug) {
            return Err(RepositoryError::DuplicateSlug(product.slug.clone()));
        }
        debug!("[{}] Staging product {}", self.context, product.guid);
        self.products.insert(product.guid, product.clone());
        self.changes.push(Change::Insert(product.clone()));
        Ok(())
    }

    async fn get_by_guid(&mut self, guid: Uuid) -> Result<Option<Product>, RepositoryError> {
        Ok(self.products.get(&guid).cloned())
    }

    async fn find_by_slug(&mut self, slug: &str) -> Result<Option<Product>, RepositoryError> {
        Ok(self.products.values().find(|p| p.slug == slug).cloned())
    }

    async fn list_newer_than(
        &mut self,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Product>, RepositoryError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .sorted_by_created()
            .into_iter()
            .rev()
            .filter(|p| cursor.map_or(true, |c| p.created_at > c))
            .take(limit)
            .collect())
    }

    async fn list_older_than(
        &mut self,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Product>, RepositoryError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .sorted_by_created()
            .into_iter()
            .filter(|p| cursor.map_or(true, |c| p.created_at < c))
            .take(limit)
            .collect())
    }

    async fn update(&mut self, product: &Product) -> Result<(), RepositoryError> {
        if slug_taken(&*self.products, product) {
            return Err(RepositoryError::DuplicateSlug(product.slug.clone()));
        }
        if let Some(existing) = self.products.get_mut(&product.guid) {
            *existing = Product {
                updated_at: Utc::now(),
                ..product.clone()
            };
            self.changes.push(Change::Update(existing.clone()));
        }
        Ok(())
    }

    async fn delete(&mut self, guid: Uuid) -> Result<(), RepositoryError> {
        if self.products.remove(&guid).is_some() {
            self.changes.push(Change::Delete(guid));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryUnitOfWorkFactory {
    store: InMemoryStore,
}

impl InMemoryUnitOfWorkFactory {
    pub fn new(store: InMemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }
}

#[async_trait]
impl UnitOfWorkFactory for InMemoryUnitOfWorkFactory {
    type Connection = InMemoryConnection;

    async fn create(
        &self,
        context: RequestContext,
    ) -> Result<UnitOfWork<InMemoryConnection>, UowError> {
        Ok(UnitOfWork::new(self.store.connect(), context))
    }
}
