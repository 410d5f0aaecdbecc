use async_trait::async_trait;
use catalog_models::{context::RequestContext, core::Product};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    errors::{RepositoryError, UowError},
    uow::UnitOfWork,
};

/// Product persistence bound to the connection of one unit of work.
#[async_trait]
pub trait ProductRepository: Send {
    async fn add(&mut self, product: &Product) -> Result<(), RepositoryError>;

    async fn get_by_guid(&mut self, guid: Uuid) -> Result<Option<Product>, RepositoryError>;

    async fn find_by_slug(&mut self, slug: &str) -> Result<Option<Product>, RepositoryError>;

    /// Keyset page of products created after `cursor`, newest first.
    async fn list_newer_than(
        &mut self,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Product>, RepositoryError>;

    /// Keyset page of products created before `cursor`, oldest first.
    async fn list_older_than(
        &mut self,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Product>, RepositoryError>;

    async fn update(&mut self, product: &Product) -> Result<(), RepositoryError>;

    async fn delete(&mut self, guid: Uuid) -> Result<(), RepositoryError>;
}

/// A single connection able to run one native transaction at a time and to
/// hand out repositories that execute on it.
#[async_trait]
pub trait UnitOfWorkConnection: Send {
    type Products<'a>: ProductRepository + 'a
    where
        Self: 'a;

    async fn begin(&mut self) -> Result<(), sqlx::Error>;

    async fn commit(&mut self) -> Result<(), sqlx::Error>;

    async fn rollback(&mut self) -> Result<(), sqlx::Error>;

    fn products(&mut self, context: &RequestContext) -> Self::Products<'_>;
}

/// Creates one unit of work per logical operation.
#[async_trait]
pub trait UnitOfWorkFactory: Send + Sync + 'static {
    type Connection: UnitOfWorkConnection + 'static;

    async fn create(
        &self,
        context: RequestContext,
    ) -> Result<UnitOfWork<Self::Connection>, UowError>;
}
