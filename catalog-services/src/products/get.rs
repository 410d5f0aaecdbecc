use std::sync::Arc;

use catalog_database::interfaces::{ProductRepository, UnitOfWorkFactory};
use catalog_models::{context::RequestContext, core::Product};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{cache::ProductCache, errors::ProductError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProductRequest {
    pub guid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetProductResponse {
    pub guid: Uuid,
    pub name: String,
    pub slug: String,
    pub price_cents: i64,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Product> for GetProductResponse {
    fn from(product: Product) -> Self {
        Self {
            guid: product.guid,
            name: product.name,
            slug: product.slug,
            price_cents: product.price_cents,
            description: product.description,
            created_at: product.created_at,
            updated_at: product.updated_at,
        }
    }
}

/// Reads one product, consulting the cache before the database. Cache
/// failures are logged and fall through to the database.
pub struct GetProduct<F> {
    factory: Arc<F>,
    cache: Arc<dyn ProductCache>,
}

impl<F: UnitOfWorkFactory> GetProduct<F> {
    pub fn new(factory: Arc<F>, cache: Arc<dyn ProductCache>) -> Self {
        Self { factory, cache }
    }

    pub async fn handle(
        &self,
        context: RequestContext,
        request: GetProductRequest,
    ) -> Result<GetProductResponse, ProductError> {
        match self.cache.get(request.guid).await {
            Ok(Some(product)) => {
                debug!("[{}] Cache hit for product {}", context, request.guid);
                return Ok(product.into());
            }
            Ok(None) => {}
            Err(err) => warn!(
                "[{}] Product cache read failed for {}: {}",
                context, request.guid, err
            ),
        }

        let mut uow = self.factory.create(context).await?;
        let guid = request.guid;
        let product = uow
            .transaction(move |uow| {
                async move {
                    let found = uow.products()?.get_by_guid(guid).await?;
                    found.ok_or(ProductError::NotFound { guid })
                }
                .boxed()
            })
            .await?;

        if let Err(err) = self.cache.put(product.guid, &product).await {
            warn!("[{}] Failed to cache product {}: {}", context, product.guid, err);
        }
        Ok(product.into())
    }
}
