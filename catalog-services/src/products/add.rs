use std::sync::Arc;

use catalog_broker::BrokerMessage;
use catalog_database::interfaces::{ProductRepository, UnitOfWorkFactory};
use catalog_models::{context::RequestContext, core::Product, errors::SendableError};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{cache::ProductCache, errors::ProductError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddProductRequest {
    pub name: String,
    pub slug: String,
    pub price_cents: i64,
    #[serde(default)]
    pub description: Option<String>,
}

impl AddProductRequest {
    fn validate(&self) -> Result<(), ProductError> {
        if self.name.trim().is_empty() {
            return Err(ProductError::InvalidPayload("name must not be empty".into()));
        }
        if self.slug.trim().is_empty() {
            return Err(ProductError::InvalidPayload("slug must not be empty".into()));
        }
        if self.price_cents < 0 {
            return Err(ProductError::InvalidPayload(format!(
                "price_cents must not be negative, got {}",
                self.price_cents
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddProductResponse {
    pub guid: Uuid,
    pub name: String,
    pub slug: String,
    pub price_cents: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Product> for AddProductResponse {
    fn from(product: Product) -> Self {
        Self {
            guid: product.guid,
            name: product.name,
            slug: product.slug,
            price_cents: product.price_cents,
            created_at: product.created_at,
            updated_at: product.updated_at,
        }
    }
}

/// Persists a new product inside one unit of work, then writes it through to
/// the product cache.
pub struct AddProduct<F> {
    factory: Arc<F>,
    cache: Arc<dyn ProductCache>,
}

impl<F: UnitOfWorkFactory> AddProduct<F> {
    pub fn new(factory: Arc<F>, cache: Arc<dyn ProductCache>) -> Self {
        Self { factory, cache }
    }

    pub async fn handle(
        &self,
        context: RequestContext,
        request: AddProductRequest,
    ) -> Result<AddProductResponse, ProductError> {
        request.validate()?;
        let product = Product::new(
            request.name,
            request.slug,
            request.price_cents,
            request.description,
        );

        let mut uow = self.factory.create(context).await?;
        let staged = product.clone();
        uow.transaction(move |uow| {
            async move {
                uow.products()?.add(&staged).await?;
                Ok::<_, ProductError>(())
            }
            .boxed()
        })
        .await?;

        info!("[{}] Product {} added ({})", context, product.guid, product.slug);
        if let Err(err) = self.cache.put(product.guid, &product).await {
            warn!("[{}] Failed to cache product {}: {}", context, product.guid, err);
        }
        Ok(product.into())
    }

    /// Ingests one `products.add` delivery whose body is a JSON
    /// [`AddProductRequest`].
    pub async fn handle_message(
        &self,
        context: RequestContext,
        message: BrokerMessage,
    ) -> Result<(), SendableError> {
        let body = message
            .body
            .as_deref()
            .ok_or_else(|| ProductError::InvalidPayload("message has no body".into()))?;
        let request: AddProductRequest = serde_json::from_str(body)
            .map_err(|err| ProductError::InvalidPayload(err.to_string()))?;
        self.handle(context, request).await?;
        Ok(())
    }
}
