use catalog_database::errors::{RepositoryError, UowError};
use catalog_models::errors::RuntimeError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProductError {
    #[error("Product with guid={guid} not found")]
    NotFound { guid: Uuid },
    #[error("invalid product payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Uow(#[from] UowError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ProductError {
    pub fn code(&self) -> &'static str {
        match self {
            ProductError::NotFound { .. } => "404",
            ProductError::InvalidPayload(_) => "422",
            ProductError::Repository(RepositoryError::DuplicateSlug(_)) => "409",
            ProductError::Uow(_) | ProductError::Repository(_) => "500",
        }
    }
}

impl From<ProductError> for RuntimeError {
    fn from(err: ProductError) -> Self {
        RuntimeError::new(err.code(), err.to_string())
    }
}
