use thiserror::Error;

#[derive(Debug, Error)]
pub enum UowError {
    #[error("nested transactions are not allowed")]
    NestedTransaction,
    #[error("unit of work is not inside a transaction")]
    Inactive,
    #[error("failed to acquire a pooled connection: {0}")]
    Acquire(#[source] sqlx::Error),
    #[error("failed to start database transaction: {0}")]
    Begin(#[source] sqlx::Error),
    #[error("transaction commit failed: {0}")]
    Commit(#[source] sqlx::Error),
    #[error("failed to rollback transaction: {0}")]
    Rollback(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("product with slug {0} already exists")]
    DuplicateSlug(String),
}
