use catalog_models::context::RequestContext;
use futures_util::future::BoxFuture;
use log::{debug, error, info, warn};

use crate::{errors::UowError, interfaces::UnitOfWorkConnection};

/// Transactional scope over one connection. Entered once and exited exactly
/// once; the repositories it hands out are only usable in between.
pub struct UnitOfWork<C> {
    connection: C,
    context: RequestContext,
    in_transaction: bool,
}

impl<C: UnitOfWorkConnection> UnitOfWork<C> {
    pub fn new(connection: C, context: RequestContext) -> Self {
        Self {
            connection,
            context,
            in_transaction: false,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub async fn enter(&mut self) -> Result<(), UowError> {
        if self.in_transaction {
            error!("[{}] Attempted to start nested transaction", self.context);
            return Err(UowError::NestedTransaction);
        }

        debug!("[{}] Starting database transaction", self.context);
        if let Err(err) = self.connection.begin().await {
            error!("[{}] Failed to start transaction: {}", self.context, err);
            return Err(UowError::Begin(err));
        }
        self.in_transaction = true;
        Ok(())
    }

    /// Ends the scope: rolls back when `failed`, commits otherwise. The
    /// transaction flag is cleared whatever the outcome.
    pub async fn exit(&mut self, failed: bool) -> Result<(), UowError> {
        if !self.in_transaction {
            warn!(
                "[{}] Transaction already closed (possible double exit)",
                self.context
            );
            return Ok(());
        }

        let outcome = if failed {
            warn!("[{}] Transaction failed, rolling back", self.context);
            self.rollback().await
        } else {
            self.commit().await
        };

        if let Err(err) = &outcome {
            error!(
                "[{}] Critical error during transaction cleanup: {}",
                self.context, err
            );
        }
        self.in_transaction = false;
        debug!("[{}] Transaction context exited", self.context);
        outcome
    }

    pub async fn commit(&mut self) -> Result<(), UowError> {
        if !self.in_transaction {
            warn!(
                "[{}] Attempted to commit outside of active transaction",
                self.context
            );
            return Ok(());
        }

        let result = self.connection.commit().await;
        self.in_transaction = false;
        match result {
            Ok(()) => {
                info!("[{}] Transaction committed", self.context);
                Ok(())
            }
            Err(err) => {
                error!("[{}] Failed to commit transaction: {}", self.context, err);
                Err(UowError::Commit(err))
            }
        }
    }

    pub async fn rollback(&mut self) -> Result<(), UowError> {
        if !self.in_transaction {
            warn!(
                "[{}] Attempted to rollback outside of active transaction",
                self.context
            );
            return Ok(());
        }

        let result = self.connection.rollback().await;
        self.in_transaction = false;
        match result {
            Ok(()) => {
                info!("[{}] Transaction rolled back", self.context);
                Ok(())
            }
            Err(err) => {
                error!("[{}] Failed to rollback transaction: {}", self.context, err);
                Err(UowError::Rollback(err))
            }
        }
    }

    pub fn products(&mut self) -> Result<C::Products<'_>, UowError> {
        if !self.in_transaction {
            return Err(UowError::Inactive);
        }
        Ok(self.connection.products(&self.context))
    }

    /// Runs `work` inside the scope: commit when it returns `Ok`, rollback when
    /// it returns `Err`. After a clean rollback the original error is returned.
    pub async fn transaction<F, R, E>(&mut self, work: F) -> Result<R, E>
    where
        F: for<'u> FnOnce(&'u mut UnitOfWork<C>) -> BoxFuture<'u, Result<R, E>> + Send,
        R: Send,
        E: From<UowError> + Send,
    {
        self.enter().await?;
        match work(&mut *self).await {
            Ok(value) => {
                self.exit(false).await?;
                Ok(value)
            }
            Err(err) => {
                self.exit(true).await?;
                Err(err)
            }
        }
    }
}
