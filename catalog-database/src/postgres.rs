use std::{fs, path::PathBuf, str::FromStr, time::Duration};

use async_trait::async_trait;
use catalog_models::{context::RequestContext, core::Product, errors::SendableError};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use sqlx::{
    pool::PoolConnection,
    postgres::{PgConnectOptions, PgPoolOptions},
    ConnectOptions, PgConnection, PgPool, Postgres,
};
use uuid::Uuid;

use crate::{
    errors::{RepositoryError, UowError},
    interfaces::{ProductRepository, UnitOfWorkConnection, UnitOfWorkFactory},
    mappers,
    uow::UnitOfWork,
};

const POSTGRES_TABLE_INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    guid UUID PRIMARY KEY,
    name TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE,
    price_cents BIGINT NOT NULL,
    description TEXT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS products_created_at_idx ON products (created_at);
"#;

const PRODUCT_COLUMNS: &str =
    "guid, name, slug, price_cents, description, created_at, updated_at";

pub struct PostgresDb {
    pub pool: PgPool,
}

impl PostgresDb {
    pub async fn new(
        connection_str: &str,
        min_connections: u32,
        max_connections: u32,
    ) -> Result<Self, SendableError> {
        let options = PgConnectOptions::from_str(connection_str)?
            .log_statements(log::LevelFilter::Debug)
            .log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(1));

        let pool = PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        info!(
            "Database pool ready ({}..{} connections)",
            min_connections, max_connections
        );
        Ok(Self { pool })
    }

    pub fn unit_of_work_factory(&self) -> PgUnitOfWorkFactory {
        PgUnitOfWorkFactory {
            pool: self.pool.clone(),
        }
    }

    pub async fn run_init_scripts(&self, paths: &[String]) -> Result<(), SendableError> {
        info!("Running embedded Postgres table initialization script");
        self.execute_script(POSTGRES_TABLE_INIT_SQL).await?;
        for path in paths {
            let path_info = PathBuf::from(path);
            if path_info.extension().and_then(|ext| ext.to_str()) == Some("sql") {
                info!("Running {}", path_info.display());
                let script = fs::read_to_string(path_info.as_path())?;
                self.execute_script(&script).await?;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }

    async fn execute_script(&self, script: &str) -> Result<(), SendableError> {
        for statement in script.split(';') {
            let stmt = statement.trim();
            if stmt.is_empty() {
                continue;
            }
            let result = sqlx::query(stmt).execute(&self.pool).await?;
            debug!("Init scripts: {} row(s) affected", result.rows_affected());
        }
        Ok(())
    }
}

/// Pooled connection owned by one unit of work. If it is dropped while a
/// transaction is still open it is detached from the pool and closed, which
/// makes the server roll the transaction back.
pub struct PooledPgConnection {
    conn: Option<PoolConnection<Postgres>>,
    open: bool,
}

impl PooledPgConnection {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self {
            conn: Some(conn),
            open: false,
        }
    }

    fn connection(&mut self) -> Result<&mut PgConnection, sqlx::Error> {
        self.conn.as_deref_mut().ok_or(sqlx::Error::PoolClosed)
    }

    async fn execute(&mut self, sql: &'static str) -> Result<(), sqlx::Error> {
        let conn = self.connection()?;
        sqlx::query(sql).execute(conn).await?;
        Ok(())
    }
}

impl Drop for PooledPgConnection {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Some(conn) = self.conn.take() {
            warn!("Connection released inside an open transaction, closing it");
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl UnitOfWorkConnection for PooledPgConnection {
    type Products<'a> = PgProductRepository<'a>;

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        self.execute("BEGIN").await?;
        self.open = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        self.execute("COMMIT").await?;
        self.open = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        self.execute("ROLLBACK").await?;
        self.open = false;
        Ok(())
    }

    fn products(&mut self, context: &RequestContext) -> PgProductRepository<'_> {
        PgProductRepository {
            connection: self,
            context: *context,
        }
    }
}

#[derive(Clone)]
pub struct PgUnitOfWorkFactory {
    pool: PgPool,
}

impl PgUnitOfWorkFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UnitOfWorkFactory for PgUnitOfWorkFactory {
    type Connection = PooledPgConnection;

    async fn create(
        &self,
        context: RequestContext,
    ) -> Result<UnitOfWork<PooledPgConnection>, UowError> {
        let conn = self.pool.acquire().await.map_err(UowError::Acquire)?;
        debug!("[{}] Acquired pooled connection", context);
        Ok(UnitOfWork::new(PooledPgConnection::new(conn), context))
    }
}

pub struct PgProductRepository<'a> {
    connection: &'a mut PooledPgConnection,
    context: RequestContext,
}

impl PgProductRepository<'_> {
    async fn fetch_page(
        &mut self,
        sql: &str,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Product>, RepositoryError> {
        let conn = self.connection.connection()?;
        let rows = match cursor {
            Some(cursor) => {
                sqlx::query(sql)
                    .bind(cursor)
                    .bind(limit)
                    .fetch_all(conn)
                    .await?
            }
            None => sqlx::query(sql).bind(limit).fetch_all(conn).await?,
        };
        let products = rows
            .iter()
            .map(mappers::row_to_product)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(products)
    }
}

#[async_trait]
impl ProductRepository for PgProductRepository<'_> {
    async fn add(&mut self, product: &Product) -> Result<(), RepositoryError> {
        debug!("[{}] Inserting product {}", self.context, product.guid);
        let conn = self.connection.connection()?;
        sqlx::query(
            "INSERT INTO products (guid, name, slug, price_cents, description, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(product.guid)
        .bind(&product.name)
        .bind(&product.slug)
        .bind(product.price_cents)
        .bind(&product.description)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(conn)
        .await
        .map_err(|err| {
            let duplicate = err
                .as_database_error()
                .is_some_and(|db_err| db_err.is_unique_violation());
            if duplicate {
                RepositoryError::DuplicateSlug(product.slug.clone())
            } else {
                RepositoryError::Database(err)
            }
        })?;
        Ok(())
    }

    async fn get_by_guid(&mut self, guid: Uuid) -> Result<Option<Product>, RepositoryError> {
        let conn = self.connection.connection()?;
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE guid = $1"
        ))
        .bind(guid)
        .fetch_optional(conn)
        .await?;
        Ok(row.as_ref().map(mappers::row_to_product).transpose()?)
    }

    async fn find_by_slug(&mut self, slug: &str) -> Result<Option<Product>, RepositoryError> {
        let conn = self.connection.connection()?;
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE slug = $1"
        ))
        .bind(slug)
        .fetch_optional(conn)
        .await?;
        Ok(row.as_ref().map(mappers::row_to_product).transpose()?)
    }

    async fn list_newer_than(
        &mut self,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Product>, RepositoryError> {
        let sql = match cursor {
            Some(_) => format!(
                "SELECT {PRODUCT_COLUMNS} FROM products
                 WHERE created_at > $1 ORDER BY created_at DESC LIMIT $2"
            ),
            None => format!(
                "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY created_at DESC LIMIT $1"
            ),
        };
        self.fetch_page(&sql, cursor, limit).await
    }

    async fn list_older_than(
        &mut self,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Product>, RepositoryError> {
        let sql = match cursor {
            Some(_) => format!(
                "SELECT {PRODUCT_COLUMNS} FROM products
                 WHERE created_at < $1 ORDER BY created_at ASC LIMIT $2"
            ),
            None => format!(
                "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY created_at ASC LIMIT $1"
            ),
        };
        self.fetch_page(&sql, cursor, limit).await
    }

    async fn update(&mut self, product: &Product) -> Result<(), RepositoryError> {
        debug!("[{}] Updating product {}", self.context, product.guid);
        let conn = self.connection.connection()?;
        sqlx::query(
            "UPDATE products SET
                name = $2, slug = $3, price_cents = $4, description = $5, updated_at = $6
             WHERE guid = $1",
        )
        .bind(product.guid)
        .bind(&product.name)
        .bind(&product.slug)
        .bind(product.price_cents)
        .bind(&product.description)
        .bind(Utc::now())
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn delete(&mut self, guid: Uuid) -> Result<(), RepositoryError> {
        debug!("[{}] Deleting product {}", self.context, guid);
        let conn = self.connection.connection()?;
        sqlx::query("DELETE FROM products WHERE guid = $1")
            .bind(guid)
            .execute(conn)
            .await?;
        Ok(())
    }
}
