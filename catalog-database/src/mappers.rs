use catalog_models::core::Product;
use sqlx::{postgres::PgRow, Row};

pub fn row_to_product(row: &PgRow) -> Result<Product, sqlx::Error> {
    Ok(Product {
        guid: row.try_get("guid")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        price_cents: row.try_get("price_cents")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
