use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub guid: Uuid,
    pub name: String,
    pub slug: String,
    pub price_cents: i64,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn new(
        name: impl Into<String>,
        slug: impl Into<String>,
        price_cents: i64,
        description: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            guid: Uuid::new_v4(),
            name: name.into(),
            slug: slug.into(),
            price_cents,
            description,
            created_at: now,
            updated_at: now,
        }
    }
}
