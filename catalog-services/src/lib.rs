pub mod cache;
pub mod errors;
pub mod products;

pub use cache::{CacheError, ProductCache};
pub use errors::ProductError;

/// Topic carrying add-product commands.
pub const ADD_PRODUCT_TOPIC: &str = "products.add";
