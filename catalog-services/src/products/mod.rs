mod add;
mod get;

pub use add::{AddProduct, AddProductRequest, AddProductResponse};
pub use get::{GetProduct, GetProductRequest, GetProductResponse};
