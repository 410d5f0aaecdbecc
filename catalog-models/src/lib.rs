pub mod context;
pub mod core;
pub mod errors;
