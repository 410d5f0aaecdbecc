pub mod errors;
pub mod in_memory;
pub mod interfaces;
mod mappers;
pub mod postgres;
pub mod uow;

pub use errors::{RepositoryError, UowError};
pub use uow::UnitOfWork;
