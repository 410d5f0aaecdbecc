pub mod config;
pub mod worker;

pub use worker::{ConsumerWorker, MessageHandler, WorkerError, WorkerState};
