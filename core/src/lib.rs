pub mod api;
pub mod cache;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod resource;
pub mod service;
pub mod sync;
pub mod trigger;
pub mod writer;

#[cfg(test)]
mod testing;

pub use api::{ApiRequest, Requester};
pub use db::{Database, Store};
pub use error::{RequestError, is_offline_error};
pub use service::StrideService;
pub use sync::{DrainOutcome, DrainReport, SyncPolicy};
