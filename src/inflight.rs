//! Durable per-anchor-message task records.

pub mod store;
pub mod types;

pub use store::InFlightStore;
pub use types::{InFlightTask, Reaction, StoreFile, TaskState};
