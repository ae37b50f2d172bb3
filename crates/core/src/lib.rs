//! Domain model and device-local concerns for workspace sync.
//!
//! This crate has no network dependencies. The cloud side lives in
//! `workspace-sync-cloud`.

pub mod errors;
pub mod local_store;
pub mod sync;

pub use errors::{Result, StorageError};
