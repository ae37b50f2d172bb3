//! Sync domain models and device-local services.

mod device_identity;
mod sync_engine;
mod sync_scheduler;
mod workspace_state;
mod workspace_sync_model;

pub use device_identity::*;
pub use sync_engine::*;
pub use sync_scheduler::*;
pub use workspace_state::*;
pub use workspace_sync_model::*;
