//! Read-through / write-through orchestration across the three tiers.

mod filters;
pub mod keys;
mod orchestrator;
pub mod status;

pub use filters::{FieldFilter, FilterOp, Filters};
pub use orchestrator::{SyncOptions, SyncOrchestrator};
pub use status::{StatusTracker, SyncStatus};
