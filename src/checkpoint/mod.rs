//! Checkpoint module for resumable pipeline execution.
//!
//! Provides:
//! - `CheckpointStore`: durable record of completed (identifier, stage) units
//! - `StageGuard`: skip-or-run decision and commit-on-success for one stage

mod guard;
mod store;

pub use guard::*;
pub use store::*;
