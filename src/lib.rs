//! chamberflow - Checkpointed stage engine for time-lapse microscopy chamber pipelines.
//!
//! ## Architecture
//!
//! Every imaging position (identifier) runs through a fixed sequence of
//! stages. Each stage is a guarded unit of work:
//! - **Checkpoint Store**: durable record of completed (identifier, stage) units
//! - **Stage Guard**: skips completed stages, commits on success, never on failure
//! - **Run Configuration**: `settings.ini`, read by stages and filled in with
//!   discovered values (corners, model weights) as they are found
//!
//! ## Pipeline
//!
//! - **Init pass**: Setup → Copy → test frames → corners → model selection
//! - **Full pass**: all frames → cutout → segmentation → tracking → cleanup
//!
//! Splitting, cutting, segmentation and tracking are external collaborators
//! resolved by strategy name (see [`strategy`]).

pub mod checkpoint;
pub mod models;
pub mod pipeline;
pub mod strategy;

// Re-exports for convenience
pub use checkpoint::{run_stage, CheckpointStore, GuardOptions, StageGuard};
pub use models::{
    ChamberflowError, ConfigError, Result, RunConfig, RunOption, Stage, StagePlan, StageRecord,
    ToolsConfig,
};
pub use pipeline::{discover_identifiers, PipelineDriver, RestartScope, RunOptions, RunSummary};
pub use strategy::Collaborators;
