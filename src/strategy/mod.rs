//! Strategy module - interfaces to the external collaborators.
//!
//! Provides:
//! - Capability traits (`FrameSplitter`, `ChamberCutter`, `Segmenter`, `Tracker`, `Analyzer`)
//! - `StrategyRegistry` / `Collaborators`: lookup by the names used in the run configuration
//! - Process-backed implementations driven by `tools.toml`

mod process;
mod registry;
mod traits;

pub use process::{ProcessAnalyzer, ProcessCutter, ProcessSegmenter, ProcessSplitter, ProcessTracker};
pub use registry::*;
pub use traits::*;
