//! Tool configuration: which external programs implement each strategy.
//!
//! Loaded from `tools.toml`. Strategy names are the same names that appear
//! in the run configuration (`CutImgClass`, `SegmentationClass`,
//! `TrackingClass`).

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Root directory holding the model weight folders
    #[serde(default = "default_model_weights_dir")]
    pub model_weights_dir: PathBuf,

    /// Frame splitter program
    pub splitter: ToolSpec,

    /// Chamber cutters by strategy name
    #[serde(default)]
    pub cutters: BTreeMap<String, ToolSpec>,

    /// Segmentation runners by strategy name
    #[serde(default)]
    pub segmenters: BTreeMap<String, SegmenterSpec>,

    /// Tracking runners by strategy name
    #[serde(default)]
    pub trackers: BTreeMap<String, ToolSpec>,

    /// Post-processing analyses
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

fn default_model_weights_dir() -> PathBuf {
    PathBuf::from("model_weights")
}

/// An external program and its fixed leading arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub command: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,
}

/// A segmentation program plus where its weights live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterSpec {
    pub command: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Folder under `model_weights_dir` searched during weight selection
    #[serde(default)]
    pub weights_subdir: Option<String>,
}

/// Optional analysis programs; a missing entry disables that analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub segmentation: Option<ToolSpec>,

    #[serde(default)]
    pub fluo_change: Option<ToolSpec>,

    #[serde(default)]
    pub tracking: Option<ToolSpec>,
}

impl ToolsConfig {
    /// Load tool configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ToolsRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ToolsParse {
            path: path.to_owned(),
            source: e,
        })
    }
}
