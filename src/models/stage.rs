//! Stage identity: the fixed vocabulary of checkpointable work.
//!
//! A stage name is one of a closed set; channel-qualified stages carry the
//! channel so that segmentation, tracking and cleanup checkpoint per channel.

use super::{ChamberflowError, ConfigError, Result, RunConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which parts of the pipeline run for an identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOption {
    /// Segmentation followed by tracking
    #[default]
    Both,
    /// Segmentation only
    Segmentation,
    /// Tracking of previously segmented images only
    Tracking,
}

impl RunOption {
    pub fn runs_segmentation(self) -> bool {
        matches!(self, Self::Both | Self::Segmentation)
    }

    pub fn runs_tracking(self) -> bool {
        matches!(self, Self::Both | Self::Tracking)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Both => "both",
            Self::Segmentation => "segmentation",
            Self::Tracking => "tracking",
        }
    }
}

impl FromStr for RunOption {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "both" => Ok(Self::Both),
            "segmentation" => Ok(Self::Segmentation),
            "tracking" => Ok(Self::Tracking),
            other => Err(format!(
                "'{other}' is not one of: both, segmentation, tracking"
            )),
        }
    }
}

impl fmt::Display for RunOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, checkpointable step of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Stage {
    SetupDirs,
    CopyFiles,
    SplitFramesInit,
    CutFramesInit,
    SegmentationInit,
    SplitFramesFull,
    CutFramesFull,
    SegmentationFull(String),
    Tracking(String),
    Cleanup(String),
}

impl Stage {
    /// Channel qualifier, if this stage runs per channel.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::SegmentationFull(c) | Self::Tracking(c) | Self::Cleanup(c) => Some(c),
            _ => None,
        }
    }

    /// Whether this stage belongs to the initialization pass.
    pub fn is_init(&self) -> bool {
        matches!(
            self,
            Self::SetupDirs
                | Self::CopyFiles
                | Self::SplitFramesInit
                | Self::CutFramesInit
                | Self::SegmentationInit
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetupDirs => f.write_str("SetupDirs"),
            Self::CopyFiles => f.write_str("CopyFiles"),
            Self::SplitFramesInit => f.write_str("SplitFramesInit"),
            Self::CutFramesInit => f.write_str("CutFramesInit"),
            Self::SegmentationInit => f.write_str("SegmentationInit"),
            Self::SplitFramesFull => f.write_str("SplitFramesFull"),
            Self::CutFramesFull => f.write_str("CutFramesFull"),
            Self::SegmentationFull(c) => write!(f, "SegmentationFull_{c}"),
            Self::Tracking(c) => write!(f, "Tracking_{c}"),
            Self::Cleanup(c) => write!(f, "Cleanup_{c}"),
        }
    }
}

impl FromStr for Stage {
    type Err = ChamberflowError;

    fn from_str(s: &str) -> Result<Self> {
        let stage = match s {
            "SetupDirs" => Self::SetupDirs,
            "CopyFiles" => Self::CopyFiles,
            "SplitFramesInit" => Self::SplitFramesInit,
            "CutFramesInit" => Self::CutFramesInit,
            "SegmentationInit" => Self::SegmentationInit,
            "SplitFramesFull" => Self::SplitFramesFull,
            "CutFramesFull" => Self::CutFramesFull,
            _ => {
                let qualified = [
                    ("SegmentationFull_", Self::SegmentationFull as fn(String) -> Self),
                    ("Tracking_", Self::Tracking),
                    ("Cleanup_", Self::Cleanup),
                ];
                qualified
                    .into_iter()
                    .find_map(|(prefix, make)| {
                        s.strip_prefix(prefix)
                            .filter(|channel| !channel.is_empty())
                            .map(|channel| make(channel.to_string()))
                    })
                    .ok_or_else(|| ChamberflowError::InvalidStage(s.to_string()))?
            }
        };
        Ok(stage)
    }
}

impl TryFrom<String> for Stage {
    type Error = ChamberflowError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        stage.to_string()
    }
}

/// One unit of checkpointable work: (identifier, stage[, channel]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageRecord {
    pub identifier: String,
    pub stage: Stage,
}

impl StageRecord {
    pub fn new(identifier: impl Into<String>, stage: Stage) -> Self {
        Self {
            identifier: identifier.into(),
            stage,
        }
    }
}

impl fmt::Display for StageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.identifier, self.stage)
    }
}

/// The fixed total order of stages for one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    /// Build the plan from the identifier's run option and channels.
    ///
    /// The first channel is the phase channel; it is segmented and tracked
    /// only when `phase_segmentation` is set, but always cleaned up.
    pub fn new(run_option: RunOption, channels: &[String], phase_segmentation: bool) -> Self {
        let mut stages = Vec::new();
        let segmented: Vec<&String> = channels
            .iter()
            .enumerate()
            .filter(|(num, _)| *num != 0 || phase_segmentation)
            .map(|(_, c)| c)
            .collect();

        if run_option.runs_segmentation() {
            stages.extend([
                Stage::SetupDirs,
                Stage::CopyFiles,
                Stage::SplitFramesInit,
                Stage::CutFramesInit,
                Stage::SegmentationInit,
                Stage::SplitFramesFull,
                Stage::CutFramesFull,
            ]);
            stages.extend(
                segmented
                    .iter()
                    .map(|c| Stage::SegmentationFull((*c).clone())),
            );
        }
        if run_option.runs_tracking() {
            stages.extend(segmented.iter().map(|c| Stage::Tracking((*c).clone())));
        }
        stages.extend(channels.iter().map(|c| Stage::Cleanup(c.clone())));

        Self { stages }
    }

    /// Build the plan for an identifier section of the run configuration.
    pub fn for_identifier(config: &RunConfig, identifier: &str) -> Result<Self> {
        Ok(Self::new(
            config.run_option(identifier)?,
            &config.get_list(identifier, "Channels")?,
            config.get_bool(identifier, "PhaseSegmentation")?,
        ))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn position(&self, stage: &Stage) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    /// The stage itself and every stage after it in the fixed order.
    ///
    /// A stage that is not part of the plan yields an empty slice.
    pub fn from_stage(&self, stage: &Stage) -> &[Stage] {
        match self.position(stage) {
            Some(idx) => &self.stages[idx..],
            None => &[],
        }
    }
}

/// Chamber cutout corners: four pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Corners(pub [i32; 4]);

impl Corners {
    /// Parse the configuration value; the literal `None` means "not yet known".
    pub fn from_config_value(value: &str) -> std::result::Result<Option<Self>, ConfigError> {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        value.parse().map(Some)
    }
}

impl FromStr for Corners {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            section: String::new(),
            key: "Corners".to_string(),
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let values = s
            .split(',')
            .map(|v| v.trim().parse::<i32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| invalid("expected comma separated integers"))?;
        let values: [i32; 4] = values
            .try_into()
            .map_err(|_| invalid("expected exactly four values"))?;
        Ok(Self(values))
    }
}

impl fmt::Display for Corners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a},{b},{c},{d}")
    }
}
