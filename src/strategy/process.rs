//! Collaborators backed by external programs.
//!
//! Every request is passed as command-line flags. Calls that return a value
//! (detected corners, selected weights) read it from the last non-empty line
//! of the program's stdout. A non-zero exit status is an error.

use super::{Analyzer, ChamberCutter, FrameSplitter, SegmentationRequest, Segmenter, SplitRequest, Tracker};
use crate::models::{AnalysisConfig, ChamberflowError, Corners, Result, SegmenterSpec, ToolSpec};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// One external program invocation.
#[derive(Debug, Clone)]
struct ProcessTool {
    command: PathBuf,
    args: Vec<String>,
}

impl ProcessTool {
    fn new(command: PathBuf, args: Vec<String>) -> Self {
        Self { command, args }
    }

    /// Run the program with `extra` appended to its fixed arguments; returns stdout.
    fn run(&self, extra: Vec<OsString>) -> Result<String> {
        debug!(command = %self.command.display(), args = ?extra, "Running external tool");

        let output = Command::new(&self.command)
            .args(&self.args)
            .args(&extra)
            .output()
            .map_err(|e| {
                ChamberflowError::io(format!("launching {}", self.command.display()), e)
            })?;

        if !output.status.success() {
            return Err(ChamberflowError::ExternalTool {
                tool: self.command.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run and return the last non-empty stdout line.
    fn run_for_value(&self, extra: Vec<OsString>) -> Result<String> {
        let stdout = self.run(extra)?;
        last_line(&stdout).ok_or_else(|| {
            ChamberflowError::ParseError(format!(
                "{} printed no result",
                self.command.display()
            ))
        })
    }
}

fn last_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(str::to_string)
}

fn flag(name: &str) -> OsString {
    OsString::from(name)
}

fn path_arg(path: &Path) -> OsString {
    path.as_os_str().to_owned()
}

fn join<T: ToString>(items: &[T]) -> OsString {
    OsString::from(
        items
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(","),
    )
}

pub struct ProcessSplitter {
    tool: ProcessTool,
}

impl ProcessSplitter {
    pub fn new(spec: ToolSpec) -> Self {
        Self {
            tool: ProcessTool::new(spec.command, spec.args),
        }
    }
}

impl FrameSplitter for ProcessSplitter {
    fn split(&self, request: &SplitRequest<'_>) -> Result<()> {
        self.tool.run(vec![
            flag("--path"),
            path_arg(request.source),
            flag("--save-dir"),
            path_arg(request.output_dir),
            flag("--frames"),
            join(request.frames),
            flag("--deconv"),
            OsString::from(request.deconvolution),
        ])?;
        Ok(())
    }
}

pub struct ProcessCutter {
    tool: ProcessTool,
}

impl ProcessCutter {
    pub fn new(spec: ToolSpec) -> Self {
        Self {
            tool: ProcessTool::new(spec.command, spec.args),
        }
    }
}

impl ChamberCutter for ProcessCutter {
    fn cut(&self, channel_dirs: &[PathBuf], corners: Option<Corners>) -> Result<Corners> {
        let mut args = vec![flag("--channel")];
        args.extend(channel_dirs.iter().map(|p| path_arg(p)));
        if let Some(corners) = corners {
            args.push(flag("--corners"));
            args.push(OsString::from(corners.to_string()));
            self.tool.run(args)?;
            return Ok(corners);
        }

        let value = self.tool.run_for_value(args)?;
        value
            .parse()
            .map_err(|e| ChamberflowError::ParseError(format!("cutter corners '{value}': {e}")))
    }
}

pub struct ProcessSegmenter {
    tool: ProcessTool,
    weights_subdir: Option<String>,
}

impl ProcessSegmenter {
    pub fn new(spec: SegmenterSpec) -> Self {
        Self {
            tool: ProcessTool::new(spec.command, spec.args),
            weights_subdir: spec.weights_subdir,
        }
    }

    fn request_args(request: &SegmentationRequest<'_>) -> Vec<OsString> {
        let mut args = vec![
            flag("--path-model-weights"),
            path_arg(request.weights_dir),
            flag("--path-pos"),
            path_arg(request.position_dir),
            flag("--path-channel"),
            OsString::from(request.channel),
            flag("--img-threshold"),
            OsString::from(request.img_threshold.to_string()),
        ];
        if request.postprocessing {
            args.push(flag("--postprocessing"));
        }
        if request.clean_border {
            args.push(flag("--clean-border"));
        }
        if let Some(network) = request.network_name {
            args.push(flag("--network-name"));
            args.push(OsString::from(network));
        }
        args
    }
}

impl Segmenter for ProcessSegmenter {
    fn weights_subdir(&self) -> Option<&str> {
        self.weights_subdir.as_deref()
    }

    fn select_weights(&self, request: &SegmentationRequest<'_>) -> Result<String> {
        let mut args = Self::request_args(request);
        args.push(flag("--just-select"));
        self.tool.run_for_value(args)
    }

    fn segment(&self, request: &SegmentationRequest<'_>) -> Result<()> {
        self.tool.run(Self::request_args(request))?;
        Ok(())
    }
}

pub struct ProcessTracker {
    tool: ProcessTool,
}

impl ProcessTracker {
    pub fn new(spec: ToolSpec) -> Self {
        Self {
            tool: ProcessTool::new(spec.command, spec.args),
        }
    }
}

impl Tracker for ProcessTracker {
    fn track(&self, channel_dir: &Path) -> Result<()> {
        self.tool.run(vec![flag("--path"), path_arg(channel_dir)])?;
        Ok(())
    }
}

/// Analyses run through optional programs; an unset program is a no-op.
pub struct ProcessAnalyzer {
    segmentation: Option<ProcessTool>,
    fluo_change: Option<ProcessTool>,
    tracking: Option<ProcessTool>,
}

impl ProcessAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        let tool = |spec: Option<ToolSpec>| spec.map(|s| ProcessTool::new(s.command, s.args));
        Self {
            segmentation: tool(config.segmentation),
            fluo_change: tool(config.fluo_change),
            tracking: tool(config.tracking),
        }
    }
}

impl Analyzer for ProcessAnalyzer {
    fn segmentation(&self, seg_dir: &Path, result_dir: &Path) -> Result<()> {
        let Some(tool) = &self.segmentation else {
            debug!("No segmentation analysis configured");
            return Ok(());
        };
        tool.run(vec![
            flag("--path-seg"),
            path_arg(seg_dir),
            flag("--path-result"),
            path_arg(result_dir),
        ])?;
        Ok(())
    }

    fn fluo_change(&self, position_dir: &Path, channels: &[String]) -> Result<()> {
        let Some(tool) = &self.fluo_change else {
            debug!("No fluorescence change analysis configured");
            return Ok(());
        };
        tool.run(vec![
            flag("--path"),
            path_arg(position_dir),
            flag("--channels"),
            join(channels),
        ])?;
        Ok(())
    }

    fn tracking(
        &self,
        position_dir: &Path,
        channels: &[String],
        tracking_class: &str,
    ) -> Result<()> {
        let Some(tool) = &self.tracking else {
            debug!("No tracking analysis configured");
            return Ok(());
        };
        tool.run(vec![
            flag("--path"),
            path_arg(position_dir),
            flag("--channels"),
            join(channels),
            flag("--tracking-class"),
            OsString::from(tracking_class),
        ])?;
        Ok(())
    }
}
