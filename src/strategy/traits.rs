//! Capability interfaces the pipeline requires from its collaborators.
//!
//! The pipeline never looks inside these: splitting, cutting, segmentation
//! and tracking are black boxes that read and write files under the
//! identifier's directory tree.

use crate::models::{Corners, Result};
use std::path::{Path, PathBuf};

/// Extracts single frames from a multi-frame source file.
pub trait FrameSplitter {
    /// Write one image per requested frame into `output_dir`.
    ///
    /// Must overwrite existing frames so that re-running is safe.
    fn split(&self, request: &SplitRequest<'_>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SplitRequest<'a> {
    pub source: &'a Path,
    pub output_dir: &'a Path,
    pub frames: &'a [u32],
    pub deconvolution: &'a str,
}

/// Cuts the chamber region out of every frame of every channel.
pub trait ChamberCutter {
    /// With `corners == None` detect the corners, otherwise apply them.
    /// Returns the corners that were used.
    fn cut(&self, channel_dirs: &[PathBuf], corners: Option<Corners>) -> Result<Corners>;
}

#[derive(Debug, Clone)]
pub struct SegmentationRequest<'a> {
    pub weights_dir: &'a Path,
    pub position_dir: &'a Path,
    pub channel: &'a str,
    pub postprocessing: bool,
    pub clean_border: bool,
    pub network_name: Option<&'a str>,
    pub img_threshold: f64,
}

/// Runs a segmentation model over one channel.
pub trait Segmenter {
    /// Folder under the model-weights root searched during selection.
    fn weights_subdir(&self) -> Option<&str> {
        None
    }

    /// Choose model weights on the test frames; returns the weights name.
    fn select_weights(&self, request: &SegmentationRequest<'_>) -> Result<String>;

    /// Segment every cut frame of the channel.
    fn segment(&self, request: &SegmentationRequest<'_>) -> Result<()>;
}

/// Tracks segmented cells across frames of one channel.
pub trait Tracker {
    fn track(&self, channel_dir: &Path) -> Result<()>;
}

/// Post-processing that only consumes stage outputs.
pub trait Analyzer {
    fn segmentation(&self, seg_dir: &Path, result_dir: &Path) -> Result<()>;

    fn fluo_change(&self, position_dir: &Path, channels: &[String]) -> Result<()>;

    fn tracking(&self, position_dir: &Path, channels: &[String], tracking_class: &str)
        -> Result<()>;
}
