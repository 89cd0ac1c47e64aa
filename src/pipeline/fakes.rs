//! Recording collaborators for driver tests.
//!
//! Every call is appended to a shared log as a short line such as
//! `split GFP [0, 2]` or `segment GFP weights_GFP`. A call whose line equals
//! the armed failure fails instead of being recorded.

use crate::models::{ChamberflowError, Corners, Result};
use crate::strategy::{
    Analyzer, ChamberCutter, Collaborators, FrameSplitter, SegmentationRequest, Segmenter,
    SplitRequest, Tracker,
};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub const DETECTED_CORNERS: Corners = Corners([10, 20, 30, 40]);

#[derive(Default)]
pub struct Recorder {
    calls: RefCell<Vec<String>>,
    fail_on: RefCell<Option<String>>,
}

impl Recorder {
    pub fn fail_on(&self, call: &str) {
        *self.fail_on.borrow_mut() = Some(call.to_string());
    }

    pub fn heal(&self) {
        *self.fail_on.borrow_mut() = None;
    }

    /// Drain the log.
    pub fn take(&self) -> Vec<String> {
        self.calls.borrow_mut().drain(..).collect()
    }

    fn call(&self, line: String) -> Result<()> {
        if self.fail_on.borrow().as_deref() == Some(line.as_str()) {
            return Err(ChamberflowError::Internal(format!("{line} failed")));
        }
        self.calls.borrow_mut().push(line);
        Ok(())
    }
}

fn name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

struct FakeSplitter(Rc<Recorder>);

impl FrameSplitter for FakeSplitter {
    fn split(&self, request: &SplitRequest<'_>) -> Result<()> {
        let channel = request.output_dir.parent().map(name).unwrap_or_default();
        self.0.call(format!("split {channel} {:?}", request.frames))?;
        for frame in request.frames {
            fs::write(request.output_dir.join(format!("frame{frame:03}.png")), "")
                .map_err(|e| ChamberflowError::io("writing fake frame", e))?;
        }
        Ok(())
    }
}

struct FakeCutter(Rc<Recorder>);

impl ChamberCutter for FakeCutter {
    fn cut(&self, _channel_dirs: &[PathBuf], corners: Option<Corners>) -> Result<Corners> {
        match corners {
            Some(corners) => {
                self.0.call(format!("cut {corners}"))?;
                Ok(corners)
            }
            None => {
                self.0.call("cut detect".to_string())?;
                Ok(DETECTED_CORNERS)
            }
        }
    }
}

struct FakeSegmenter(Rc<Recorder>);

impl Segmenter for FakeSegmenter {
    fn weights_subdir(&self) -> Option<&str> {
        Some("model_weights_omni")
    }

    fn select_weights(&self, request: &SegmentationRequest<'_>) -> Result<String> {
        self.0.call(format!("select {}", request.channel))?;
        Ok(format!("weights_{}", request.channel))
    }

    fn segment(&self, request: &SegmentationRequest<'_>) -> Result<()> {
        self.0.call(format!(
            "segment {} {}",
            request.channel,
            request.network_name.unwrap_or("-")
        ))
    }
}

struct FakeTracker(Rc<Recorder>);

impl Tracker for FakeTracker {
    fn track(&self, channel_dir: &Path) -> Result<()> {
        self.0.call(format!("track {}", name(channel_dir)))
    }
}

struct FakeAnalyzer(Rc<Recorder>);

impl Analyzer for FakeAnalyzer {
    fn segmentation(&self, _seg_dir: &Path, result_dir: &Path) -> Result<()> {
        self.0.call(format!("analyze {}", name(result_dir)))
    }

    fn fluo_change(&self, _position_dir: &Path, _channels: &[String]) -> Result<()> {
        self.0.call("fluo_change".to_string())
    }

    fn tracking(&self, _position_dir: &Path, _channels: &[String], tracking_class: &str) -> Result<()> {
        self.0.call(format!("track_analysis {tracking_class}"))
    }
}

/// Collaborators registered under the default strategy names.
pub fn collaborators(recorder: &Rc<Recorder>) -> Collaborators {
    let mut collaborators = Collaborators::new(
        Box::new(FakeSplitter(Rc::clone(recorder))),
        Box::new(FakeAnalyzer(Rc::clone(recorder))),
        "model_weights",
    );
    collaborators
        .cutters
        .register("InteractiveCutout", Box::new(FakeCutter(Rc::clone(recorder))));
    collaborators
        .segmenters
        .register("OmniSegmentation", Box::new(FakeSegmenter(Rc::clone(recorder))));
    collaborators
        .trackers
        .register("DeltaV2Tracking", Box::new(FakeTracker(Rc::clone(recorder))));
    collaborators
}
