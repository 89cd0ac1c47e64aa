//! Strategy registry: strategy names from the run configuration mapped to
//! implementations.
//!
//! `CutImgClass`, `SegmentationClass` and `TrackingClass` are plain strings
//! in `settings.ini`; they are resolved here once per stage.

use super::process::{ProcessAnalyzer, ProcessCutter, ProcessSegmenter, ProcessSplitter, ProcessTracker};
use super::{Analyzer, ChamberCutter, FrameSplitter, Segmenter, Tracker};
use crate::models::{ChamberflowError, Result, RunConfig, ToolsConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Named implementations of one capability.
pub struct StrategyRegistry<T: ?Sized> {
    kind: &'static str,
    strategies: BTreeMap<String, Box<T>>,
}

impl<T: ?Sized> StrategyRegistry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            strategies: BTreeMap::new(),
        }
    }

    /// Register an implementation, replacing any previous one of that name.
    pub fn register(&mut self, name: impl Into<String>, strategy: Box<T>) {
        self.strategies.insert(name.into(), strategy);
    }

    /// Look up a strategy by name.
    pub fn get(&self, name: &str) -> Result<&T> {
        self.strategies
            .get(name)
            .map(|s| &**s)
            .ok_or_else(|| ChamberflowError::UnknownStrategy {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

/// Everything the pipeline calls out to.
pub struct Collaborators {
    pub splitter: Box<dyn FrameSplitter>,
    pub cutters: StrategyRegistry<dyn ChamberCutter>,
    pub segmenters: StrategyRegistry<dyn Segmenter>,
    pub trackers: StrategyRegistry<dyn Tracker>,
    pub analyzer: Box<dyn Analyzer>,
    /// Root directory of the model weight folders
    pub model_weights_dir: PathBuf,
}

impl Collaborators {
    /// Collaborators with empty registries; strategies are registered by the caller.
    pub fn new(
        splitter: Box<dyn FrameSplitter>,
        analyzer: Box<dyn Analyzer>,
        model_weights_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            splitter,
            cutters: StrategyRegistry::new("cutout"),
            segmenters: StrategyRegistry::new("segmentation"),
            trackers: StrategyRegistry::new("tracking"),
            analyzer,
            model_weights_dir: model_weights_dir.into(),
        }
    }

    /// Build process-backed collaborators from the tool configuration.
    pub fn from_tools(tools: &ToolsConfig) -> Self {
        let mut collaborators = Self::new(
            Box::new(ProcessSplitter::new(tools.splitter.clone())),
            Box::new(ProcessAnalyzer::new(tools.analysis.clone())),
            tools.model_weights_dir.clone(),
        );

        for (name, spec) in &tools.cutters {
            collaborators
                .cutters
                .register(name.clone(), Box::new(ProcessCutter::new(spec.clone())));
        }
        for (name, spec) in &tools.segmenters {
            collaborators
                .segmenters
                .register(name.clone(), Box::new(ProcessSegmenter::new(spec.clone())));
        }
        for (name, spec) in &tools.trackers {
            collaborators
                .trackers
                .register(name.clone(), Box::new(ProcessTracker::new(spec.clone())));
        }

        info!(
            cutters = collaborators.cutters.len(),
            segmenters = collaborators.segmenters.len(),
            trackers = collaborators.trackers.len(),
            "Registered strategies"
        );
        collaborators
    }

    /// Weights folder searched when selecting weights for `segmenter`.
    pub fn selection_weights_dir(&self, segmenter: &dyn Segmenter) -> PathBuf {
        match segmenter.weights_subdir() {
            Some(subdir) => self.model_weights_dir.join(subdir),
            None => self.model_weights_dir.clone(),
        }
    }

    pub fn model_weights_dir(&self) -> &Path {
        &self.model_weights_dir
    }

    /// Check that every strategy named by the run configuration is registered.
    ///
    /// Only strategies the identifier's run option actually uses are checked.
    pub fn validate(&self, config: &RunConfig) -> Result<()> {
        for identifier in config.identifiers()? {
            let run_option = config.run_option(&identifier)?;
            if run_option.runs_segmentation() {
                self.cutters.get(&config.get(&identifier, "CutImgClass")?)?;
                self.segmenters
                    .get(&config.get(&identifier, "SegmentationClass")?)?;
            }
            if run_option.runs_tracking() {
                self.trackers.get(&config.get(&identifier, "TrackingClass")?)?;
            }
        }
        Ok(())
    }
}
