//! Pipeline driver: runs every identifier through its stage plan.
//!
//! Two passes over the identifiers:
//! 1. Init pass (segmentation runs only): directory setup, copying, test
//!    frames, corner detection and model selection. Discovered values are
//!    written to the run configuration and persisted immediately.
//! 2. Full pass: all frames, segmentation, tracking and cleanup.
//!
//! Every stage runs under a guard, so an interrupted run resumes at the
//! first stage without a checkpoint. Analyses run outside the guards and
//! are repeated on every invocation.

use super::layout::{PositionLayout, Retention, RAW_IM, SEG_IM};
use crate::checkpoint::{run_stage, CheckpointStore, GuardOptions, StageOutcome};
use crate::models::{
    ChamberflowError, ConfigError, Result, RunConfig, Stage, StagePlan, StageRecord,
};
use crate::strategy::{Collaborators, SegmentationRequest, SplitRequest};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Which stages are forced to re-run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RestartScope {
    /// Resume: completed stages are skipped
    #[default]
    None,
    /// Every stage of every identifier re-runs
    All,
    /// Re-run one identifier, either entirely or from one stage onwards
    Identifier {
        identifier: String,
        from: Option<Stage>,
    },
}

impl RestartScope {
    /// Whether the guard of `stage` must bypass its checkpoint.
    ///
    /// Forcing a single stage is enough for `from`: its guard clears the
    /// checkpoints of every later stage.
    pub fn forces(&self, identifier: &str, stage: &Stage) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Identifier {
                identifier: id,
                from,
            } => id == identifier && from.as_ref().map_or(true, |from| from == stage),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub restart: RestartScope,
    /// Stop after the init pass, keeping only the filled-in configuration
    pub config_only: bool,
    pub show_progress: bool,
}

/// What a run did.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub executed: Vec<StageRecord>,
    pub skipped: Vec<StageRecord>,
    pub config_only: bool,
}

/// Mutable state threaded through one run.
struct RunState<'a> {
    config: &'a mut RunConfig,
    store: &'a mut CheckpointStore,
    summary: RunSummary,
}

/// Per-identifier values that do not change during a run.
struct StageContext<'a> {
    identifier: &'a str,
    plan: StagePlan,
    layout: PositionLayout,
    file_type: String,
    channels: Vec<String>,
    /// Channels that are segmented and tracked; the phase channel only with
    /// `PhaseSegmentation`
    segmented: Vec<String>,
}

impl<'a> StageContext<'a> {
    fn new(config: &RunConfig, identifier: &'a str) -> Result<Self> {
        let channels = config.get_list(identifier, "Channels")?;
        if channels.is_empty() || channels.iter().any(|c| c == "None") {
            return Err(ConfigError::InvalidValue {
                section: identifier.to_string(),
                key: "Channels".to_string(),
                value: channels.join(","),
                reason: "no channels configured".to_string(),
            }
            .into());
        }
        let phase_segmentation = config.get_bool(identifier, "PhaseSegmentation")?;
        let segmented = channels
            .iter()
            .enumerate()
            .filter(|(num, _)| *num != 0 || phase_segmentation)
            .map(|(_, c)| c.clone())
            .collect();

        Ok(Self {
            identifier,
            plan: StagePlan::for_identifier(config, identifier)?,
            layout: PositionLayout::new(&config.folder_path()?, identifier),
            file_type: config.file_type()?,
            channels,
            segmented,
        })
    }

    fn raw_dirs(&self) -> Vec<PathBuf> {
        self.channels
            .iter()
            .map(|c| self.layout.folder(c, RAW_IM))
            .collect()
    }
}

/// Runs the staged pipeline over all identifiers of a run configuration.
pub struct PipelineDriver {
    collaborators: Collaborators,
    options: RunOptions,
}

impl PipelineDriver {
    pub fn new(collaborators: Collaborators, options: RunOptions) -> Self {
        Self {
            collaborators,
            options,
        }
    }

    /// Run (or resume) the pipeline.
    ///
    /// The first error aborts the run; all stages committed before it stay
    /// committed.
    pub fn run(&self, config: &mut RunConfig, store: &mut CheckpointStore) -> Result<RunSummary> {
        let start = Instant::now();
        self.collaborators.validate(config)?;
        let identifiers = config.identifiers()?;
        self.check_restart(config, &identifiers)?;

        info!(
            identifiers = identifiers.len(),
            config_only = self.options.config_only,
            "Starting pipeline"
        );

        let passes = if self.options.config_only { 1 } else { 2 };
        let pb = self.progress_bar(identifiers.len() * passes)?;
        let mut state = RunState {
            config,
            store,
            summary: RunSummary::default(),
        };

        for identifier in &identifiers {
            if state.store.drifted(identifier, state.config) {
                warn!(identifier = %identifier, "Settings changed since the last run, starting the identifier over");
                state.store.clear(identifier)?;
            }
        }

        let mut initialized = Vec::new();
        for identifier in &identifiers {
            pb.set_message(format!("{identifier}: init"));
            if state.config.run_option(identifier)?.runs_segmentation() {
                let ctx = StageContext::new(state.config, identifier)?;
                self.init_pass(&mut state, &ctx)?;
                initialized.push(identifier.as_str());
            }
            pb.inc(1);
        }

        if self.options.config_only {
            pb.finish_and_clear();
            self.finish_config_only(&mut state, &initialized)?;
            state.summary.config_only = true;
            return Ok(state.summary);
        }

        for identifier in &identifiers {
            pb.set_message(format!("{identifier}: full"));
            let ctx = StageContext::new(state.config, identifier)?;
            self.full_pass(&mut state, &ctx)?;
            pb.inc(1);
        }
        pb.finish_with_message("done");

        info!(
            executed = state.summary.executed.len(),
            skipped = state.summary.skipped.len(),
            elapsed_secs = start.elapsed().as_secs(),
            "Pipeline finished"
        );
        Ok(state.summary)
    }

    /// A forced restart must name a configured identifier and, if given, a
    /// stage of that identifier's plan.
    fn check_restart(&self, config: &RunConfig, identifiers: &[String]) -> Result<()> {
        let RestartScope::Identifier { identifier, from } = &self.options.restart else {
            return Ok(());
        };
        if !identifiers.contains(identifier) {
            return Err(ChamberflowError::InvalidRestart(format!(
                "identifier {identifier} is not configured"
            )));
        }
        if let Some(stage) = from {
            if StagePlan::for_identifier(config, identifier)?.position(stage).is_none() {
                return Err(ChamberflowError::InvalidRestart(format!(
                    "stage {stage} is not part of the plan of {identifier}"
                )));
            }
        }
        Ok(())
    }

    fn progress_bar(&self, len: usize) -> Result<ProgressBar> {
        if !self.options.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .map_err(|e| ChamberflowError::Internal(format!("Progress bar template: {e}")))?
                .progress_chars("##-"),
        );
        Ok(pb)
    }

    /// Run one stage under its guard and record the outcome.
    fn stage<F>(
        &self,
        state: &mut RunState<'_>,
        ctx: &StageContext<'_>,
        stage: Stage,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut RunConfig) -> Result<()>,
    {
        let record = StageRecord::new(ctx.identifier, stage);
        let options = GuardOptions {
            restart: self.options.restart.forces(ctx.identifier, &record.stage),
            // the tree does not exist before SetupDirs
            copy_path: (record.stage != Stage::SetupDirs).then(|| ctx.layout.root().to_path_buf()),
        };

        let outcome = run_stage(
            &mut *state.store,
            &mut *state.config,
            &ctx.plan,
            record.clone(),
            options,
            body,
        )?;
        match outcome {
            StageOutcome::Completed => state.summary.executed.push(record),
            StageOutcome::Skipped => state.summary.skipped.push(record),
        }
        Ok(())
    }

    fn init_pass(&self, state: &mut RunState<'_>, ctx: &StageContext<'_>) -> Result<()> {
        let id = ctx.identifier;

        self.stage(state, ctx, Stage::SetupDirs, |_| {
            info!(identifier = id, "Generating folder structure");
            ctx.layout.recreate(&ctx.channels)
        })?;

        self.stage(state, ctx, Stage::CopyFiles, |_| {
            info!(identifier = id, "Copying files");
            let copied = ctx.layout.copy_sources(&ctx.file_type, &ctx.channels)?;
            if copied == 0 {
                warn!(identifier = id, file_type = %ctx.file_type, "No source files matched");
            }
            Ok(())
        })?;

        self.stage(state, ctx, Stage::SplitFramesInit, |config| {
            info!(identifier = id, "Splitting test frames");
            let (start, end) = frame_range(config, id)?;
            self.split_channels(ctx, config, &init_frames(start, end))
        })?;

        self.stage(state, ctx, Stage::CutFramesInit, |config| {
            info!(identifier = id, "Cutting test frames");
            let corners = config.corners(id)?;
            let cutter = self.collaborators.cutters.get(&config.get(id, "CutImgClass")?)?;
            let used = cutter.cut(&ctx.raw_dirs(), corners)?;

            if corners.is_none() {
                info!(identifier = id, corners = %used, "Saving detected corners");
                config.set(id, "Corners", used.to_string());
                config.to_file(None, true)?;
            }
            Ok(())
        })?;

        self.stage(state, ctx, Stage::SegmentationInit, |config| {
            info!(identifier = id, "Segmenting test frames");
            let segmenter = self
                .collaborators
                .segmenters
                .get(&config.get(id, "SegmentationClass")?)?;
            let weights_dir = self.collaborators.selection_weights_dir(segmenter);

            for channel in &ctx.segmented {
                let key = format!("ModelWeights_{channel}");
                let current = config.get_opt(id, &key).map(str::to_string);
                let selected = segmenter.select_weights(&SegmentationRequest {
                    weights_dir: &weights_dir,
                    position_dir: ctx.layout.root(),
                    channel,
                    postprocessing: true,
                    clean_border: config.get_bool(id, "RemoveBorder")?,
                    network_name: current.as_deref(),
                    img_threshold: config.get_float(id, "ImgThreshold")?,
                })?;

                if current.is_none() {
                    info!(identifier = id, channel = %channel, weights = %selected, "Saving selected model weights");
                    config.set(id, &key, selected);
                    config.to_file(None, true)?;
                }
            }
            Ok(())
        })
    }

    fn full_pass(&self, state: &mut RunState<'_>, ctx: &StageContext<'_>) -> Result<()> {
        let id = ctx.identifier;
        let run_option = state.config.run_option(id)?;
        let fluo_change = state.config.get_bool(id, "FluoChange")?;

        if run_option.runs_segmentation() {
            self.stage(state, ctx, Stage::SplitFramesFull, |config| {
                info!(identifier = id, "Splitting all frames");
                let (start, end) = frame_range(config, id)?;
                let frames: Vec<u32> = (start..end).collect();
                self.split_channels(ctx, config, &frames)
            })?;

            self.stage(state, ctx, Stage::CutFramesFull, |config| {
                info!(identifier = id, "Cutting all frames");
                let corners = config
                    .corners(id)?
                    .ok_or_else(|| ChamberflowError::MissingCorners(id.to_string()))?;
                let cutter = self.collaborators.cutters.get(&config.get(id, "CutImgClass")?)?;
                cutter.cut(&ctx.raw_dirs(), Some(corners))?;
                Ok(())
            })?;

            for channel in &ctx.segmented {
                self.stage(state, ctx, Stage::SegmentationFull(channel.clone()), |config| {
                    info!(identifier = id, channel = %channel, "Segmenting all frames");
                    let weights = config.get(id, &format!("ModelWeights_{channel}"))?;
                    let segmenter = self
                        .collaborators
                        .segmenters
                        .get(&config.get(id, "SegmentationClass")?)?;
                    segmenter.segment(&SegmentationRequest {
                        weights_dir: self.collaborators.model_weights_dir(),
                        position_dir: ctx.layout.root(),
                        channel,
                        postprocessing: true,
                        clean_border: config.get_bool(id, "RemoveBorder")?,
                        network_name: Some(weights.as_str()),
                        img_threshold: config.get_float(id, "ImgThreshold")?,
                    })?;

                    self.collaborators.analyzer.segmentation(
                        &ctx.layout.folder(channel, SEG_IM),
                        &ctx.layout.channel_dir(channel),
                    )
                })?;
            }

            if fluo_change && !run_option.runs_tracking() {
                info!(identifier = id, "Fluorescence change analysis on segmentations");
                self.collaborators
                    .analyzer
                    .fluo_change(ctx.layout.root(), &ctx.channels)?;
            }
        }

        if run_option.runs_tracking() {
            let tracking_class = state.config.get(id, "TrackingClass")?;
            let tracker = self.collaborators.trackers.get(&tracking_class)?;

            for channel in &ctx.segmented {
                self.stage(state, ctx, Stage::Tracking(channel.clone()), |_| {
                    info!(identifier = id, channel = %channel, "Tracking cells");
                    tracker.track(&ctx.layout.channel_dir(channel))
                })?;
            }

            if fluo_change {
                info!(identifier = id, "Tracking analysis");
                self.collaborators
                    .analyzer
                    .tracking(ctx.layout.root(), &ctx.channels, &tracking_class)?;
            }
        }

        for channel in &ctx.channels {
            self.stage(state, ctx, Stage::Cleanup(channel.clone()), |config| {
                info!(identifier = id, channel = %channel, "Cleaning up");
                let keep = Retention::from_config(config, id)?;
                ctx.layout.cleanup_channel(channel, &ctx.file_type, keep)
            })?;
        }

        if ctx.layout.root().is_dir() {
            info!(identifier = id, "Finished identifier, copying settings");
            state.config.to_file(Some(ctx.layout.root()), true)?;
        } else {
            debug!(identifier = id, "No identifier directory, settings copy skipped");
        }
        Ok(())
    }

    /// Split `frames` out of every channel's source file.
    fn split_channels(&self, ctx: &StageContext<'_>, config: &RunConfig, frames: &[u32]) -> Result<()> {
        let deconvolution = config.get(ctx.identifier, "Deconvolution")?;
        for channel in &ctx.channels {
            let source = ctx.layout.source_file(channel, &ctx.file_type)?;
            let output_dir = ctx.layout.folder(channel, RAW_IM);
            debug!(channel = %channel, frames = frames.len(), "Splitting");
            self.collaborators.splitter.split(&SplitRequest {
                source: &source,
                output_dir: &output_dir,
                frames,
                deconvolution: &deconvolution,
            })?;
        }
        Ok(())
    }

    /// Persist the filled-in configuration and drop the temporary trees.
    ///
    /// The checkpoints of the removed trees are cleared too, otherwise a
    /// later full run would skip stages whose output is gone.
    fn finish_config_only(&self, state: &mut RunState<'_>, initialized: &[&str]) -> Result<()> {
        let path = state.config.to_file(None, true)?;
        info!(path = %path.display(), "Configuration written");

        let base = state.config.folder_path()?;
        for identifier in initialized {
            let layout = PositionLayout::new(&base, identifier);
            info!(path = %layout.root().display(), "Deleting temporary data");
            layout.remove()?;
            state.store.clear(identifier)?;
        }
        info!("Finished configuration setup");
        Ok(())
    }
}

/// `StartFrame` and `EndFrame` of an identifier; the end is exclusive.
fn frame_range(config: &RunConfig, identifier: &str) -> Result<(u32, u32)> {
    let frame = |key: &str| -> Result<u32> {
        let value = config.get_int(identifier, key)?;
        u32::try_from(value).map_err(|_| {
            ConfigError::InvalidValue {
                section: identifier.to_string(),
                key: key.to_string(),
                value: value.to_string(),
                reason: "frame numbers cannot be negative".to_string(),
            }
            .into()
        })
    };
    let (start, end) = (frame("StartFrame")?, frame("EndFrame")?);
    if end <= start {
        return Err(ConfigError::InvalidValue {
            section: identifier.to_string(),
            key: "EndFrame".to_string(),
            value: end.to_string(),
            reason: format!("must be greater than StartFrame ({start})"),
        }
        .into());
    }
    Ok((start, end))
}

/// Test frames: the first frame and the middle of the range.
fn init_frames(start: u32, end: u32) -> Vec<u32> {
    let mid = start + (end - start) / 2;
    if mid == start {
        vec![start]
    } else {
        vec![start, mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GeneralSettings;
    use crate::pipeline::fakes::{self, Recorder, DETECTED_CORNERS};
    use crate::pipeline::{CUT_IM, RAW_IM, TRACK_OUTPUT};
    use std::fs;
    use std::path::Path;
    use std::rc::Rc;
    use tempfile::TempDir;

    const FULL_RUN: [&str; 10] = [
        "split Phase [0, 2]",
        "split GFP [0, 2]",
        "cut detect",
        "select GFP",
        "split Phase [0, 1, 2, 3]",
        "split GFP [0, 1, 2, 3]",
        "cut 10,20,30,40",
        "segment GFP weights_GFP",
        "analyze GFP",
        "track GFP",
    ];

    /// Dataset with one source file per channel and a persisted configuration.
    fn setup(dir: &Path, configure: impl FnOnce(&mut RunConfig)) -> (RunConfig, CheckpointStore) {
        setup_positions(dir, &["Pos1"], configure)
    }

    fn setup_positions(
        dir: &Path,
        identifiers: &[&str],
        configure: impl FnOnce(&mut RunConfig),
    ) -> (RunConfig, CheckpointStore) {
        for id in identifiers {
            for channel in ["Phase", "GFP"] {
                fs::write(dir.join(format!("exp_{id}_{channel}.tif")), channel).unwrap();
            }
        }
        let mut config = RunConfig::new(
            dir.join("settings.ini"),
            &GeneralSettings {
                data_type: "Family_Machine".to_string(),
                folder_path: dir.to_path_buf(),
                file_type: "tif".to_string(),
                identifier_name: "Pos".to_string(),
                identifiers: identifiers.iter().map(|id| id.to_string()).collect(),
            },
        );
        for id in identifiers {
            config.set_id_section(id);
            config.set(id, "Channels", "Phase,GFP");
            config.set(id, "EndFrame", "4");
        }
        configure(&mut config);
        config.to_file(None, true).unwrap();

        let store = CheckpointStore::open(&dir.join("checkpoints")).unwrap();
        (config, store)
    }

    fn driver(recorder: &Rc<Recorder>, restart: RestartScope) -> PipelineDriver {
        PipelineDriver::new(
            fakes::collaborators(recorder),
            RunOptions {
                restart,
                ..Default::default()
            },
        )
    }

    fn stage_names(records: &[StageRecord]) -> Vec<String> {
        records.iter().map(|r| r.stage.to_string()).collect()
    }

    fn reopen(dir: &Path) -> (RunConfig, CheckpointStore) {
        (
            RunConfig::load(&dir.join("settings.ini")).unwrap(),
            CheckpointStore::open(&dir.join("checkpoints")).unwrap(),
        )
    }

    #[test]
    fn test_full_run_executes_plan_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |_| {});
        let recorder = Rc::new(Recorder::default());

        let summary = driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();

        let plan = StagePlan::for_identifier(&config, "Pos1").unwrap();
        let planned: Vec<String> = plan.stages().iter().map(ToString::to_string).collect();
        assert_eq!(stage_names(&summary.executed), planned);
        assert!(summary.skipped.is_empty());
        assert_eq!(recorder.take(), FULL_RUN);

        let saved = RunConfig::load(&temp_dir.path().join("settings.ini")).unwrap();
        assert_eq!(saved.corners("Pos1").unwrap(), Some(DETECTED_CORNERS));
        assert_eq!(saved.get("Pos1", "ModelWeights_GFP").unwrap(), "weights_GFP");
        assert!(saved.get_opt("Pos1", "ModelWeights_Phase").is_none());

        let pos1 = temp_dir.path().join("Pos1");
        assert!(pos1.join("settings.ini").exists());
        assert!(pos1.join("GFP").join("exp_Pos1_GFP.tif").exists());
        assert!(!pos1.join("GFP").join(RAW_IM).exists());
        assert!(pos1.join("GFP").join(CUT_IM).exists());
    }

    #[test]
    fn test_second_run_skips_everything() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |_| {});
        let recorder = Rc::new(Recorder::default());
        driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();
        recorder.take();

        let (mut config, mut store) = reopen(temp_dir.path());
        let summary = driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();

        assert!(summary.executed.is_empty());
        assert_eq!(summary.skipped.len(), 11);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_resume_runs_only_unfinished_stages() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |_| {});
        let recorder = Rc::new(Recorder::default());
        recorder.fail_on("segment GFP weights_GFP");

        let result = driver(&recorder, RestartScope::None).run(&mut config, &mut store);
        assert!(matches!(result, Err(ChamberflowError::Internal(_))));
        recorder.take();

        let (mut config, mut store) = reopen(temp_dir.path());
        assert!(store.has(&StageRecord::new("Pos1", Stage::CutFramesFull), &config));
        assert!(!store.has(
            &StageRecord::new("Pos1", Stage::SegmentationFull("GFP".to_string())),
            &config
        ));

        recorder.heal();
        driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();
        assert_eq!(
            recorder.take(),
            ["segment GFP weights_GFP", "analyze GFP", "track GFP"]
        );
    }

    #[test]
    fn test_detected_corners_survive_a_crash() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |_| {});
        let recorder = Rc::new(Recorder::default());
        recorder.fail_on("select GFP");

        assert!(driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .is_err());
        recorder.take();

        let (mut config, mut store) = reopen(temp_dir.path());
        assert_eq!(config.corners("Pos1").unwrap(), Some(DETECTED_CORNERS));

        recorder.heal();
        driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();
        let calls = recorder.take();
        assert_eq!(calls[0], "select GFP");
        assert!(!calls.iter().any(|c| c == "cut detect"));
        assert!(calls.iter().any(|c| c == "cut 10,20,30,40"));
    }

    #[test]
    fn test_restart_from_stage_reruns_downstream_only() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |_| {});
        let recorder = Rc::new(Recorder::default());
        driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();
        recorder.take();

        let restart = RestartScope::Identifier {
            identifier: "Pos1".to_string(),
            from: Some(Stage::CutFramesFull),
        };
        let summary = driver(&recorder, restart)
            .run(&mut config, &mut store)
            .unwrap();

        assert_eq!(
            recorder.take(),
            ["cut 10,20,30,40", "segment GFP weights_GFP", "analyze GFP", "track GFP"]
        );
        assert_eq!(
            stage_names(&summary.executed),
            ["CutFramesFull", "SegmentationFull_GFP", "Tracking_GFP", "Cleanup_Phase", "Cleanup_GFP"]
        );
    }

    #[test]
    fn test_edited_settings_rerun_the_identifier_from_scratch() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |_| {});
        let recorder = Rc::new(Recorder::default());
        driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();
        recorder.take();
        assert!(!temp_dir.path().join("Pos1").join("GFP").join(RAW_IM).exists());

        config.set("Pos1", "Corners", "1,2,3,4");
        let summary = driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();

        assert_eq!(summary.executed.len(), 11);
        assert!(summary.skipped.is_empty());
        assert_eq!(
            recorder.take(),
            [
                "split Phase [0, 2]",
                "split GFP [0, 2]",
                "cut 1,2,3,4",
                "select GFP",
                "split Phase [0, 1, 2, 3]",
                "split GFP [0, 1, 2, 3]",
                "cut 1,2,3,4",
                "segment GFP weights_GFP",
                "analyze GFP",
                "track GFP",
            ]
        );
        assert!(!store.drifted("Pos1", &config));
    }

    #[test]
    fn test_restart_of_unknown_identifier_or_stage_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |_| {});
        let recorder = Rc::new(Recorder::default());
        driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();
        recorder.take();

        let unknown = RestartScope::Identifier {
            identifier: "Pos9".to_string(),
            from: None,
        };
        let result = driver(&recorder, unknown).run(&mut config, &mut store);
        assert!(matches!(result, Err(ChamberflowError::InvalidRestart(_))));

        let off_plan = RestartScope::Identifier {
            identifier: "Pos1".to_string(),
            from: Some(Stage::Tracking("Phase".to_string())),
        };
        let result = driver(&recorder, off_plan).run(&mut config, &mut store);
        assert!(matches!(result, Err(ChamberflowError::InvalidRestart(_))));

        assert!(recorder.take().is_empty());
        assert_eq!(store.entries("Pos1").map(|e| e.len()), Some(11));
    }

    #[test]
    fn test_init_pass_covers_every_identifier_before_full_pass() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup_positions(temp_dir.path(), &["Pos1", "Pos2"], |_| {});
        let recorder = Rc::new(Recorder::default());

        let summary = driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();

        let plan = StagePlan::for_identifier(&config, "Pos1").unwrap();
        let (init, full): (Vec<&Stage>, Vec<&Stage>) =
            plan.stages().iter().partition(|s| s.is_init());
        let mut expected = Vec::new();
        for stages in [&init, &full] {
            for id in ["Pos1", "Pos2"] {
                expected.extend(stages.iter().map(|s| format!("{id}/{s}")));
            }
        }
        let executed: Vec<String> = summary
            .executed
            .iter()
            .map(|r| format!("{}/{}", r.identifier, r.stage))
            .collect();
        assert_eq!(executed, expected);
    }

    #[test]
    fn test_restart_of_one_identifier_keeps_the_others() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup_positions(temp_dir.path(), &["Pos1", "Pos2"], |_| {});
        let recorder = Rc::new(Recorder::default());
        driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();
        recorder.take();
        let pos1_before = store.entries("Pos1").unwrap().clone();

        let restart = RestartScope::Identifier {
            identifier: "Pos2".to_string(),
            from: Some(Stage::CutFramesFull),
        };
        let summary = driver(&recorder, restart)
            .run(&mut config, &mut store)
            .unwrap();

        assert!(summary.executed.iter().all(|r| r.identifier == "Pos2"));
        assert_eq!(summary.executed.len(), 5);
        assert_eq!(store.entries("Pos1"), Some(&pos1_before));
        assert_eq!(store.entries("Pos2").map(|e| e.len()), Some(11));
    }

    #[test]
    fn test_segmentation_run_prepares_all_channels_and_selects_fluorescence_only() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |config| {
            config.set("Pos1", "RunOption", "segmentation");
        });
        let recorder = Rc::new(Recorder::default());

        let summary = driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();

        assert_eq!(
            stage_names(&summary.executed),
            [
                "SetupDirs",
                "CopyFiles",
                "SplitFramesInit",
                "CutFramesInit",
                "SegmentationInit",
                "SplitFramesFull",
                "CutFramesFull",
                "SegmentationFull_GFP",
                "Cleanup_Phase",
                "Cleanup_GFP",
            ]
        );
        assert_eq!(recorder.take(), FULL_RUN[..9]);

        let pos1 = temp_dir.path().join("Pos1");
        for channel in ["Phase", "GFP"] {
            assert!(pos1.join(channel).join(CUT_IM).is_dir(), "{channel} cutouts");
            assert!(pos1.join(channel).join(TRACK_OUTPUT).is_dir(), "{channel} tree");
            assert!(pos1.join(channel).join(format!("exp_Pos1_{channel}.tif")).exists());
        }
        let saved = RunConfig::load(&temp_dir.path().join("settings.ini")).unwrap();
        assert_eq!(saved.get("Pos1", "ModelWeights_GFP").unwrap(), "weights_GFP");
        assert!(saved.get_opt("Pos1", "ModelWeights_Phase").is_none());
    }

    #[test]
    fn test_restart_all_reruns_every_stage() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |_| {});
        let recorder = Rc::new(Recorder::default());
        driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();
        recorder.take();

        let summary = driver(&recorder, RestartScope::All)
            .run(&mut config, &mut store)
            .unwrap();

        assert_eq!(summary.executed.len(), 11);
        let calls = recorder.take();
        // corners are known now, so they are applied rather than detected
        assert_eq!(calls[2], "cut 10,20,30,40");
        assert_eq!(calls.len(), FULL_RUN.len());
    }

    #[test]
    fn test_missing_source_file_stops_before_split() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |_| {});
        fs::remove_file(temp_dir.path().join("exp_Pos1_GFP.tif")).unwrap();
        let recorder = Rc::new(Recorder::default());

        let result = driver(&recorder, RestartScope::None).run(&mut config, &mut store);

        assert!(matches!(
            result,
            Err(ChamberflowError::MissingSourceFile { ref channel, .. }) if channel == "GFP"
        ));
        assert!(store.has(&StageRecord::new("Pos1", Stage::CopyFiles), &config));
        assert!(!store.has(&StageRecord::new("Pos1", Stage::SplitFramesInit), &config));
    }

    #[test]
    fn test_duplicate_source_file_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |_| {});
        fs::write(temp_dir.path().join("exp_Pos1_GFP_again.tif"), "GFP").unwrap();
        let recorder = Rc::new(Recorder::default());

        let result = driver(&recorder, RestartScope::None).run(&mut config, &mut store);

        assert!(matches!(
            result,
            Err(ChamberflowError::DuplicateSourceFile { count: 2, .. })
        ));
    }

    #[test]
    fn test_missing_corners_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |config| {
            config.set("Pos1", "ModelWeights_GFP", "weights_GFP");
        });
        let layout = PositionLayout::new(temp_dir.path(), "Pos1");
        let channels = vec!["Phase".to_string(), "GFP".to_string()];
        layout.recreate(&channels).unwrap();
        layout.copy_sources("tif", &channels).unwrap();
        for stage in [
            Stage::SetupDirs,
            Stage::CopyFiles,
            Stage::SplitFramesInit,
            Stage::CutFramesInit,
            Stage::SegmentationInit,
        ] {
            store
                .commit(&StageRecord::new("Pos1", stage), config.section_snapshot("Pos1"))
                .unwrap();
        }
        let recorder = Rc::new(Recorder::default());

        let result = driver(&recorder, RestartScope::None).run(&mut config, &mut store);

        assert!(matches!(result, Err(ChamberflowError::MissingCorners(ref id)) if id == "Pos1"));
        assert_eq!(
            recorder.take(),
            ["split Phase [0, 1, 2, 3]", "split GFP [0, 1, 2, 3]"]
        );
        assert!(!store.has(&StageRecord::new("Pos1", Stage::CutFramesFull), &config));
    }

    #[test]
    fn test_tracking_only_skips_segmentation_stages() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |config| {
            config.set("Pos1", "RunOption", "tracking");
        });
        let recorder = Rc::new(Recorder::default());

        let summary = driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();

        assert_eq!(recorder.take(), ["track GFP"]);
        assert_eq!(
            stage_names(&summary.executed),
            ["Tracking_GFP", "Cleanup_Phase", "Cleanup_GFP"]
        );
    }

    #[test]
    fn test_phase_segmentation_with_fluo_change() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |config| {
            config.set("Pos1", "RunOption", "segmentation");
            config.set("Pos1", "PhaseSegmentation", "True");
            config.set("Pos1", "FluoChange", "True");
        });
        let recorder = Rc::new(Recorder::default());

        driver(&recorder, RestartScope::None)
            .run(&mut config, &mut store)
            .unwrap();

        let calls = recorder.take();
        for expected in [
            "select Phase",
            "select GFP",
            "segment Phase weights_Phase",
            "segment GFP weights_GFP",
            "fluo_change",
        ] {
            assert!(calls.iter().any(|c| c == expected), "missing call {expected}");
        }
        assert!(!calls.iter().any(|c| c.starts_with("track")));
    }

    #[test]
    fn test_config_only_keeps_configuration_and_drops_data() {
        let temp_dir = TempDir::new().unwrap();
        let (mut config, mut store) = setup(temp_dir.path(), |_| {});
        let recorder = Rc::new(Recorder::default());
        let driver = PipelineDriver::new(
            fakes::collaborators(&recorder),
            RunOptions {
                config_only: true,
                ..Default::default()
            },
        );

        let summary = driver.run(&mut config, &mut store).unwrap();

        assert!(summary.config_only);
        assert_eq!(recorder.take(), FULL_RUN[..4]);
        assert!(!temp_dir.path().join("Pos1").exists());
        assert!(store.entries("Pos1").is_none());

        let (saved, reopened) = reopen(temp_dir.path());
        assert_eq!(saved.corners("Pos1").unwrap(), Some(DETECTED_CORNERS));
        assert_eq!(saved.get("Pos1", "ModelWeights_GFP").unwrap(), "weights_GFP");
        assert!(reopened.entries("Pos1").is_none());
    }

    #[test]
    fn test_frame_helpers() {
        assert_eq!(init_frames(0, 10), [0, 5]);
        assert_eq!(init_frames(3, 4), [3]);

        let temp_dir = TempDir::new().unwrap();
        let (mut config, _) = setup(temp_dir.path(), |_| {});
        assert_eq!(frame_range(&config, "Pos1").unwrap(), (0, 4));
        config.set("Pos1", "EndFrame", "0");
        assert!(frame_range(&config, "Pos1").is_err());
        config.set("Pos1", "StartFrame", "-1");
        assert!(frame_range(&config, "Pos1").is_err());
    }

    #[test]
    fn test_restart_scope() {
        let scope = RestartScope::Identifier {
            identifier: "Pos1".to_string(),
            from: Some(Stage::CutFramesFull),
        };
        assert!(scope.forces("Pos1", &Stage::CutFramesFull));
        assert!(!scope.forces("Pos1", &Stage::SplitFramesFull));
        assert!(!scope.forces("Pos2", &Stage::CutFramesFull));

        let whole = RestartScope::Identifier {
            identifier: "Pos1".to_string(),
            from: None,
        };
        assert!(whole.forces("Pos1", &Stage::SetupDirs));
        assert!(RestartScope::All.forces("Pos7", &Stage::Cleanup("GFP".to_string())));
        assert!(!RestartScope::None.forces("Pos1", &Stage::SetupDirs));
    }
}
