//! Stage guard: a guarded unit of work with commit-on-success.
//!
//! Entering a guard decides whether the stage runs. A stage that already
//! has a valid checkpoint is skipped as a whole; a stage whose body fails
//! leaves no checkpoint and is attempted again on the next run.

use super::CheckpointStore;
use crate::models::{ChamberflowError, Result, RunConfig, StagePlan, StageRecord};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Per-invocation guard settings.
#[derive(Debug, Clone, Default)]
pub struct GuardOptions {
    /// Run even if complete, invalidating this stage and everything after it
    pub restart: bool,
    /// Directory that receives a diagnostic copy of the configuration on commit
    pub copy_path: Option<PathBuf>,
}

/// Result of entering a guard.
pub enum Admission {
    /// Stage has a valid checkpoint; its body must not run
    AlreadyComplete,
    /// Stage must run; commit the guard once the body succeeded
    Run(StageGuard),
}

/// What happened to a guarded stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Skipped,
    Completed,
}

/// An admitted, not yet committed stage.
pub struct StageGuard {
    record: StageRecord,
    copy_path: Option<PathBuf>,
    finished: bool,
}

impl StageGuard {
    /// Decide whether `record` runs.
    ///
    /// With `restart` set the skip check is bypassed and the checkpoints of
    /// this stage and of every later stage of the identifier are cleared
    /// first, since they were produced from the output about to be replaced.
    pub fn enter(
        store: &mut CheckpointStore,
        config: &RunConfig,
        plan: &StagePlan,
        record: StageRecord,
        options: GuardOptions,
    ) -> Result<Admission> {
        if options.restart {
            store.clear_from(&record.identifier, plan, &record.stage)?;
            info!(identifier = %record.identifier, stage = %record.stage, "Forcing stage re-run");
        } else if store.has(&record, config) {
            info!(identifier = %record.identifier, stage = %record.stage, "Already complete, skipping");
            return Ok(Admission::AlreadyComplete);
        }

        debug!(identifier = %record.identifier, stage = %record.stage, "Entering stage");
        Ok(Admission::Run(Self {
            record,
            copy_path: options.copy_path,
            finished: false,
        }))
    }

    pub fn record(&self) -> &StageRecord {
        &self.record
    }

    /// Commit completion together with the identifier's configuration section.
    pub fn commit(mut self, store: &mut CheckpointStore, config: &RunConfig) -> Result<()> {
        store.commit(
            &self.record,
            config.section_snapshot(&self.record.identifier),
        )?;
        self.finished = true;

        if let Some(dir) = self.copy_path.as_deref().filter(|p| p.is_dir()) {
            if let Err(e) = config.to_file(Some(dir), true) {
                warn!(path = %dir.display(), error = %e, "Could not write configuration copy");
            }
        }

        info!(identifier = %self.record.identifier, stage = %self.record.stage, "Stage complete");
        Ok(())
    }

    /// Give up on the stage without committing.
    pub fn abandon(mut self, error: &ChamberflowError) {
        self.finished = true;
        warn!(
            identifier = %self.record.identifier,
            stage = %self.record.stage,
            error = %error,
            "Stage failed, no checkpoint written"
        );
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                identifier = %self.record.identifier,
                stage = %self.record.stage,
                "Stage guard dropped without commit - stage will re-run"
            );
        }
    }
}

/// Run `body` under a guard: skip if complete, commit if it succeeds.
///
/// Errors from `body` propagate unchanged and leave the store untouched.
pub fn run_stage<F>(
    store: &mut CheckpointStore,
    config: &mut RunConfig,
    plan: &StagePlan,
    record: StageRecord,
    options: GuardOptions,
    body: F,
) -> Result<StageOutcome>
where
    F: FnOnce(&mut RunConfig) -> Result<()>,
{
    let guard = match StageGuard::enter(store, config, plan, record, options)? {
        Admission::AlreadyComplete => return Ok(StageOutcome::Skipped),
        Admission::Run(guard) => guard,
    };

    if let Err(e) = body(config) {
        guard.abandon(&e);
        return Err(e);
    }

    guard.commit(store, config)?;
    Ok(StageOutcome::Completed)
}
