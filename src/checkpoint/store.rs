//! Persistent checkpoint store.
//!
//! One JSON document records which (identifier, stage) units completed,
//! each tagged with the identifier's configuration section at commit time.
//!
//! - Writes are atomic: temp file → fsync → rename, previous generation kept
//!   as a backup.
//! - A corrupt document falls back to the backup, then to an empty store.
//! - A malformed record is dropped with a warning and the stage re-runs.
//!   This favours forward progress over strict auditability: real data
//!   corruption shows up as redone work, not as a halted pipeline.

use crate::models::{ChamberflowError, Result, RunConfig, Stage, StagePlan, StageRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const BACKUP_FILE: &str = "checkpoint.backup.json";
const TEMP_FILE: &str = "checkpoint.tmp.json";
const FORMAT_VERSION: u32 = 1;

/// Configuration placeholder for a value a later stage fills in.
const UNSET: &str = "None";

/// Evidence that one stage completed for one identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Stage that completed
    pub stage: Stage,
    /// Channel qualifier, duplicated for readability of the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// When the commit happened
    pub committed_at: DateTime<Utc>,
    /// Identifier configuration section in effect at commit time
    pub config: BTreeMap<String, String>,
}

impl CheckpointEntry {
    /// Whether the configuration this entry was committed under still holds.
    ///
    /// Keys added after the commit, and keys that were still unset (`None`)
    /// and have since been filled in, do not count as drift; changed or
    /// removed keys do.
    pub fn matches(&self, current: &BTreeMap<String, String>) -> bool {
        self.config
            .iter()
            .all(|(key, value)| value == UNSET || current.get(key) == Some(value))
    }
}

/// On-disk document. Records stay untyped until loaded so that one bad
/// record does not poison the rest.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    identifiers: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

/// Durable record of completed stages.
pub struct CheckpointStore {
    /// Directory for checkpoint files
    dir: PathBuf,
    /// Path to main checkpoint file
    checkpoint_path: PathBuf,
    /// Path to backup file
    backup_path: PathBuf,
    /// identifier → stage name → entry
    entries: BTreeMap<String, BTreeMap<String, CheckpointEntry>>,
    /// Re-run stages whose configuration changed since commit
    check_drift: bool,
}

impl CheckpointStore {
    /// Open (or create) the store in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| ChamberflowError::io("creating checkpoint dir", e))?;

        let mut store = Self {
            dir: dir.to_path_buf(),
            checkpoint_path: dir.join(CHECKPOINT_FILE),
            backup_path: dir.join(BACKUP_FILE),
            entries: BTreeMap::new(),
            check_drift: true,
        };
        store.entries = store.load();

        let total: usize = store.entries.values().map(BTreeMap::len).sum();
        if total > 0 {
            info!(
                identifiers = store.entries.len(),
                stages = total,
                "Resuming from checkpoint"
            );
        }
        Ok(store)
    }

    /// Enable or disable configuration drift detection.
    pub fn with_drift_check(mut self, enabled: bool) -> Self {
        self.check_drift = enabled;
        self
    }

    /// Get checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True iff the stage has a valid checkpoint for the current configuration.
    pub fn has(&self, record: &StageRecord, config: &RunConfig) -> bool {
        let Some(entry) = self.entry(record) else {
            return false;
        };
        if !self.check_drift {
            return true;
        }
        let valid = entry.matches(&config.section_snapshot(&record.identifier));
        if !valid {
            warn!(
                identifier = %record.identifier,
                stage = %record.stage,
                "Configuration changed since checkpoint, stage will re-run"
            );
        }
        valid
    }

    /// True iff any committed stage of `identifier` was committed under
    /// settings that no longer hold.
    ///
    /// Stages depend on the output of earlier ones, so a single stale entry
    /// makes the identifier's whole history untrustworthy.
    pub fn drifted(&self, identifier: &str, config: &RunConfig) -> bool {
        if !self.check_drift {
            return false;
        }
        let Some(stages) = self.entries.get(identifier) else {
            return false;
        };
        let current = config.section_snapshot(identifier);
        stages.values().any(|entry| !entry.matches(&current))
    }

    pub fn entry(&self, record: &StageRecord) -> Option<&CheckpointEntry> {
        self.entries
            .get(&record.identifier)?
            .get(&record.stage.to_string())
    }

    /// Committed entries of one identifier, keyed by stage name.
    pub fn entries(&self, identifier: &str) -> Option<&BTreeMap<String, CheckpointEntry>> {
        self.entries.get(identifier)
    }

    /// Record completion and persist before returning.
    ///
    /// If persisting fails the in-memory state is restored, so the store
    /// never claims a completion the disk does not hold.
    pub fn commit(
        &mut self,
        record: &StageRecord,
        snapshot: BTreeMap<String, String>,
    ) -> Result<()> {
        let entry = CheckpointEntry {
            stage: record.stage.clone(),
            channel: record.stage.channel().map(str::to_string),
            committed_at: Utc::now(),
            config: snapshot,
        };
        let key = record.stage.to_string();
        let previous = self
            .entries
            .entry(record.identifier.clone())
            .or_default()
            .insert(key.clone(), entry);

        if let Err(e) = self.save() {
            if let Some(stages) = self.entries.get_mut(&record.identifier) {
                match previous {
                    Some(old) => {
                        stages.insert(key, old);
                    }
                    None => {
                        stages.remove(&key);
                    }
                }
            }
            return Err(e);
        }

        debug!(identifier = %record.identifier, stage = %record.stage, "Checkpoint committed");
        Ok(())
    }

    /// Remove every entry of an identifier. Returns the number removed.
    pub fn clear(&mut self, identifier: &str) -> Result<usize> {
        let removed = self.entries.remove(identifier).map_or(0, |s| s.len());
        if removed > 0 {
            self.save()?;
            info!(identifier, removed, "Cleared checkpoints");
        }
        Ok(removed)
    }

    /// Remove the entries of `stage` and of every later stage in `plan`.
    pub fn clear_from(&mut self, identifier: &str, plan: &StagePlan, stage: &Stage) -> Result<usize> {
        let Some(stages) = self.entries.get_mut(identifier) else {
            return Ok(0);
        };
        let removed = plan
            .from_stage(stage)
            .iter()
            .filter(|s| stages.remove(&s.to_string()).is_some())
            .count();
        if stages.is_empty() {
            self.entries.remove(identifier);
        }
        if removed > 0 {
            self.save()?;
            info!(identifier, from = %stage, removed, "Invalidated downstream checkpoints");
        }
        Ok(removed)
    }

    /// Read the checkpoint document, falling back to the backup and finally
    /// to an empty store.
    fn load(&self) -> BTreeMap<String, BTreeMap<String, CheckpointEntry>> {
        if !self.checkpoint_path.exists() {
            return BTreeMap::new();
        }
        for path in [&self.checkpoint_path, &self.backup_path] {
            match read_document(path) {
                Ok(doc) => return parse_entries(doc),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Unreadable checkpoint, treating as incomplete"
                ),
            }
        }
        BTreeMap::new()
    }

    fn to_document(&self) -> Result<CheckpointFile> {
        let mut identifiers = BTreeMap::new();
        for (identifier, stages) in &self.entries {
            let mut records = BTreeMap::new();
            for (name, entry) in stages {
                let value = serde_json::to_value(entry).map_err(|e| {
                    ChamberflowError::Internal(format!("Serializing checkpoint entry: {e}"))
                })?;
                records.insert(name.clone(), value);
            }
            identifiers.insert(identifier.clone(), records);
        }
        Ok(CheckpointFile {
            version: FORMAT_VERSION,
            updated_at: Utc::now(),
            identifiers,
        })
    }

    /// Save checkpoint to disk (atomic write).
    fn save(&self) -> Result<()> {
        let doc = self.to_document()?;

        // Backup existing checkpoint
        if self.checkpoint_path.exists() {
            fs::copy(&self.checkpoint_path, &self.backup_path)
                .map_err(|e| ChamberflowError::io("backing up checkpoint", e))?;
        }

        // Write to temp file
        let temp_path = self.dir.join(TEMP_FILE);
        let file = File::create(&temp_path)
            .map_err(|e| ChamberflowError::io("creating temp checkpoint", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &doc)
            .map_err(|e| ChamberflowError::Internal(format!("Serializing checkpoint: {e}")))?;
        writer
            .flush()
            .map_err(|e| ChamberflowError::io("flushing temp checkpoint", e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| ChamberflowError::io("syncing temp checkpoint", e))?;

        // Atomic rename
        fs::rename(&temp_path, &self.checkpoint_path)
            .map_err(|e| ChamberflowError::io("renaming checkpoint", e))?;

        // Persist the rename itself where the platform allows it
        if let Err(e) = File::open(&self.dir).and_then(|dir| dir.sync_all()) {
            debug!(dir = %self.dir.display(), error = %e, "Checkpoint directory not synced");
        }

        debug!("Checkpoint saved");
        Ok(())
    }
}

fn read_document(path: &Path) -> Result<CheckpointFile> {
    let file = File::open(path).map_err(|e| ChamberflowError::io("opening checkpoint", e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| ChamberflowError::ParseError(format!("Invalid checkpoint: {e}")))
}

fn parse_entries(doc: CheckpointFile) -> BTreeMap<String, BTreeMap<String, CheckpointEntry>> {
    let mut entries = BTreeMap::new();
    for (identifier, stages) in doc.identifiers {
        let mut parsed = BTreeMap::new();
        for (name, value) in stages {
            match serde_json::from_value::<CheckpointEntry>(value) {
                Ok(entry) if entry.stage.to_string() == name => {
                    parsed.insert(name, entry);
                }
                Ok(entry) => warn!(
                    identifier = %identifier,
                    key = %name,
                    stage = %entry.stage,
                    "Checkpoint record does not match its key, ignoring"
                ),
                Err(e) => warn!(
                    identifier = %identifier,
                    key = %name,
                    error = %e,
                    "Malformed checkpoint record, ignoring"
                ),
            }
        }
        if !parsed.is_empty() {
            entries.insert(identifier, parsed);
        }
    }
    entries
}
