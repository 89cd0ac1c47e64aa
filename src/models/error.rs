//! Error types for chamberflow.
//!
//! Taxonomy:
//! - Fatal input errors: the run cannot continue for this dataset
//! - Configuration errors: the run configuration is missing or malformed
//! - Infrastructure errors: IO and external programs failed
//! - Internal errors: invariant violations (bugs)
//!
//! A corrupt checkpoint record is deliberately absent from this list: the
//! store logs it and treats the stage as incomplete, trading strict
//! auditability for forward progress.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for chamberflow.
#[derive(Debug, Error)]
pub enum ChamberflowError {
    // ═══════════════════════════════════════════════════════════════════
    // FATAL INPUT - stops the whole run
    // ═══════════════════════════════════════════════════════════════════

    #[error("No file of the type '.{extension}' exists for channel {channel}")]
    MissingSourceFile { channel: String, extension: String },

    #[error("More than one file ({count}) of the type '.{extension}' exists for channel {channel}")]
    DuplicateSourceFile {
        channel: String,
        extension: String,
        count: usize,
    },

    #[error("Corners were never set for identifier {0}")]
    MissingCorners(String),

    // ═══════════════════════════════════════════════════════════════════
    // CONFIGURATION - run or tool configuration is unusable
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Unknown {kind} strategy: '{name}'")]
    UnknownStrategy { kind: &'static str, name: String },

    #[error("Invalid restart: {0}")]
    InvalidRestart(String),

    #[error("Invalid stage name: '{0}'")]
    InvalidStage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE - filesystem and external programs
    // ═══════════════════════════════════════════════════════════════════

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("External tool '{tool}' failed ({status}): {stderr}")]
    ExternalTool {
        tool: PathBuf,
        status: String,
        stderr: String,
    },

    // ═══════════════════════════════════════════════════════════════════
    // INTERNAL - invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChamberflowError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error is a fatal property of the input data rather than
    /// of the environment. Re-running without fixing the data fails again.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::MissingSourceFile { .. }
                | Self::DuplicateSourceFile { .. }
                | Self::MissingCorners(_)
        )
    }
}

/// Result type alias for chamberflow.
pub type Result<T> = std::result::Result<T, ChamberflowError>;
