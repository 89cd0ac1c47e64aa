//! Run configuration: the human-editable `settings.ini`.
//!
//! The `[General]` section holds dataset-wide settings; every identifier
//! has its own section. Stages read parameters from here and write back
//! values discovered along the way (corners, model weights), persisting
//! immediately so a resumed run sees the same decisions.

use super::{Corners, RunOption};
use ini::Ini;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the dataset-wide section.
pub const GENERAL: &str = "General";

/// File name used when persisting into a directory.
pub const SETTINGS_FILE: &str = "settings.ini";

/// Values every new identifier section starts with.
const IDENTIFIER_DEFAULTS: &[(&str, &str)] = &[
    ("RunOption", "both"),
    ("Channels", "None"),
    ("StartFrame", "0"),
    ("EndFrame", "10"),
    ("Deconvolution", "no_deconv"),
    ("PhaseSegmentation", "False"),
    ("Corners", "None"),
    ("CutImgClass", "InteractiveCutout"),
    ("SegmentationClass", "OmniSegmentation"),
    ("TrackingClass", "DeltaV2Tracking"),
    ("RemoveBorder", "False"),
    ("ImgThreshold", "1.0"),
    ("FluoChange", "False"),
    ("KeepCopyOriginal", "True"),
    ("KeepRawImages", "False"),
    ("KeepCutoutImages", "True"),
    ("KeepCutoutImagesRaw", "False"),
    ("KeepSegImagesLabel", "True"),
    ("KeepSegImagesBin", "False"),
    ("KeepSegImagesTrack", "True"),
];

/// Dataset-wide settings written to `[General]`.
#[derive(Debug, Clone)]
pub struct GeneralSettings {
    pub data_type: String,
    pub folder_path: PathBuf,
    pub file_type: String,
    pub identifier_name: String,
    pub identifiers: Vec<String>,
}

/// Mutable run configuration backed by an INI file.
#[derive(Debug, Clone)]
pub struct RunConfig {
    path: PathBuf,
    ini: Ini,
}

impl RunConfig {
    /// Create a fresh configuration with a `[General]` section.
    ///
    /// Nothing is written until [`RunConfig::to_file`] is called.
    pub fn new(path: impl Into<PathBuf>, general: &GeneralSettings) -> Self {
        let mut ini = Ini::new();
        ini.with_section(Some(GENERAL))
            .set("DataType", general.data_type.as_str())
            .set("FolderPath", general.folder_path.to_string_lossy())
            .set("FileType", general.file_type.as_str())
            .set("IdentifierName", general.identifier_name.as_str())
            .set("IdentifierFound", general.identifiers.join(","));
        Self {
            path: path.into(),
            ini,
        }
    }

    /// Load configuration from an INI file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;
        if ini.section(Some(GENERAL)).is_none() {
            return Err(ConfigError::MissingSection(GENERAL.to_string()));
        }
        Ok(Self {
            path: path.to_owned(),
            ini,
        })
    }

    /// Path this configuration persists to by default.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.ini.section(Some(section)).is_some()
    }

    /// Raw value lookup without error; the `fallback=None` form.
    pub fn get_opt(&self, section: &str, key: &str) -> Option<&str> {
        self.ini.get_from(Some(section), key)
    }

    pub fn get(&self, section: &str, key: &str) -> Result<String, ConfigError> {
        if !self.has_section(section) {
            return Err(ConfigError::MissingSection(section.to_string()));
        }
        self.get_opt(section, key)
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingKey {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    pub fn get_int(&self, section: &str, key: &str) -> Result<i64, ConfigError> {
        let value = self.get(section, key)?;
        value
            .trim()
            .parse()
            .map_err(|_| invalid(section, key, &value, "expected an integer"))
    }

    pub fn get_float(&self, section: &str, key: &str) -> Result<f64, ConfigError> {
        let value = self.get(section, key)?;
        value
            .trim()
            .parse()
            .map_err(|_| invalid(section, key, &value, "expected a number"))
    }

    /// Boolean lookup accepting `1/yes/true/on` and `0/no/false/off`.
    pub fn get_bool(&self, section: &str, key: &str) -> Result<bool, ConfigError> {
        let value = self.get(section, key)?;
        match value.trim().to_lowercase().as_str() {
            "1" | "yes" | "true" | "on" => Ok(true),
            "0" | "no" | "false" | "off" => Ok(false),
            _ => Err(invalid(section, key, &value, "expected a boolean")),
        }
    }

    /// Comma separated list; empty items are dropped.
    pub fn get_list(&self, section: &str, key: &str) -> Result<Vec<String>, ConfigError> {
        let value = self.get(section, key)?;
        Ok(value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.ini.set_to(Some(section), key.to_string(), value.into());
    }

    /// Identifiers discovered at configuration time, in run order.
    pub fn identifiers(&self) -> Result<Vec<String>, ConfigError> {
        self.get_list(GENERAL, "IdentifierFound")
    }

    pub fn folder_path(&self) -> Result<PathBuf, ConfigError> {
        self.get(GENERAL, "FolderPath").map(PathBuf::from)
    }

    pub fn file_type(&self) -> Result<String, ConfigError> {
        self.get(GENERAL, "FileType")
    }

    pub fn run_option(&self, identifier: &str) -> Result<RunOption, ConfigError> {
        let value = self.get(identifier, "RunOption")?;
        value
            .parse()
            .map_err(|reason: String| invalid(identifier, "RunOption", &value, &reason))
    }

    pub fn corners(&self, identifier: &str) -> Result<Option<Corners>, ConfigError> {
        let value = self.get(identifier, "Corners")?;
        Corners::from_config_value(&value).map_err(|e| match e {
            ConfigError::InvalidValue { reason, .. } => {
                invalid(identifier, "Corners", &value, &reason)
            }
            other => other,
        })
    }

    /// Create (or complete) an identifier section with default values.
    ///
    /// Keys that already exist are left alone.
    pub fn set_id_section(&mut self, identifier: &str) {
        for (key, value) in IDENTIFIER_DEFAULTS {
            if self.get_opt(identifier, key).is_none() {
                self.set(identifier, key, *value);
            }
        }
    }

    /// Serialized copy of one section, used to tag checkpoint entries.
    pub fn section_snapshot(&self, section: &str) -> BTreeMap<String, String> {
        self.ini
            .section(Some(section))
            .map(|props| {
                props
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Persist the configuration.
    ///
    /// `target` defaults to the configuration's own path; a directory target
    /// receives `settings.ini`. With `overwrite == false` an existing file is
    /// left untouched and an error is returned. The write goes through a
    /// temporary file and a rename, so readers never see a partial file.
    pub fn to_file(&self, target: Option<&Path>, overwrite: bool) -> Result<PathBuf, ConfigError> {
        let path = match target {
            Some(t) if t.is_dir() => t.join(SETTINGS_FILE),
            Some(t) => t.to_path_buf(),
            None => self.path.clone(),
        };

        if !overwrite && path.exists() {
            return Err(ConfigError::AlreadyExists(path));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: path.clone(),
                source: e,
            })?;
        }

        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);

        self.ini
            .write_to_file(&temp_path)
            .and_then(|()| fs::rename(&temp_path, &path))
            .map_err(|e| ConfigError::Write {
                path: path.clone(),
                source: e,
            })?;

        debug!(path = %path.display(), "Run configuration saved");
        Ok(path)
    }
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: ini::Error,
    },

    #[error("Failed to read tool config {path}: {source}")]
    ToolsRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse tool config {path}: {source}")]
    ToolsParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Config file {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("Missing section [{0}]")]
    MissingSection(String),

    #[error("Missing key '{key}' in section [{section}]")]
    MissingKey { section: String, key: String },

    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("No identifiers matching '{prefix}' found in {folder}")]
    NoIdentifiers { prefix: String, folder: PathBuf },
}
