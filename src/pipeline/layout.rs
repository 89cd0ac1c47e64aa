//! Directory tree of one identifier.
//!
//! ```text
//! <FolderPath>/<identifier>/<channel>/
//!     <copied source file>
//!     raw_im/  cut_im/  cut_im_rawcounts/  seg_im/  seg_im_bin/  track_output/
//! ```

use crate::models::{ChamberflowError, Result, RunConfig};
use glob::Pattern;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const RAW_IM: &str = "raw_im";
pub const CUT_IM: &str = "cut_im";
pub const CUT_IM_RAWCOUNTS: &str = "cut_im_rawcounts";
pub const SEG_IM: &str = "seg_im";
pub const SEG_IM_BIN: &str = "seg_im_bin";
pub const TRACK_OUTPUT: &str = "track_output";

const CHANNEL_FOLDERS: [&str; 6] = [RAW_IM, CUT_IM, CUT_IM_RAWCOUNTS, SEG_IM, SEG_IM_BIN, TRACK_OUTPUT];

/// Which intermediate artifacts survive cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Retention {
    pub copy_original: bool,
    pub raw_images: bool,
    pub cutout_images: bool,
    pub cutout_images_raw: bool,
    pub seg_images_label: bool,
    pub seg_images_bin: bool,
    pub seg_images_track: bool,
}

impl Retention {
    /// Read the `Keep*` flags of an identifier section.
    pub fn from_config(config: &RunConfig, identifier: &str) -> Result<Self> {
        let keep = |key: &str| config.get_bool(identifier, key);
        Ok(Self {
            copy_original: keep("KeepCopyOriginal")?,
            raw_images: keep("KeepRawImages")?,
            cutout_images: keep("KeepCutoutImages")?,
            cutout_images_raw: keep("KeepCutoutImagesRaw")?,
            seg_images_label: keep("KeepSegImagesLabel")?,
            seg_images_bin: keep("KeepSegImagesBin")?,
            seg_images_track: keep("KeepSegImagesTrack")?,
        })
    }
}

/// Paths of one identifier's working tree.
#[derive(Debug, Clone)]
pub struct PositionLayout {
    base: PathBuf,
    identifier: String,
    root: PathBuf,
}

impl PositionLayout {
    pub fn new(base: &Path, identifier: &str) -> Self {
        Self {
            base: base.to_path_buf(),
            identifier: identifier.to_string(),
            root: base.join(identifier),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn channel_dir(&self, channel: &str) -> PathBuf {
        self.root.join(channel)
    }

    pub fn folder(&self, channel: &str, folder: &str) -> PathBuf {
        self.root.join(channel).join(folder)
    }

    /// Recreate the tree from scratch. Anything already there is deleted.
    pub fn recreate(&self, channels: &[String]) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)
                .map_err(|e| ChamberflowError::io("removing identifier directory", e))?;
        }
        fs::create_dir_all(&self.root)
            .map_err(|e| ChamberflowError::io("creating identifier directory", e))?;

        for channel in channels {
            for folder in CHANNEL_FOLDERS {
                fs::create_dir_all(self.folder(channel, folder))
                    .map_err(|e| ChamberflowError::io("creating channel directory", e))?;
            }
        }
        debug!(root = %self.root.display(), channels = channels.len(), "Directory tree created");
        Ok(())
    }

    /// Copy matching source files from the dataset folder into every channel
    /// directory whose name appears in the file stem. Returns the number of
    /// copies made.
    pub fn copy_sources(&self, file_type: &str, channels: &[String]) -> Result<usize> {
        let base = Pattern::escape(&self.base.to_string_lossy());
        let id = Pattern::escape(&self.identifier);
        let pattern = if file_type == "ome.tif" {
            format!("{base}/*{id}_*/**/*.ome.tif")
        } else {
            format!("{base}/*{id}_*.{file_type}")
        };

        let mut copied = 0;
        for source in glob_files(&pattern)? {
            let (Some(name), Some(stem)) = (source.file_name(), source.file_stem()) else {
                continue;
            };
            let stem = stem.to_string_lossy();
            for channel in channels.iter().filter(|c| stem.contains(c.as_str())) {
                info!(file = %name.to_string_lossy(), channel = %channel, "Copying source file");
                fs::copy(&source, self.channel_dir(channel).join(name))
                    .map_err(|e| ChamberflowError::io("copying source file", e))?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// The single source file of a channel.
    ///
    /// Zero or several candidates are fatal: the split would be ambiguous.
    pub fn source_file(&self, channel: &str, file_type: &str) -> Result<PathBuf> {
        let dir = Pattern::escape(&self.channel_dir(channel).to_string_lossy());
        let mut paths = glob_files(&format!("{dir}/*.{file_type}"))?;

        match paths.len() {
            0 => Err(ChamberflowError::MissingSourceFile {
                channel: channel.to_string(),
                extension: file_type.to_string(),
            }),
            1 => Ok(paths.remove(0)),
            count => Err(ChamberflowError::DuplicateSourceFile {
                channel: channel.to_string(),
                extension: file_type.to_string(),
                count,
            }),
        }
    }

    /// Delete the intermediate artifacts of one channel that are not retained.
    pub fn cleanup_channel(&self, channel: &str, file_type: &str, keep: Retention) -> Result<()> {
        let channel_dir = self.channel_dir(channel);

        if !keep.copy_original {
            let dir = Pattern::escape(&channel_dir.to_string_lossy());
            let id = Pattern::escape(&self.identifier);
            remove_files(&format!("{dir}/*{id}*.{file_type}"))?;
        }

        let folders = [
            (keep.raw_images, RAW_IM),
            (keep.cutout_images, CUT_IM),
            (keep.cutout_images_raw, CUT_IM_RAWCOUNTS),
            (keep.seg_images_label, SEG_IM),
            (keep.seg_images_bin, SEG_IM_BIN),
        ];
        for (_, folder) in folders.iter().filter(|(keep, _)| !keep) {
            remove_dir_if_exists(&channel_dir.join(folder))?;
        }

        if !keep.seg_images_track {
            let dir = Pattern::escape(&channel_dir.join(TRACK_OUTPUT).to_string_lossy());
            remove_files(&format!("{dir}/segmentations_*.h5"))?;
        }
        Ok(())
    }

    /// Remove the whole identifier tree.
    pub fn remove(&self) -> Result<()> {
        remove_dir_if_exists(&self.root)
    }
}

fn glob_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob::glob(pattern)
        .map_err(|e| ChamberflowError::Internal(format!("Invalid glob pattern: {e}")))?
        .filter_map(|r| r.ok())
        .filter(|p| p.is_file())
        .collect();
    Ok(paths)
}

fn remove_files(pattern: &str) -> Result<()> {
    for file in glob_files(pattern)? {
        match fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ChamberflowError::io("removing file", e)),
        }
    }
    Ok(())
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ChamberflowError::io("removing directory", e)),
    }
}
