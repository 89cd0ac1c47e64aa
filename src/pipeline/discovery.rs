//! Identifier discovery: which positions does a dataset folder contain?

use crate::models::ConfigError;
use glob::Pattern;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

/// Find every `<prefix><digits>` identifier in the file names of `folder`.
///
/// For `ome.tif` datasets the per-position `.export` entries are scanned
/// instead of the images themselves. The result is sorted and free of
/// duplicates; an empty result is an error.
pub fn discover_identifiers(
    folder: &Path,
    file_type: &str,
    prefix: &str,
) -> Result<Vec<String>, ConfigError> {
    let extension = if file_type == "ome.tif" { "export" } else { file_type };
    let pattern = format!(
        "{}/*{}*.{}",
        Pattern::escape(&folder.to_string_lossy()),
        Pattern::escape(prefix),
        extension
    );
    let matcher = Regex::new(&format!(r"{}\d+", regex::escape(prefix))).map_err(|e| {
        ConfigError::InvalidValue {
            section: crate::models::GENERAL.to_string(),
            key: "IdentifierName".to_string(),
            value: prefix.to_string(),
            reason: e.to_string(),
        }
    })?;

    let no_identifiers = || ConfigError::NoIdentifiers {
        prefix: prefix.to_string(),
        folder: folder.to_path_buf(),
    };

    let paths = glob::glob(&pattern).map_err(|_| no_identifiers())?;
    let identifiers: BTreeSet<String> = paths
        .filter_map(|p| p.ok())
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .filter_map(|name| matcher.find(&name).map(|m| m.as_str().to_string()))
        .collect();

    if identifiers.is_empty() {
        return Err(no_identifiers());
    }

    info!(count = identifiers.len(), prefix, "Discovered identifiers");
    Ok(identifiers.into_iter().collect())
}
