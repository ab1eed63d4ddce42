//! Small shared helpers for file paths and delimited text.

pub mod table;
pub mod verbosity;

use color_eyre::eyre::{eyre, Report, Result};
use std::fmt::Debug;
use std::path::Path;

/// Lookup the delimiter character for a file path based on its extension.
pub fn path_to_delim(path: &Path) -> Result<char, Report> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| eyre!("Unable to parse extension from file: {path:?}"))?;

    let delim = match ext {
        "tsv" | "txt" | "ortho" | "para" => '\t',
        "csv" => ',',
        _ => return Err(eyre!("Unknown file extension for delimited text: {ext:?}")),
    };

    Ok(delim)
}

/// Create all missing parent directories of a file path.
pub fn create_parent_dir<P>(path: &P) -> Result<(), Report>
where
    P: AsRef<Path> + Debug,
{
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
