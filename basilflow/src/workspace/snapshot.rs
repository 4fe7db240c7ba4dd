//! Recursive file snapshots used to discover program outputs.

use crate::errors::{BasilError, ConfigurationError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Modification time of every file under a directory, keyed by relative path.
pub type FileSnapshot = BTreeMap<PathBuf, SystemTime>;

/// Records every regular file under `dir`, recursively.
pub fn snapshot(dir: &Path) -> Result<FileSnapshot> {
    let mut files = FileSnapshot::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| BasilError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .map_err(|e| BasilError::Io(e.into()))?
            .modified()?;
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_or_else(|_| entry.path().to_path_buf(), Path::to_path_buf);
        files.insert(relative, modified);
    }
    Ok(files)
}

/// Files that are new in `post` or whose modification time increased.
#[must_use]
pub fn changed_files(pre: &FileSnapshot, post: &FileSnapshot) -> Vec<PathBuf> {
    post.iter()
        .filter(|(path, modified)| pre.get(*path).map_or(true, |before| *modified > before))
        .map(|(path, _)| path.clone())
        .collect()
}

/// Compiles expected-output patterns, anchored at the start of the relative path.
pub fn compile_expected(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(&format!("^(?:{pattern})")).map_err(|e| {
                BasilError::from(
                    ConfigurationError::new(format!("Invalid expected output pattern '{pattern}': {e}"))
                        .with_parameter("expected"),
                )
            })
        })
        .collect()
}

/// Chooses which files a run returns.
///
/// With expected patterns, every post-run file matching one of them is
/// returned whether or not it changed. Without, the changed files are.
#[must_use]
pub fn select_return_files(pre: &FileSnapshot, post: &FileSnapshot, expected: &[Regex]) -> Vec<PathBuf> {
    if expected.is_empty() {
        return changed_files(pre, post);
    }
    post.keys()
        .filter(|path| {
            let relative = path.to_string_lossy();
            expected.iter().any(|re| re.is_match(&relative))
        })
        .cloned()
        .collect()
}
