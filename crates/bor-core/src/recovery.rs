//! Crash-recovery staging: stray live-side copies get moved aside under a
//! `bor-crash_*` name instead of being silently discarded, so a user who
//! finds data missing after a crash has somewhere to look.

use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::ActionErrorKind;
use crate::fs_adapter::{self, TreeCopier};

const CRASH_PREFIX: &str = "bor-crash_";
const TIMESTAMP_FORMAT: &str = "%d-%m-%y_%H:%M:%S";

/// Moves a directory that [`crate::repair::StateRepairer`] could not
/// reconcile into a timestamped sibling instead of deleting it outright.
pub struct RecoveryWriter<'a> {
    copier: &'a dyn TreeCopier,
}

impl<'a> RecoveryWriter<'a> {
    pub fn new(copier: &'a dyn TreeCopier) -> Self {
        RecoveryWriter { copier }
    }

    /// Moves `stray` (a directory under `stray.parent()`) to
    /// `<parent>/bor-crash_<dirname>_<timestamp>[-N]`, returning the final
    /// path. `stray` no longer exists afterward.
    pub fn quarantine(&self, stray: &Path) -> Result<PathBuf, ActionErrorKind> {
        let parent = stray.parent().ok_or_else(|| ActionErrorKind::CorruptedState {
            path: stray.to_path_buf(),
            detail: "quarantine target has no parent".to_string(),
        })?;
        let dirname = stray
            .file_name()
            .ok_or_else(|| ActionErrorKind::CorruptedState {
                path: stray.to_path_buf(),
                detail: "quarantine target has no file name".to_string(),
            })?
            .to_string_lossy()
            .into_owned();

        let stamp = Local::now().format(TIMESTAMP_FORMAT);
        let base = parent.join(format!("{CRASH_PREFIX}{dirname}_{stamp}"));
        let dest = fs_adapter::unique_path(&base)?;

        fs_adapter::move_tree(stray, &dest, false, self.copier)?;
        Ok(dest)
    }
}

/// Lists every `bor-crash_*` entry directly under `root` (non-recursive),
/// for the `clean` action.
pub fn list_quarantined(root: &Path) -> Result<Vec<PathBuf>, ActionErrorKind> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(root).map_err(|e| ActionErrorKind::io(root, "readdir", e))? {
        let entry = entry.map_err(|e| ActionErrorKind::io(root, "readdir", e))?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(CRASH_PREFIX) {
            found.push(entry.path());
        }
    }
    Ok(found)
}

/// Removes every `bor-crash_*` entry under `root`. Used by the `clean`
/// action once the user has had a chance to inspect them.
pub fn clean_quarantined(root: &Path) -> Result<usize, ActionErrorKind> {
    let found = list_quarantined(root)?;
    let count = found.len();
    for path in found {
        fs_adapter::remove_tree(&path)?;
    }
    Ok(count)
}
