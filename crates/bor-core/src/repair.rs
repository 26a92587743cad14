//! Crash-state convergence.
//!
//! A managed directory has three physical slots: live (`L`), backup (`B`),
//! tmpfs (`T`), each classified as [`PhysEntry::Absent`], `Symlink`, `Dir`
//! or `Other`. Exactly two combinations are canonical:
//!
//! * unsynced: `(Dir, Absent, Absent)` — `L` holds the real data.
//! * synced: `(Symlink -> T, Dir, Dir)` — `L` points at `T`; `B` holds the
//!   pristine pre-sync copy (in overlay mode, the lower layer of the
//!   merged view at `T`).
//!
//! [`StateRepairer::repair`] runs before every action and applies the
//! three ordered rules below to converge any other combination — the
//! result of a crash between two steps of `sync`/`unsync`/`resync` — back
//! to one of the two canonical forms.

use std::path::Path;

use tracing::{instrument, warn};

use crate::error::ActionErrorKind;
use crate::fs_adapter::{self, PhysEntry, TreeCopier};
use crate::path_resolver::ResolvedPaths;
use crate::recovery::RecoveryWriter;

/// Which physical slot held the data a repair recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Live,
    Backup,
    Tmpfs,
}

/// Outcome of running the repairer over one managed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Already `(Dir, Absent, Absent)`. No action taken.
    AlreadyUnsynced,
    /// Already `(Symlink -> T, Dir, Dir)`. No action taken.
    AlreadySynced,
    /// All three slots are absent: the directory has never been
    /// populated (typical on first run, before the browser has created
    /// it). Not itself an error; the engine decides whether to create it.
    AllAbsent,
    /// A crash-interrupted combination was converged, recovering content
    /// from `recovered_from`. Any stray entry that rule 1 displaced is
    /// listed in `quarantined` rather than having been deleted.
    Repaired {
        recovered_from: Location,
        quarantined: Vec<std::path::PathBuf>,
    },
}

pub struct StateRepairer<'a> {
    copier: &'a dyn TreeCopier,
    overlay_mode: bool,
}

impl<'a> StateRepairer<'a> {
    pub fn new(copier: &'a dyn TreeCopier, overlay_mode: bool) -> Self {
        StateRepairer { copier, overlay_mode }
    }

    #[instrument(skip(self), fields(live = %live.display()))]
    pub fn repair(&self, live: &Path, paths: &ResolvedPaths) -> Result<RepairOutcome, ActionErrorKind> {
        let backup = &paths.backup;
        let tmpfs = &paths.tmpfs;

        let l = fs_adapter::classify(live).map_err(|e| ActionErrorKind::io(live, "lstat", e))?;
        let mut b = fs_adapter::classify(backup).map_err(|e| ActionErrorKind::io(backup, "lstat", e))?;
        let mut t = fs_adapter::classify(tmpfs).map_err(|e| ActionErrorKind::io(tmpfs, "lstat", e))?;

        // Rule 1: a real directory at L is authoritative; anything left
        // over in B or T is a stray from an incomplete prior session.
        if l == PhysEntry::Dir {
            let writer = RecoveryWriter::new(self.copier);
            let mut quarantined = Vec::new();
            if b != PhysEntry::Absent {
                quarantined.push(writer.quarantine(backup)?);
            }
            if t != PhysEntry::Absent {
                quarantined.push(writer.quarantine(tmpfs)?);
            }
            return Ok(if quarantined.is_empty() {
                RepairOutcome::AlreadyUnsynced
            } else {
                RepairOutcome::Repaired {
                    recovered_from: Location::Live,
                    quarantined,
                }
            });
        }

        if l != PhysEntry::Absent && l != PhysEntry::Symlink {
            return Err(ActionErrorKind::CorruptedState {
                path: live.to_path_buf(),
                detail: format!("live slot is neither directory, symlink, nor absent ({l:?})"),
            });
        }

        let mut repaired = false;

        // Rule 2: reconcile B and T so both hold the same directory.
        match (b, t) {
            (PhysEntry::Dir, PhysEntry::Dir) => {}
            (PhysEntry::Dir, PhysEntry::Absent) => {
                if self.overlay_mode {
                    // T is materialized by mounting the overlay, not by a
                    // plain copy; leave it absent for the orchestrator.
                } else {
                    self.copier.copy_tree(backup, tmpfs, false)?;
                    t = PhysEntry::Dir;
                    repaired = true;
                }
            }
            (PhysEntry::Absent, PhysEntry::Dir) => {
                if self.overlay_mode {
                    return Err(ActionErrorKind::CorruptedState {
                        path: backup.to_path_buf(),
                        detail: "cannot reconstruct backup from tmpfs while overlay is mounted".to_string(),
                    });
                }
                self.copier.copy_tree(tmpfs, backup, false)?;
                b = PhysEntry::Dir;
                repaired = true;
            }
            (PhysEntry::Absent, PhysEntry::Absent) => {}
            _ => {
                return Err(ActionErrorKind::CorruptedState {
                    path: backup.to_path_buf(),
                    detail: format!("backup/tmpfs pair cannot be reconciled (B={b:?}, T={t:?})"),
                });
            }
        }

        // Rule 3: restore the symlink.
        if t == PhysEntry::Dir && l == PhysEntry::Absent {
            std::os::unix::fs::symlink(tmpfs, live).map_err(|e| ActionErrorKind::io(live, "symlink", e))?;
            return Ok(RepairOutcome::Repaired {
                recovered_from: Location::Tmpfs,
                quarantined: Vec::new(),
            });
        }

        if l == PhysEntry::Symlink {
            let mut target = std::fs::read_link(live).map_err(|e| ActionErrorKind::io(live, "readlink", e))?;
            if target != *tmpfs {
                // Bounded loop of 2 iterations: unlink and recreate, then
                // re-check once. Never an unbounded retry.
                for _ in 0..2 {
                    if target == *tmpfs {
                        break;
                    }
                    warn!(live = %live.display(), "live symlink target mismatch, relinking to tmpfs");
                    std::fs::remove_file(live).map_err(|e| ActionErrorKind::io(live, "unlink", e))?;
                    std::os::unix::fs::symlink(tmpfs, live).map_err(|e| ActionErrorKind::io(live, "symlink", e))?;
                    target = std::fs::read_link(live).map_err(|e| ActionErrorKind::io(live, "readlink", e))?;
                }
                repaired = true;
            }

            if b == PhysEntry::Dir && t == PhysEntry::Dir {
                return Ok(if repaired {
                    RepairOutcome::Repaired {
                        recovered_from: Location::Backup,
                        quarantined: Vec::new(),
                    }
                } else {
                    RepairOutcome::AlreadySynced
                });
            }

            return Err(ActionErrorKind::CorruptedState {
                path: live.to_path_buf(),
                detail: format!("live is a symlink but backup/tmpfs are incomplete (B={b:?}, T={t:?})"),
            });
        }

        if l == PhysEntry::Absent && b == PhysEntry::Absent && t == PhysEntry::Absent {
            return Ok(RepairOutcome::AllAbsent);
        }

        // L absent, T absent, B present only in overlay mode: a valid
        // resting state pending the orchestrator's overlay mount, which
        // will materialize T and let a subsequent repair finish rule 3.
        if l == PhysEntry::Absent && t == PhysEntry::Absent && b == PhysEntry::Dir && self.overlay_mode {
            return Ok(RepairOutcome::AlreadyUnsynced);
        }

        Err(ActionErrorKind::CorruptedState {
            path: live.to_path_buf(),
            detail: format!("no repair rule applies (L={l:?}, B={b:?}, T={t:?})"),
        })
    }
}
