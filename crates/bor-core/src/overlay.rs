//! Copy-on-write overlay mount management.
//!
//! A single overlay mount covers the whole `tmpfs` root: `backups` is the
//! lower layer, `overlay_upper`/`overlay_work` the upper/work pair. Once
//! mounted, every per-directory `tmpfs/<hash>_<dirname>` path transparently
//! shows the merged view, so [`crate::engine::DirectoryEngine`] never has
//! to special-case overlay mode — only [`crate::repair::StateRepairer`]
//! (which must never reconstruct the lower from the upper while mounted)
//! and the [`crate::orchestrator::SessionOrchestrator`] (which owns the
//! mount/unmount/reset lifecycle) know about it.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use caps::{CapSet, Capability};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::{instrument, warn};

use crate::error::ActionErrorKind;
use crate::fs_adapter;
use crate::model::{Dir, Roots};

/// Raises a single capability into the effective set for the lifetime of
/// the guard, lowering it again on drop.
struct CapGuard {
    cap: Capability,
}

impl CapGuard {
    fn raise(cap: Capability) -> Result<Self, ActionErrorKind> {
        caps::raise(None, CapSet::Effective, cap)
            .map_err(|_| ActionErrorKind::CapabilityMissing(cap.to_string()))?;
        Ok(CapGuard { cap })
    }

    /// Raises both capabilities overlay mode needs, returning guards that
    /// release them independently (and in reverse order) when dropped.
    fn raise_both(a: Capability, b: Capability) -> Result<(Self, Self), ActionErrorKind> {
        let first = CapGuard::raise(a)?;
        let second = CapGuard::raise(b)?;
        Ok((first, second))
    }
}

impl Drop for CapGuard {
    fn drop(&mut self) {
        if let Err(e) = caps::drop(None, CapSet::Effective, self.cap) {
            warn!(cap = %self.cap, error = %e, "failed to lower capability after use");
        }
    }
}

/// Checks that the two capabilities overlay mode needs are in the
/// process's permitted set, without raising them. Used by the
/// orchestrator to decide up front whether to attempt overlay mode at
/// all; absence demotes to a warning and plain tmpfs copies.
pub fn has_required_caps() -> bool {
    let permitted = |cap: Capability| caps::has_cap(None, CapSet::Permitted, cap).unwrap_or(false);
    permitted(Capability::CAP_SYS_ADMIN) && permitted(Capability::CAP_DAC_OVERRIDE)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OverlayController;

impl OverlayController {
    /// Whether `target` currently has a filesystem mounted on it,
    /// detected by comparing device ids with its parent.
    pub fn mounted(&self, target: &Path) -> Result<bool, ActionErrorKind> {
        let parent = target.parent().ok_or_else(|| ActionErrorKind::CorruptedState {
            path: target.to_path_buf(),
            detail: "mount target has no parent".to_string(),
        })?;
        let target_meta = match std::fs::metadata(target) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(ActionErrorKind::io(target, "stat", e)),
        };
        let parent_meta = std::fs::metadata(parent).map_err(|e| ActionErrorKind::io(parent, "stat", e))?;
        Ok(target_meta.dev() != parent_meta.dev())
    }

    /// Mounts the overlay at `roots.tmpfs`: `lowerdir=roots.backups`,
    /// `upperdir=roots.overlay_upper`, `workdir=roots.overlay_work`.
    /// Refuses if `overlay_upper`, `overlay_work` or `backups` is a
    /// symlink. Idempotent: a no-op if already mounted. Raises both
    /// `CAP_SYS_ADMIN` and `CAP_DAC_OVERRIDE` for the duration of the
    /// `mount(2)` call.
    #[instrument(skip(self, roots))]
    pub fn mount(&self, roots: &Roots) -> Result<(), ActionErrorKind> {
        if self.mounted(&roots.tmpfs)? {
            return Ok(());
        }
        for root in [&roots.backups, &roots.overlay_upper, &roots.overlay_work] {
            if fs_adapter::classify(root).map_err(|e| ActionErrorKind::io(root, "lstat", e))? == fs_adapter::PhysEntry::Symlink {
                return Err(ActionErrorKind::CorruptedState {
                    path: root.to_path_buf(),
                    detail: "overlay backing directory must not be a symlink".to_string(),
                });
            }
        }
        fs_adapter::ensure_dir_mode(&roots.overlay_upper, 0o755)
            .map_err(|e| ActionErrorKind::io(&roots.overlay_upper, "mkdir", e))?;
        fs_adapter::ensure_dir_mode(&roots.overlay_work, 0o755)
            .map_err(|e| ActionErrorKind::io(&roots.overlay_work, "mkdir", e))?;

        let options = format!(
            "index=off,lowerdir={},upperdir={},workdir={}",
            roots.backups.display(),
            roots.overlay_upper.display(),
            roots.overlay_work.display(),
        );

        let _caps = CapGuard::raise_both(Capability::CAP_SYS_ADMIN, Capability::CAP_DAC_OVERRIDE)?;
        mount(
            Some("overlay"),
            &roots.tmpfs,
            Some("overlay"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOATIME,
            Some(options.as_str()),
        )
        .map_err(|errno| {
            ActionErrorKind::FatalSystem(anyhow::anyhow!(
                "mount(overlay) on {}: {}",
                roots.tmpfs.display(),
                std::io::Error::from_raw_os_error(errno as i32)
            ))
        })
    }

    /// Lazily unmounts `roots.tmpfs`, then removes the upper and work
    /// directories' contents (work requires `CAP_DAC_OVERRIDE` since the
    /// kernel owns entries inside it). A no-op if not mounted.
    #[instrument(skip(self, roots))]
    pub fn unmount(&self, roots: &Roots) -> Result<(), ActionErrorKind> {
        if !self.mounted(&roots.tmpfs)? {
            return Ok(());
        }
        {
            let _sys_admin = CapGuard::raise(Capability::CAP_SYS_ADMIN)?;
            umount2(&roots.tmpfs, MntFlags::MNT_DETACH).map_err(|errno| {
                ActionErrorKind::FatalSystem(anyhow::anyhow!(
                    "umount2 on {}: {}",
                    roots.tmpfs.display(),
                    std::io::Error::from_raw_os_error(errno as i32)
                ))
            })?;
        }
        if self.mounted(&roots.tmpfs)? {
            return Err(ActionErrorKind::FatalSystem(anyhow::anyhow!(
                "{} still reports as a distinct filesystem after umount2",
                roots.tmpfs.display()
            )));
        }
        fs_adapter::empty_dir(&roots.overlay_upper)?;
        {
            let _dac_override = CapGuard::raise(Capability::CAP_DAC_OVERRIDE)?;
            fs_adapter::empty_dir(&roots.overlay_work)?;
        }
        Ok(())
    }

    /// Re-points every `dir`'s live symlink to its backup location,
    /// unmounts, remounts fresh, then re-points the symlinks back to
    /// `tmpfs`, using the side-symlink + atomic-swap technique so no
    /// browser observes a broken window. Best-effort while a browser
    /// holding the mountpoint open is still running.
    #[instrument(skip(self, roots, dirs))]
    pub fn reset(&self, roots: &Roots, dirs: &[(&Dir, &Path)]) -> Result<(), ActionErrorKind> {
        for (dir, backup) in dirs {
            repoint(dir.path(), backup)?;
        }
        self.unmount(roots)?;
        self.mount(roots)?;
        for (dir, _backup) in dirs {
            let paths = crate::path_resolver::resolve(dir, roots);
            repoint(dir.path(), &paths.tmpfs)?;
        }
        Ok(())
    }
}

fn repoint(live: &Path, new_target: &Path) -> Result<(), ActionErrorKind> {
    let mut sibling_os = live.as_os_str().to_os_string();
    sibling_os.push("-bor-repoint");
    let sibling = std::path::PathBuf::from(sibling_os);
    std::os::unix::fs::symlink(new_target, &sibling).map_err(|e| ActionErrorKind::io(&sibling, "symlink", e))?;
    fs_adapter::atomic_swap(live, &sibling)?;
    std::fs::remove_file(&sibling).map_err(|e| ActionErrorKind::io(&sibling, "unlink", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mounted_is_false_for_ordinary_directory() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("plain");
        std::fs::create_dir(&dir).unwrap();
        let controller = OverlayController;
        assert!(!controller.mounted(&dir).unwrap());
    }

    #[test]
    fn mounted_is_false_for_absent_path() {
        let tmp = tempdir().unwrap();
        let controller = OverlayController;
        assert!(!controller.mounted(&tmp.path().join("nope")).unwrap());
    }

    // Actually mounting/unmounting requires CAP_SYS_ADMIN + CAP_DAC_OVERRIDE;
    // see `tests/overlay.rs`, `#[ignore]`d by default.
}
