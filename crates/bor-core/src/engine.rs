//! Per-directory state transitions: `sync`, `unsync`, `resync`,
//! `clear-cache`.
//!
//! Every entry point runs [`crate::repair::StateRepairer`] first so it
//! never has to reason about a crash-interrupted state itself — by the
//! time engine logic runs, the directory is known to be in one of the two
//! canonical forms (or the overlay-pending resting state documented on
//! [`crate::repair::RepairOutcome`]).

use std::path::{Path, PathBuf};

use tracing::{info, instrument};

use crate::error::ActionErrorKind;
use crate::fs_adapter::{self, PhysEntry, TreeCopier};
use crate::model::{Dir, DirKind, Roots};
use crate::path_resolver::{self, ResolvedPaths};
use crate::process_probe::ProcessProbe;
use crate::repair::StateRepairer;

/// Why a directory was left untouched by an action, rather than acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CacheDisabled,
    BrowserRunning,
    AlreadySynced,
    AlreadyUnsynced,
    NothingToResync,
    OverlayUnchanged,
    NotCache,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::CacheDisabled => "cache directories are disabled in config",
            SkipReason::BrowserRunning => "browser is running and require_browser_stopped is set",
            SkipReason::AlreadySynced => "already synced",
            SkipReason::AlreadyUnsynced => "already unsynced",
            SkipReason::NothingToResync => "nothing to resync",
            SkipReason::OverlayUnchanged => "overlay upper has no changes for this directory",
            SkipReason::NotCache => "clear-cache only applies to Cache directories",
        };
        f.write_str(s)
    }
}

/// Result of running one action against one [`Dir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirOutcome {
    Synced,
    Unsynced,
    Resynced,
    Cleared,
    Skipped(SkipReason),
}

/// The subset of `bor-config`'s `Config` the engine consults per action.
/// Kept narrow so `bor-core` does not depend on the `ini`-parsing crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    pub enable_cache: bool,
    pub resync_cache: bool,
    pub require_browser_stopped: bool,
    /// Whether the orchestrator has overlay mode active for this session.
    pub overlay_mode: bool,
}

pub struct DirectoryEngine<'a> {
    copier: &'a dyn TreeCopier,
    probe: &'a dyn ProcessProbe,
    options: EngineOptions,
}

impl<'a> DirectoryEngine<'a> {
    pub fn new(copier: &'a dyn TreeCopier, probe: &'a dyn ProcessProbe, options: EngineOptions) -> Self {
        DirectoryEngine { copier, probe, options }
    }

    fn repair(&self, dir: &Dir, paths: &ResolvedPaths) -> Result<(), ActionErrorKind> {
        if !fs_adapter::is_safe(dir.path(), dir.parent_path())? {
            return Err(ActionErrorKind::SafetyViolation { path: dir.path().to_path_buf() });
        }
        let repairer = StateRepairer::new(self.copier, self.options.overlay_mode);
        let outcome = repairer.repair(dir.path(), paths)?;
        info!(path = %dir.path().display(), outcome = ?outcome, "pre-action repair");
        Ok(())
    }

    fn absorb_tmpfs_into_backup(&self, paths: &ResolvedPaths) -> Result<(), ActionErrorKind> {
        self.copier.copy_tree(&paths.tmpfs, &paths.backup, false)
    }

    /// Moves `dir`'s content into a tmpfs working copy and points the live
    /// path at it via an atomic symlink swap, archiving the displaced
    /// original under the backup slot.
    #[instrument(skip(self, dir, roots), fields(path = %dir.path().display()))]
    pub fn sync(&self, dir: &Dir, roots: &Roots) -> Result<DirOutcome, ActionErrorKind> {
        if dir.kind() == DirKind::Cache && !self.options.enable_cache {
            return Ok(DirOutcome::Skipped(SkipReason::CacheDisabled));
        }
        if self.options.require_browser_stopped && self.probe.is_running(dir.procname()) {
            return Ok(DirOutcome::Skipped(SkipReason::BrowserRunning));
        }

        let paths = path_resolver::resolve(dir, roots);
        self.repair(dir, &paths)?;

        let live = dir.path();
        let live_kind = fs_adapter::classify(live).map_err(|e| ActionErrorKind::io(live, "lstat", e))?;
        if live_kind == PhysEntry::Symlink {
            return Ok(DirOutcome::Skipped(SkipReason::AlreadySynced));
        }

        if live_kind == PhysEntry::Absent {
            // Overlay-mode resting state: backup holds the data, live was
            // never recreated. Promote it.
            let backup_kind = fs_adapter::classify(&paths.backup).map_err(|e| ActionErrorKind::io(&paths.backup, "lstat", e))?;
            if backup_kind == PhysEntry::Dir {
                fs_adapter::move_tree(&paths.backup, live, false, self.copier)?;
            } else {
                fs_adapter::ensure_dir_mode(live, 0o700).map_err(|e| ActionErrorKind::io(live, "mkdir", e))?;
            }
        }

        if !self.options.overlay_mode {
            let tmpfs_kind = fs_adapter::classify(&paths.tmpfs).map_err(|e| ActionErrorKind::io(&paths.tmpfs, "lstat", e))?;
            if tmpfs_kind == PhysEntry::Absent {
                fs_adapter::ensure_dir_mode(&paths.tmpfs, 0o700).map_err(|e| ActionErrorKind::io(&paths.tmpfs, "mkdir", e))?;
                self.copier.copy_tree(live, &paths.tmpfs, false)?;
            }
        }

        let sibling = fs_adapter::unique_path(&sibling_base(live))?;
        std::os::unix::fs::symlink(&paths.tmpfs, &sibling).map_err(|e| ActionErrorKind::io(&sibling, "symlink", e))?;
        fs_adapter::atomic_swap(live, &sibling)?;
        // live is now the symlink -> tmpfs; `sibling` holds the displaced
        // original directory.
        fs_adapter::move_tree(&sibling, &paths.backup, false, self.copier)?;

        if !self.options.overlay_mode && self.probe.is_running(dir.procname()) {
            // Narrow the race between the initial copy and the swap: a
            // write landing in the original directory right before the
            // swap is now in `backup`; fold it into `tmpfs` too.
            self.copier.copy_tree(&paths.backup, &paths.tmpfs, false)?;
        }

        info!(path = %live.display(), "synced to tmpfs");
        Ok(DirOutcome::Synced)
    }

    /// Commits the tmpfs working copy back to disk as the live directory.
    /// `sync` immediately followed by `unsync` with no intervening writes
    /// is the identity transformation.
    #[instrument(skip(self, dir, roots), fields(path = %dir.path().display()))]
    pub fn unsync(&self, dir: &Dir, roots: &Roots) -> Result<DirOutcome, ActionErrorKind> {
        let paths = path_resolver::resolve(dir, roots);
        self.repair(dir, &paths)?;

        let live = dir.path();
        let live_kind = fs_adapter::classify(live).map_err(|e| ActionErrorKind::io(live, "lstat", e))?;
        if live_kind != PhysEntry::Symlink {
            return Ok(DirOutcome::Skipped(SkipReason::AlreadyUnsynced));
        }

        let tmpfs_kind = fs_adapter::classify(&paths.tmpfs).map_err(|e| ActionErrorKind::io(&paths.tmpfs, "lstat", e))?;
        if tmpfs_kind == PhysEntry::Dir {
            self.absorb_tmpfs_into_backup(&paths)?;
        }

        fs_adapter::atomic_swap(live, &paths.backup)?;
        // live is now the real directory (was backup's content); backup
        // now names the displaced, now-useless symlink.
        std::fs::remove_file(&paths.backup).map_err(|e| ActionErrorKind::io(&paths.backup, "unlink", e))?;

        if self.probe.is_running(dir.procname()) {
            self.copier.copy_tree(&paths.tmpfs, live, false)?;
        }

        if !self.options.overlay_mode {
            fs_adapter::remove_tree(&paths.tmpfs)?;
        }

        info!(path = %live.display(), "unsynced to disk");
        Ok(DirOutcome::Unsynced)
    }

    /// Flushes the current tmpfs session into the backup without tearing
    /// down the live symlink. A no-op when the directory was never
    /// synced, or (overlay mode) when nothing has changed since the last
    /// resync.
    #[instrument(skip(self, dir, roots), fields(path = %dir.path().display()))]
    pub fn resync(&self, dir: &Dir, roots: &Roots) -> Result<DirOutcome, ActionErrorKind> {
        if dir.kind() == DirKind::Cache && !self.options.resync_cache {
            return Ok(DirOutcome::Skipped(SkipReason::CacheDisabled));
        }

        let paths = path_resolver::resolve(dir, roots);
        self.repair(dir, &paths)?;

        let tmpfs_kind = fs_adapter::classify(&paths.tmpfs).map_err(|e| ActionErrorKind::io(&paths.tmpfs, "lstat", e))?;
        if tmpfs_kind != PhysEntry::Dir {
            return Ok(DirOutcome::Skipped(SkipReason::NothingToResync));
        }

        if self.options.overlay_mode {
            let upper = &paths.overlay_upper;
            let unchanged = !upper.is_dir()
                || std::fs::read_dir(upper)
                    .map_err(|e| ActionErrorKind::io(upper, "readdir", e))?
                    .next()
                    .is_none();
            if unchanged {
                return Ok(DirOutcome::Skipped(SkipReason::OverlayUnchanged));
            }
        }

        self.absorb_tmpfs_into_backup(&paths)?;
        info!(path = %dir.path().display(), "resynced to backup");
        Ok(DirOutcome::Resynced)
    }

    /// Empties a `Cache` directory's content wherever it currently lives:
    /// tmpfs, then backup, then live (in that order — reversing it
    /// produces whiteout artifacts on overlayfs).
    #[instrument(skip(self, dir, roots), fields(path = %dir.path().display()))]
    pub fn clear_cache(&self, dir: &Dir, roots: &Roots) -> Result<DirOutcome, ActionErrorKind> {
        if dir.kind() != DirKind::Cache {
            tracing::warn!(path = %dir.path().display(), "clear-cache requested on a non-Cache directory");
            return Ok(DirOutcome::Skipped(SkipReason::NotCache));
        }

        let paths = path_resolver::resolve(dir, roots);
        self.repair(dir, &paths)?;

        fs_adapter::empty_dir(&paths.tmpfs)?;
        fs_adapter::empty_dir(&paths.backup)?;
        fs_adapter::empty_dir(dir.path())?;

        info!(path = %dir.path().display(), "cache cleared");
        Ok(DirOutcome::Cleared)
    }
}

fn sibling_base(live: &Path) -> PathBuf {
    let mut os = live.as_os_str().to_os_string();
    os.push("-bor-swap");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_adapter::StdCopier;
    use crate::model::{Dir, DirKind};
    use crate::process_probe::FakeProcessProbe;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn roots_for(base: &Path) -> Roots {
        Roots {
            runtime: base.join("runtime"),
            tmpfs: base.join("runtime/tmpfs"),
            backups: base.join("config/backups"),
            overlay_upper: base.join("runtime/upper"),
            overlay_work: base.join("runtime/work"),
            config: base.join("config"),
            share: base.join("share"),
        }
    }

    #[test]
    fn sync_then_unsync_round_trips_to_original_content() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("xxx");
        std::fs::create_dir(&live).unwrap();
        std::fs::write(live.join("marker"), b"hello").unwrap();

        let dir = Dir::new(&live, DirKind::Profile, "firefox").unwrap();
        let roots = roots_for(tmp.path());

        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let engine = DirectoryEngine::new(&copier, &probe, EngineOptions::default());

        let outcome = engine.sync(&dir, &roots).unwrap();
        assert_eq!(outcome, DirOutcome::Synced);
        assert_eq!(fs_adapter::classify(&live).unwrap(), PhysEntry::Symlink);
        assert_eq!(std::fs::read(live.join("marker")).unwrap(), b"hello");

        let outcome = engine.unsync(&dir, &roots).unwrap();
        assert_eq!(outcome, DirOutcome::Unsynced);
        assert_eq!(fs_adapter::classify(&live).unwrap(), PhysEntry::Dir);
        assert_eq!(std::fs::read(live.join("marker")).unwrap(), b"hello");

        let paths = path_resolver::resolve(&dir, &roots);
        assert!(!paths.backup.exists());
        assert!(!paths.tmpfs.exists());
    }

    #[test]
    fn sync_is_idempotent() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("xxx");
        std::fs::create_dir(&live).unwrap();

        let dir = Dir::new(&live, DirKind::Profile, "firefox").unwrap();
        let roots = roots_for(tmp.path());
        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let engine = DirectoryEngine::new(&copier, &probe, EngineOptions::default());

        engine.sync(&dir, &roots).unwrap();
        assert_eq!(
            engine.sync(&dir, &roots).unwrap(),
            DirOutcome::Skipped(SkipReason::AlreadySynced)
        );
    }

    #[test]
    fn resync_is_a_no_op_before_any_sync() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("xxx");
        std::fs::create_dir(&live).unwrap();

        let dir = Dir::new(&live, DirKind::Profile, "firefox").unwrap();
        let roots = roots_for(tmp.path());
        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let engine = DirectoryEngine::new(&copier, &probe, EngineOptions::default());

        assert_eq!(
            engine.resync(&dir, &roots).unwrap(),
            DirOutcome::Skipped(SkipReason::NothingToResync)
        );
    }

    #[test]
    fn sync_resync_unsync_round_trips_to_original_content() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("xxx");
        std::fs::create_dir(&live).unwrap();
        std::fs::write(live.join("marker"), b"hello").unwrap();

        let dir = Dir::new(&live, DirKind::Profile, "firefox").unwrap();
        let roots = roots_for(tmp.path());
        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let engine = DirectoryEngine::new(&copier, &probe, EngineOptions::default());

        engine.sync(&dir, &roots).unwrap();
        let paths = path_resolver::resolve(&dir, &roots);
        std::fs::write(paths.tmpfs.join("during-session"), b"new").unwrap();

        assert_eq!(engine.resync(&dir, &roots).unwrap(), DirOutcome::Resynced);
        assert_eq!(std::fs::read(paths.backup.join("during-session")).unwrap(), b"new");

        engine.unsync(&dir, &roots).unwrap();
        assert_eq!(std::fs::read(live.join("marker")).unwrap(), b"hello");
        assert_eq!(std::fs::read(live.join("during-session")).unwrap(), b"new");
    }

    #[test]
    fn sync_skips_when_browser_must_be_stopped_and_is_running() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("xxx");
        std::fs::create_dir(&live).unwrap();

        let dir = Dir::new(&live, DirKind::Profile, "firefox").unwrap();
        let roots = roots_for(tmp.path());
        let copier = StdCopier;
        let mut probe = FakeProcessProbe::default();
        probe.running.insert("firefox".to_string());
        let engine = DirectoryEngine::new(
            &copier,
            &probe,
            EngineOptions { require_browser_stopped: true, ..Default::default() },
        );

        assert_eq!(
            engine.sync(&dir, &roots).unwrap(),
            DirOutcome::Skipped(SkipReason::BrowserRunning)
        );
        assert_eq!(fs_adapter::classify(&live).unwrap(), PhysEntry::Dir);
    }

    #[test]
    fn sync_rejects_unsafe_directory() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("xxx");
        std::fs::create_dir(&live).unwrap();
        std::fs::set_permissions(&live, std::fs::Permissions::from_mode(0o644)).unwrap();

        let dir = Dir::new(&live, DirKind::Profile, "firefox").unwrap();
        let roots = roots_for(tmp.path());
        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let engine = DirectoryEngine::new(&copier, &probe, EngineOptions::default());

        let err = engine.sync(&dir, &roots).unwrap_err();
        assert!(matches!(err, ActionErrorKind::SafetyViolation { .. }));
    }

    #[test]
    fn cache_dirs_are_skipped_when_disabled() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("cache");
        std::fs::create_dir(&live).unwrap();

        let dir = Dir::new(&live, DirKind::Cache, "firefox").unwrap();
        let roots = roots_for(tmp.path());
        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let engine = DirectoryEngine::new(&copier, &probe, EngineOptions::default());

        assert_eq!(
            engine.sync(&dir, &roots).unwrap(),
            DirOutcome::Skipped(SkipReason::CacheDisabled)
        );
    }

    #[test]
    fn clear_cache_only_applies_to_cache_kind() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("xxx");
        std::fs::create_dir(&live).unwrap();

        let dir = Dir::new(&live, DirKind::Profile, "firefox").unwrap();
        let roots = roots_for(tmp.path());
        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let engine = DirectoryEngine::new(&copier, &probe, EngineOptions::default());

        assert_eq!(
            engine.clear_cache(&dir, &roots).unwrap(),
            DirOutcome::Skipped(SkipReason::NotCache)
        );
    }

    #[test]
    fn clear_cache_empties_unsynced_cache_dir() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("cache");
        std::fs::create_dir(&live).unwrap();
        std::fs::write(live.join("junk"), b"data").unwrap();

        let dir = Dir::new(&live, DirKind::Cache, "firefox").unwrap();
        let roots = roots_for(tmp.path());
        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let engine = DirectoryEngine::new(&copier, &probe, EngineOptions::default());

        let outcome = engine.clear_cache(&dir, &roots).unwrap();
        assert_eq!(outcome, DirOutcome::Cleared);
        assert!(live.is_dir());
        assert_eq!(std::fs::read_dir(&live).unwrap().count(), 0);
    }

    #[test]
    fn clear_cache_empties_synced_cache_dir_through_tmpfs() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("cache");
        std::fs::create_dir(&live).unwrap();

        let dir = Dir::new(&live, DirKind::Cache, "firefox").unwrap();
        let roots = roots_for(tmp.path());
        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let engine = DirectoryEngine::new(
            &copier,
            &probe,
            EngineOptions { enable_cache: true, ..Default::default() },
        );

        engine.sync(&dir, &roots).unwrap();
        let paths = path_resolver::resolve(&dir, &roots);
        std::fs::write(paths.tmpfs.join("junk"), b"data").unwrap();

        let outcome = engine.clear_cache(&dir, &roots).unwrap();
        assert_eq!(outcome, DirOutcome::Cleared);
        assert_eq!(std::fs::read_dir(&paths.tmpfs).unwrap().count(), 0);
    }
}
