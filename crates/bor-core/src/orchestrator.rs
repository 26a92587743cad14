//! Top-level session actions: runs [`crate::engine::DirectoryEngine`] over
//! every managed directory across every configured browser, owns the
//! overlay mount/unmount/reset lifecycle around that work, and the
//! whole-session `clean`/`status` actions that have no per-directory
//! engine counterpart.

use std::path::PathBuf;

use tracing::{error, info, instrument, warn};

use crate::engine::{DirOutcome, DirectoryEngine, EngineOptions};
use crate::error::ActionErrorKind;
use crate::fs_adapter::{self, PhysEntry, TreeCopier};
use crate::model::{Browser, Roots};
use crate::overlay::{self, OverlayController};
use crate::path_resolver;
use crate::process_probe::ProcessProbe;
use crate::recovery;

/// Outcome of running one action against one directory, with enough
/// context (browser name, path) for the CLI to render a report line.
#[derive(Debug, Clone)]
pub struct DirResult {
    pub browser: String,
    pub path: PathBuf,
    pub outcome: Result<DirOutcome, String>,
}

/// Outcome of a whole-session action across every managed directory.
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    pub results: Vec<DirResult>,
}

impl SessionOutcome {
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Ok(DirOutcome::Synced | DirOutcome::Unsynced | DirOutcome::Resynced | DirOutcome::Cleared)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Ok(DirOutcome::Skipped(_))))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_err()).count()
    }
}

/// Point-in-time description of one managed directory, for `status`.
#[derive(Debug, Clone)]
pub struct DirStatus {
    pub browser: String,
    pub path: PathBuf,
    pub synced: bool,
    pub live: PhysEntry,
    pub backup: PhysEntry,
    pub tmpfs: PhysEntry,
}

/// The subset of `bor-config`'s INI-derived `Config` the orchestrator
/// needs, plus the derived `overlay_mode` decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    pub enable_overlay: bool,
    pub enable_cache: bool,
    pub resync_cache: bool,
    pub reset_overlay: bool,
    pub require_browser_stopped: bool,
}

pub struct SessionOrchestrator<'a> {
    engine: DirectoryEngine<'a>,
    overlay: OverlayController,
    overlay_mode: bool,
    reset_overlay: bool,
    roots: &'a Roots,
    browsers: &'a [Browser],
}

impl<'a> SessionOrchestrator<'a> {
    pub fn new(
        copier: &'a dyn TreeCopier,
        probe: &'a dyn ProcessProbe,
        roots: &'a Roots,
        browsers: &'a [Browser],
        config: SessionConfig,
    ) -> Self {
        let overlay_mode = if config.enable_overlay {
            if overlay::has_required_caps() {
                true
            } else {
                warn!("enable_overlay is set but CAP_SYS_ADMIN/CAP_DAC_OVERRIDE are not permitted; continuing with plain tmpfs copies");
                false
            }
        } else {
            false
        };

        let options = EngineOptions {
            enable_cache: config.enable_cache,
            resync_cache: config.resync_cache,
            require_browser_stopped: config.require_browser_stopped,
            overlay_mode,
        };

        SessionOrchestrator {
            engine: DirectoryEngine::new(copier, probe, options),
            overlay: OverlayController,
            overlay_mode,
            reset_overlay: config.reset_overlay,
            roots,
            browsers,
        }
    }

    fn run_action<F>(&self, action: &'static str, f: F) -> Result<SessionOutcome, ActionErrorKind>
    where
        F: Fn(&DirectoryEngine<'a>, &crate::model::Dir, &Roots) -> Result<DirOutcome, ActionErrorKind>,
    {
        let mut outcome = SessionOutcome::default();
        for browser in self.browsers {
            for dir in browser.dirs() {
                let result = f(&self.engine, dir, self.roots);
                if let Err(e) = &result {
                    if e.is_fatal() {
                        error!(action, browser = browser.name(), path = %dir.path().display(), error = %e, "fatal error, aborting session");
                        return Err(ActionErrorKind::FatalSystem(anyhow::anyhow!("{e}")));
                    }
                    error!(action, browser = browser.name(), path = %dir.path().display(), error = %e, "action failed for directory");
                }
                outcome.results.push(DirResult {
                    browser: browser.name().to_string(),
                    path: dir.path().to_path_buf(),
                    outcome: result.map_err(|e| e.to_string()),
                });
            }
        }
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub fn sync_all(&self) -> Result<SessionOutcome, ActionErrorKind> {
        self.roots.ensure_created().map_err(ActionErrorKind::FatalSystem)?;

        if self.overlay_mode && self.overlay.mounted(&self.roots.tmpfs)? {
            return Err(ActionErrorKind::FatalSystem(anyhow::anyhow!(
                "overlay is already mounted at {}",
                self.roots.tmpfs.display()
            )));
        }

        let outcome = self.run_action("sync", |engine, dir, roots| engine.sync(dir, roots))?;

        if self.overlay_mode
            && outcome.succeeded() > 0
            && !self.overlay.mounted(&self.roots.tmpfs)?
        {
            self.overlay.mount(self.roots)?;
        }

        info!(synced = outcome.succeeded(), skipped = outcome.skipped(), failed = outcome.failed(), "sync complete");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub fn unsync_all(&self) -> Result<SessionOutcome, ActionErrorKind> {
        let outcome = self.run_action("unsync", |engine, dir, roots| engine.unsync(dir, roots))?;

        if self.overlay.mounted(&self.roots.tmpfs)? {
            self.overlay.unmount(self.roots)?;
        }

        for root in [&self.roots.backups, &self.roots.tmpfs] {
            if let Ok(mut entries) = std::fs::read_dir(root) {
                if entries.next().is_some() {
                    warn!(root = %root.display(), "unmanaged leftovers remain after unsync");
                }
            }
        }

        let snapshot = self.roots.config.join(".bor.conf");
        let _ = std::fs::remove_file(snapshot);

        info!(unsynced = outcome.succeeded(), skipped = outcome.skipped(), failed = outcome.failed(), "unsync complete");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub fn resync_all(&self) -> Result<SessionOutcome, ActionErrorKind> {
        let outcome = self.run_action("resync", |engine, dir, roots| engine.resync(dir, roots))?;

        if self.reset_overlay && self.overlay_mode {
            let resynced_any = outcome
                .results
                .iter()
                .any(|r| matches!(r.outcome, Ok(DirOutcome::Resynced)));
            if resynced_any {
                let pairs: Vec<(&crate::model::Dir, std::path::PathBuf)> = self
                    .browsers
                    .iter()
                    .flat_map(|b| b.dirs())
                    .map(|d| {
                        let paths = path_resolver::resolve(d, self.roots);
                        (d, paths.backup)
                    })
                    .collect();
                let refs: Vec<(&crate::model::Dir, &std::path::Path)> =
                    pairs.iter().map(|(d, b)| (*d, b.as_path())).collect();
                self.overlay.reset(self.roots, &refs)?;
            }
        }

        info!(resynced = outcome.succeeded(), skipped = outcome.skipped(), failed = outcome.failed(), "resync complete");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub fn clear_cache_all(&self) -> Result<SessionOutcome, ActionErrorKind> {
        let outcome = self.run_action("clear-cache", |engine, dir, roots| engine.clear_cache(dir, roots))?;
        info!(cleared = outcome.succeeded(), skipped = outcome.skipped(), failed = outcome.failed(), "clear-cache complete");
        Ok(outcome)
    }

    /// Removes every `bor-crash_*` quarantine entry left next to a managed
    /// directory. Deduplicates parent directories so a browser with
    /// several dirs under the same profile root isn't scanned twice.
    #[instrument(skip(self))]
    pub fn clean(&self) -> Result<usize, ActionErrorKind> {
        let mut parents: Vec<PathBuf> = self
            .browsers
            .iter()
            .flat_map(|b| b.dirs())
            .map(|d| d.parent_path().to_path_buf())
            .collect();
        parents.sort();
        parents.dedup();

        let mut total = 0;
        for parent in parents {
            total += recovery::clean_quarantined(&parent)?;
        }
        Ok(total)
    }

    /// Reports the physical state of every managed directory without
    /// mutating anything.
    #[instrument(skip(self))]
    pub fn status(&self) -> Result<Vec<DirStatus>, ActionErrorKind> {
        let mut statuses = Vec::new();
        for browser in self.browsers {
            for dir in browser.dirs() {
                let paths = path_resolver::resolve(dir, self.roots);
                let live = fs_adapter::classify(dir.path()).map_err(|e| ActionErrorKind::io(dir.path(), "lstat", e))?;
                let backup =
                    fs_adapter::classify(&paths.backup).map_err(|e| ActionErrorKind::io(&paths.backup, "lstat", e))?;
                let tmpfs =
                    fs_adapter::classify(&paths.tmpfs).map_err(|e| ActionErrorKind::io(&paths.tmpfs, "lstat", e))?;
                statuses.push(DirStatus {
                    browser: browser.name().to_string(),
                    path: dir.path().to_path_buf(),
                    synced: live == PhysEntry::Symlink,
                    live,
                    backup,
                    tmpfs,
                });
            }
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_adapter::StdCopier;
    use crate::model::{Dir, DirKind};
    use crate::process_probe::FakeProcessProbe;
    use tempfile::tempdir;

    fn roots_for(base: &std::path::Path) -> Roots {
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
    fn sync_all_reports_per_directory_outcomes() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("xxx");
        std::fs::create_dir(&live).unwrap();
        let dir = Dir::new(&live, DirKind::Profile, "firefox").unwrap();
        let browser = Browser::new("firefox", "firefox", vec![dir]).unwrap();
        let browsers = vec![browser];
        let roots = roots_for(tmp.path());

        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let orchestrator = SessionOrchestrator::new(&copier, &probe, &roots, &browsers, SessionConfig::default());

        let outcome = orchestrator.sync_all().unwrap();
        assert_eq!(outcome.failed(), 0);
        assert_eq!(outcome.succeeded(), 1);
        assert_eq!(outcome.results[0].outcome.as_ref().unwrap(), &DirOutcome::Synced);
    }

    #[test]
    fn status_reports_unsynced_before_any_action() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("xxx");
        std::fs::create_dir(&live).unwrap();
        let dir = Dir::new(&live, DirKind::Profile, "firefox").unwrap();
        let browser = Browser::new("firefox", "firefox", vec![dir]).unwrap();
        let browsers = vec![browser];
        let roots = roots_for(tmp.path());

        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let orchestrator = SessionOrchestrator::new(&copier, &probe, &roots, &browsers, SessionConfig::default());

        let statuses = orchestrator.status().unwrap();
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].synced);
    }

    #[test]
    fn clean_removes_quarantine_entries_across_browsers() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("xxx");
        std::fs::create_dir(&live).unwrap();
        std::fs::create_dir(tmp.path().join("bor-crash_xxx_01-01-70_00:00:00")).unwrap();

        let dir = Dir::new(&live, DirKind::Profile, "firefox").unwrap();
        let browser = Browser::new("firefox", "firefox", vec![dir]).unwrap();
        let browsers = vec![browser];
        let roots = roots_for(tmp.path());

        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let orchestrator = SessionOrchestrator::new(&copier, &probe, &roots, &browsers, SessionConfig::default());

        let removed = orchestrator.clean().unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn unsync_all_after_sync_all_round_trips() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("xxx");
        std::fs::create_dir(&live).unwrap();
        std::fs::write(live.join("marker"), b"hi").unwrap();
        let dir = Dir::new(&live, DirKind::Profile, "firefox").unwrap();
        let browser = Browser::new("firefox", "firefox", vec![dir]).unwrap();
        let browsers = vec![browser];
        let roots = roots_for(tmp.path());

        let copier = StdCopier;
        let probe = FakeProcessProbe::default();
        let orchestrator = SessionOrchestrator::new(&copier, &probe, &roots, &browsers, SessionConfig::default());

        orchestrator.sync_all().unwrap();
        let outcome = orchestrator.unsync_all().unwrap();
        assert_eq!(outcome.succeeded(), 1);
        assert_eq!(std::fs::read(live.join("marker")).unwrap(), b"hi");
    }
}
