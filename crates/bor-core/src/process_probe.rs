//! "Is this browser currently running?" check, used to gate `sync`/`resync`
//! against disturbing a live process's open file descriptors when
//! `require_browser_stopped` is set.
//!
//! Scans the process table directly via the `sysinfo` crate rather than
//! shelling out to `pgrep`.

use sysinfo::System;

pub trait ProcessProbe: Send + Sync {
    /// Whether any running process's name matches `procname`.
    fn is_running(&self, procname: &str) -> bool;
}

/// Production [`ProcessProbe`] backed by a fresh `sysinfo` process-table
/// snapshot on every call. Re-snapshotting per call (rather than caching)
/// keeps this cheap-but-correct: sessions are short-lived CLI invocations,
/// not long-running daemons, so staleness is a bigger risk than the cost
/// of a rescan.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn is_running(&self, procname: &str) -> bool {
        let mut system = System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        system
            .processes()
            .values()
            .any(|p| p.name().to_string_lossy() == procname)
    }
}

#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default, Clone)]
pub struct FakeProcessProbe {
    pub running: std::collections::HashSet<String>,
}

#[cfg(any(test, feature = "test-util"))]
impl ProcessProbe for FakeProcessProbe {
    fn is_running(&self, procname: &str) -> bool {
        self.running.contains(procname)
    }
}
