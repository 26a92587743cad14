//! `bor`: relocates browser profile/cache directories onto tmpfs for the
//! duration of a session, backing up and restoring them around it.
//!
//! Thin entry point: parses arguments, builds a [`bor_core::Roots`] and a
//! [`bor_config::Config`], and dispatches to
//! [`bor_core::SessionOrchestrator`]. All state-machine logic lives in
//! `bor-core`; this crate only wires it to the process environment.

use std::process::ExitCode;

use clap::{ArgGroup, Parser};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use bor_config::ShellScriptDescriptorSource;
use bor_core::fs_adapter::RsyncCopier;
use bor_core::orchestrator::SessionConfig;
use bor_core::process_probe::SystemProcessProbe;
use bor_core::{Roots, SessionOrchestrator};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relocate browser directories onto tmpfs for a session")]
#[command(group(
    ArgGroup::new("action")
        .args(["sync", "unsync", "resync", "clean", "rm_cache", "status"])
        .required(true)
))]
struct Args {
    /// Move managed directories onto tmpfs, backing up their content.
    #[arg(short = 's', long)]
    sync: bool,

    /// Commit the tmpfs copy back to disk and restore the backup.
    #[arg(short = 'u', long)]
    unsync: bool,

    /// Flush the tmpfs session into the backup without unsyncing.
    #[arg(short = 'r', long)]
    resync: bool,

    /// Remove crash-recovery (`bor-crash_*`) directories.
    #[arg(short = 'c', long)]
    clean: bool,

    /// Clear cache directories wherever they currently live.
    #[arg(short = 'x', long = "rm-cache")]
    rm_cache: bool,

    /// Print the physical state of every managed directory and exit.
    #[arg(short = 'p', long)]
    status: bool,

    /// Enable debug logging.
    #[arg(short = 'V', long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(&args) {
        Ok(ok) => {
            if ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = ?e, "{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<bool> {
    let roots = Roots::from_env()?;
    roots.ensure_created()?;

    let config_path = roots.config.join("bor.conf");
    let (config, browsers) = bor_config::load(&config_path, &ShellScriptDescriptorSource)?;

    let session_config = SessionConfig {
        enable_overlay: config.enable_overlay,
        enable_cache: config.enable_cache,
        resync_cache: config.resync_cache,
        reset_overlay: config.reset_overlay,
        require_browser_stopped: config.require_browser_stopped,
    };

    let copier = RsyncCopier;
    let probe = SystemProcessProbe;
    let orchestrator = SessionOrchestrator::new(&copier, &probe, &roots, &browsers, session_config);

    if args.status {
        for status in orchestrator.status()? {
            println!(
                "{:<16} {} synced={} live={:?} backup={:?} tmpfs={:?}",
                status.browser,
                status.path.display(),
                status.synced,
                status.live,
                status.backup,
                status.tmpfs,
            );
        }
        return Ok(true);
    }

    if args.clean {
        let removed = orchestrator.clean()?;
        println!("removed {removed} quarantined director{}", if removed == 1 { "y" } else { "ies" });
        return Ok(true);
    }

    if args.rm_cache {
        let outcome = orchestrator.clear_cache_all()?;
        return Ok(report(&outcome, "clear-cache"));
    }

    if args.sync {
        snapshot_config(&roots, &config_path);
        let outcome = orchestrator.sync_all()?;
        return Ok(report(&outcome, "sync"));
    }

    if args.unsync {
        let outcome = orchestrator.unsync_all()?;
        return Ok(report(&outcome, "unsync"));
    }

    if args.resync {
        let outcome = orchestrator.resync_all()?;
        return Ok(report(&outcome, "resync"));
    }

    unreachable!("clap's ArgGroup(required) guarantees one action flag is set")
}

fn report(outcome: &bor_core::SessionOutcome, action: &str) -> bool {
    for result in &outcome.results {
        match &result.outcome {
            Ok(o) => println!("{action} {}: {:?}", result.path.display(), o),
            Err(e) => println!("{action} {}: FAILED: {e}", result.path.display()),
        }
    }
    outcome.failed() == 0
}

/// Copies `bor.conf` to `.bor.conf` at sync-start: an immutable snapshot
/// of the config that produced this session. Best-effort; a snapshot
/// failure is not worth aborting sync.
fn snapshot_config(roots: &Roots, config_path: &std::path::Path) {
    let snapshot = roots.config.join(".bor.conf");
    if let Err(e) = std::fs::copy(config_path, &snapshot) {
        warn!(error = %e, "failed to snapshot bor.conf at sync-start");
    }
}
