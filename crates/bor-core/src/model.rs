//! Data model: [`Dir`], [`Browser`] and [`Roots`], the process-wide paths a
//! session is built from.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Upper bound on configured browsers. Lifting it is a one-line change.
pub const MAX_BROWSERS: usize = 100;
/// Upper bound on directories per browser. Lifting it is a one-line change.
pub const MAX_DIRS_PER_BROWSER: usize = 100;

/// What a managed directory is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirKind {
    Profile,
    Cache,
}

impl DirKind {
    pub fn is_cache(self) -> bool {
        matches!(self, DirKind::Cache)
    }
}

/// A single managed directory: the unit of work for the engine.
///
/// Immutable after construction. `procname` is carried by value rather than
/// through a back-reference to the owning [`Browser`].
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
    parent_path: PathBuf,
    dirname: String,
    kind: DirKind,
    procname: String,
}

impl Dir {
    /// Constructs a `Dir` from a user-facing path, validating that its
    /// parent exists and is a directory.
    pub fn new(path: impl Into<PathBuf>, kind: DirKind, procname: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            bail!("directory path must be absolute: {}", path.display());
        }
        let parent_path = path
            .parent()
            .with_context(|| format!("path has no parent: {}", path.display()))?
            .to_path_buf();
        let parent_meta = fs::metadata(&parent_path)
            .with_context(|| format!("parent does not exist: {}", parent_path.display()))?;
        if !parent_meta.is_dir() {
            bail!("parent is not a directory: {}", parent_path.display());
        }
        let dirname = path
            .file_name()
            .with_context(|| format!("path has no file name: {}", path.display()))?
            .to_string_lossy()
            .into_owned();
        Ok(Dir {
            path,
            parent_path,
            dirname,
            kind,
            procname: procname.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn parent_path(&self) -> &Path {
        &self.parent_path
    }

    pub fn dirname(&self) -> &str {
        &self.dirname
    }

    pub fn kind(&self) -> DirKind {
        self.kind
    }

    pub fn procname(&self) -> &str {
        &self.procname
    }
}

/// A named group of [`Dir`]s plus the process name used for the
/// "is the browser running?" probe.
#[derive(Debug, Clone)]
pub struct Browser {
    name: String,
    procname: String,
    dirs: Vec<Dir>,
}

impl Browser {
    pub fn new(name: impl Into<String>, procname: impl Into<String>, dirs: Vec<Dir>) -> Result<Self> {
        if dirs.len() > MAX_DIRS_PER_BROWSER {
            bail!(
                "browser has {} directories, limit is {}",
                dirs.len(),
                MAX_DIRS_PER_BROWSER
            );
        }
        Ok(Browser {
            name: name.into(),
            procname: procname.into(),
            dirs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn procname(&self) -> &str {
        &self.procname
    }

    pub fn dirs(&self) -> &[Dir] {
        &self.dirs
    }
}

/// Process-wide roots, initialized once and read-only thereafter.
#[derive(Debug, Clone)]
pub struct Roots {
    pub runtime: PathBuf,
    pub tmpfs: PathBuf,
    pub backups: PathBuf,
    pub overlay_upper: PathBuf,
    pub overlay_work: PathBuf,
    pub config: PathBuf,
    pub share: PathBuf,
}

impl Roots {
    /// Derives roots from the environment, applying XDG fallback rules and
    /// writing every resolved value back so child processes (rsync, shell
    /// descriptor scripts) observe the same values this process computed.
    pub fn from_env() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        let uid = nix::unistd::getuid();

        let user = std::env::var("USER").unwrap_or_else(|_| uid.to_string());
        let xdg_config_home = std::env::var("XDG_CONFIG_HOME")
            .unwrap_or_else(|_| format!("{home}/.config"));
        let xdg_cache_home = std::env::var("XDG_CACHE_HOME")
            .unwrap_or_else(|_| format!("{home}/.cache"));
        let xdg_data_home = std::env::var("XDG_DATA_HOME")
            .unwrap_or_else(|_| format!("{home}/.local/share"));
        let xdg_runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| format!("/run/user/{uid}"));

        std::env::set_var("HOME", &home);
        std::env::set_var("USER", &user);
        std::env::set_var("UID", uid.to_string());
        std::env::set_var("XDG_CONFIG_HOME", &xdg_config_home);
        std::env::set_var("XDG_CACHE_HOME", &xdg_cache_home);
        std::env::set_var("XDG_DATA_HOME", &xdg_data_home);
        std::env::set_var("XDG_RUNTIME_DIR", &xdg_runtime_dir);

        let runtime = PathBuf::from(&xdg_runtime_dir).join("bor");
        let config = PathBuf::from(&xdg_config_home).join("bor");

        let share = if Path::new("/usr/share/bor").is_dir() {
            PathBuf::from("/usr/share/bor")
        } else {
            PathBuf::from("/usr/local/share/bor")
        };

        Ok(Roots {
            tmpfs: runtime.join("tmpfs"),
            overlay_upper: runtime.join("upper"),
            overlay_work: runtime.join("work"),
            backups: config.join("backups"),
            runtime,
            config,
            share,
        })
    }

    /// Creates every root directory with mode 0755, idempotently.
    pub fn ensure_created(&self) -> Result<()> {
        for dir in [
            &self.runtime,
            &self.tmpfs,
            &self.backups,
            &self.config,
        ] {
            crate::fs_adapter::ensure_dir_mode(dir, 0o755)
                .with_context(|| format!("creating root {}", dir.display()))?;
        }
        Ok(())
    }
}
