//! The narrow filesystem surface everything else is built on.
//!
//! Tree copying is expressed as a [`TreeCopier`] trait so the rest of the
//! crate never depends on the `rsync` binary directly, separating copy
//! mechanism from the policy that decides when and what to copy.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use rustix::fs::{renameat_with, RenameFlags, CWD};
use walkdir::WalkDir;

use crate::error::ActionErrorKind;

/// The kind of filesystem entry found at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysEntry {
    Absent,
    Symlink,
    Dir,
    Other,
}

/// Classifies the entry at `path` using `lstat` (never follows the final
/// symlink component).
pub fn classify(path: &Path) -> io::Result<PhysEntry> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            let ft = meta.file_type();
            if ft.is_symlink() {
                Ok(PhysEntry::Symlink)
            } else if ft.is_dir() {
                Ok(PhysEntry::Dir)
            } else {
                Ok(PhysEntry::Other)
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PhysEntry::Absent),
        Err(e) => Err(e),
    }
}

/// Returns whether `path` currently names anything at all (including a
/// dangling symlink), using `lstat` rather than `stat` so a broken symlink
/// still counts as occupied.
fn path_occupied(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Recursive, attribute-preserving, idempotent directory copy that leaves
/// `dst` an exact mirror of `src` (entries present in `dst` but absent
/// from `src` are removed).
///
/// `include_root == false` (the common case in this crate, since
/// [`crate::path_resolver`] already computes exact destination paths):
/// copies the *contents* of `src` into `dst`, creating `dst` if needed.
///
/// `include_root == true`: `dst` is treated as a parent directory and `src`
/// is copied into it as `dst/<basename(src)>`.
pub trait TreeCopier: Send + Sync {
    fn copy_tree(&self, src: &Path, dst: &Path, include_root: bool) -> Result<(), ActionErrorKind>;
}

/// Production [`TreeCopier`] backed by `rsync -a -X --delete`, reusing the
/// signal-forwarding child-process runner from [`crate::processes`].
///
/// `rsync -a` is recursive and preserves mode/timestamps; `--delete`
/// removes destination entries no longer present in the source so two
/// copies of the same tree stay byte-for-byte identical across repeated
/// calls, not just additively merged.
#[derive(Debug, Default, Clone, Copy)]
pub struct RsyncCopier;

impl TreeCopier for RsyncCopier {
    fn copy_tree(&self, src: &Path, dst: &Path, include_root: bool) -> Result<(), ActionErrorKind> {
        ensure_dir_mode(dst, 0o755).map_err(|e| ActionErrorKind::io(dst, "mkdir", e))?;

        let mut src_arg = src.to_path_buf();
        if !include_root {
            // Trailing slash tells rsync to copy the directory's contents,
            // not the directory itself, into dst.
            let mut s = src_arg.into_os_string();
            s.push("/");
            src_arg = PathBuf::from(s);
        }

        let mut cmd = Command::new("rsync");
        cmd.arg("-a").arg("-X").arg("--delete").arg("--partial").arg(&src_arg).arg(dst);

        crate::processes::run_and_check(&mut cmd).map_err(|e| ActionErrorKind::TransientIO {
            path: src.to_path_buf(),
            operation: "rsync copy-tree",
            source: io::Error::other(e.to_string()),
        })
    }
}

/// Test-only [`TreeCopier`] implemented with plain `std::fs`, so unit tests
/// that exercise [`crate::repair`]/[`crate::engine`] logic do not depend on
/// an `rsync` binary being on `PATH`.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct StdCopier;

#[cfg(any(test, feature = "test-util"))]
impl TreeCopier for StdCopier {
    fn copy_tree(&self, src: &Path, dst: &Path, include_root: bool) -> Result<(), ActionErrorKind> {
        let root = if include_root {
            let name = src.file_name().ok_or_else(|| ActionErrorKind::CorruptedState {
                path: src.to_path_buf(),
                detail: "source has no file name".to_string(),
            })?;
            dst.join(name)
        } else {
            dst.to_path_buf()
        };
        copy_dir_recursive(src, &root).map_err(|e| ActionErrorKind::io(src, "copy-tree", e))
    }
}

#[cfg(any(test, feature = "test-util"))]
fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    let src_meta = fs::metadata(src)?;
    fs::set_permissions(dst, src_meta.permissions())?;

    let mut seen = std::collections::HashSet::new();
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let from = entry.path();
        let to = dst.join(&name);
        seen.insert(name);
        let ft = entry.file_type()?;
        if ft.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else if ft.is_symlink() {
            let target = fs::read_link(&from)?;
            let _ = fs::remove_file(&to);
            std::os::unix::fs::symlink(&target, &to)?;
        } else {
            fs::copy(&from, &to)?;
            let meta = fs::metadata(&from)?;
            fs::set_permissions(&to, meta.permissions())?;
        }
    }

    // Mirror src exactly: remove any dst entry src no longer has.
    for entry in fs::read_dir(dst)? {
        let entry = entry?;
        if seen.contains(&entry.file_name()) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Attempts `rename(2)`; on cross-device moves (`EXDEV`) falls back to
/// copy-then-remove. Destination must not already exist when
/// `include_root == false`.
pub fn move_tree(
    src: &Path,
    dst: &Path,
    include_root: bool,
    copier: &dyn TreeCopier,
) -> Result<(), ActionErrorKind> {
    if !include_root && path_occupied(dst) {
        return Err(ActionErrorKind::CorruptedState {
            path: dst.to_path_buf(),
            detail: "move-tree destination already exists".to_string(),
        });
    }

    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            copier.copy_tree(src, dst, include_root)?;
            remove_tree(src)
        }
        Err(e) => Err(ActionErrorKind::io(src, "rename", e)),
    }
}

/// Depth-first removal. Forces mode 0700 on every directory before
/// descending/unlinking so an owner-readonly tree left by a crashed prior
/// session can always be torn down.
pub fn remove_tree(path: &Path) -> Result<(), ActionErrorKind> {
    if !path_occupied(path) {
        return Ok(());
    }

    for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_dir() {
            let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o700));
        }
    }

    for entry in WalkDir::new(path).contents_first(true).into_iter() {
        let entry = entry.map_err(|e| {
            let io_err = e.into_io_error().unwrap_or_else(|| io::Error::other("walkdir error"));
            ActionErrorKind::io(path, "remove-tree walk", io_err)
        })?;
        let p = entry.path();
        if entry.file_type().is_dir() {
            fs::remove_dir(p).map_err(|e| ActionErrorKind::io(p, "rmdir", e))?;
        } else {
            fs::remove_file(p).map_err(|e| ActionErrorKind::io(p, "unlink", e))?;
        }
    }
    Ok(())
}

/// Atomically exchanges two path entries within their directories using
/// `renameat2(2)` with `RENAME_EXCHANGE`. Both must already exist.
pub fn atomic_swap(a: &Path, b: &Path) -> Result<(), ActionErrorKind> {
    renameat_with(CWD, a, CWD, b, RenameFlags::EXCHANGE).map_err(|errno| {
        ActionErrorKind::io(a, "renameat2(RENAME_EXCHANGE)", io::Error::from_raw_os_error(errno.raw_os_error()))
    })
}

/// Returns `base` if free, else `base-1`, `base-2`, … the first name not
/// already occupied in the parent. Bounded retry.
pub fn unique_path(base: &Path) -> Result<PathBuf, ActionErrorKind> {
    if !path_occupied(base) {
        return Ok(base.to_path_buf());
    }
    for n in 1..=1000u32 {
        let mut os = base.as_os_str().to_os_string();
        os.push(format!("-{n}"));
        let candidate = PathBuf::from(os);
        if !path_occupied(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ActionErrorKind::TransientIO {
        path: base.to_path_buf(),
        operation: "unique-path",
        source: io::Error::new(io::ErrorKind::AlreadyExists, "exhausted unique name attempts"),
    })
}

/// `true` iff `lstat(path)` shows owner == current uid and mode bits
/// `& 0o600 == 0o600`.
fn is_owner_safe(path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let meta = fs::symlink_metadata(path)?;
    let uid = nix::unistd::getuid().as_raw();
    Ok(meta.uid() == uid && (meta.mode() & 0o600) == 0o600)
}

/// Safety check for a managed directory: the directory itself and its
/// parent must both be owner-safe (owned by the current user, mode
/// including `0o600`). A directory failing this is skipped, never operated
/// on, by the engine.
pub fn is_safe(path: &Path, parent: &Path) -> Result<bool, ActionErrorKind> {
    let path_ok = is_owner_safe(path).map_err(|e| ActionErrorKind::io(path, "lstat", e))?;
    let parent_ok = is_owner_safe(parent).map_err(|e| ActionErrorKind::io(parent, "lstat", e))?;
    Ok(path_ok && parent_ok)
}

/// Creates `dir` (and ancestors) with `mode` if it does not already exist.
/// Never modifies the mode of an already-existing directory.
pub fn ensure_dir_mode(dir: &Path, mode: u32) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(mode))
}

/// Empties a directory's contents but leaves the directory itself in place
/// with its original mode (used by `clear-cache`, which recreates rather
/// than truncates the directory).
pub fn empty_dir(dir: &Path) -> Result<(), ActionErrorKind> {
    if !dir.is_dir() {
        return Ok(());
    }
    let mode = fs::metadata(dir)
        .map_err(|e| ActionErrorKind::io(dir, "stat", e))?
        .permissions()
        .mode();
    for entry in fs::read_dir(dir).map_err(|e| ActionErrorKind::io(dir, "readdir", e))? {
        let entry = entry.map_err(|e| ActionErrorKind::io(dir, "readdir", e))?;
        let path = entry.path();
        let ft = entry
            .file_type()
            .map_err(|e| ActionErrorKind::io(&path, "stat", e))?;
        if ft.is_dir() {
            remove_tree(&path)?;
        } else {
            fs::remove_file(&path).map_err(|e| ActionErrorKind::io(&path, "unlink", e))?;
        }
    }
    fs::set_permissions(dir, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| ActionErrorKind::io(dir, "chmod", e))
}
