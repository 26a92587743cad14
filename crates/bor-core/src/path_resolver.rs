//! Pure derivation of `(backup, tmpfs, overlay_upper)` locations from a
//! managed directory's live path.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::model::{Dir, Roots};

/// The three physical locations derived from one [`Dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub backup: PathBuf,
    pub tmpfs: PathBuf,
    pub overlay_upper: PathBuf,
}

/// Lower-cased 40-hex SHA-1 of the UTF-8 bytes of `path`.
///
/// Contract: same bytes in ⇒ same hex out. Never fails in practice (SHA-1
/// over a byte slice cannot fail), so this returns a plain `String` rather
/// than a `Result`.
pub fn hash_path(path: &std::path::Path) -> String {
    let mut hasher = Sha1::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Derives the triple of physical locations for `dir` under `roots`.
///
/// Pure function of `dir.path()` and `roots`: no filesystem access is
/// performed here.
pub fn resolve(dir: &Dir, roots: &Roots) -> ResolvedPaths {
    let hash = hash_path(dir.path());
    let stem = format!("{hash}_{}", dir.dirname());
    ResolvedPaths {
        backup: roots.backups.join(&stem),
        tmpfs: roots.tmpfs.join(&stem),
        overlay_upper: roots.overlay_upper.join(&stem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DirKind;
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
    fn hash_is_40_lowercase_hex() {
        let h = hash_path(std::path::Path::new("/home/u/.mozilla/firefox/xxx"));
        assert_eq!(h.len(), 40);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn resolve_is_deterministic_pure_function_of_path_and_roots() {
        let tmp = tempdir().unwrap();
        let live = tmp.path().join("xxx");
        std::fs::create_dir(&live).unwrap();
        let dir = Dir::new(&live, DirKind::Profile, "firefox").unwrap();
        let roots = roots_for(tmp.path());

        let a = resolve(&dir, &roots);
        let b = resolve(&dir, &roots);
        assert_eq!(a, b);

        let hash = hash_path(&live);
        assert_eq!(a.backup, roots.backups.join(format!("{hash}_xxx")));
        assert_eq!(a.tmpfs, roots.tmpfs.join(format!("{hash}_xxx")));
        assert_eq!(
            a.overlay_upper,
            roots.overlay_upper.join(format!("{hash}_xxx"))
        );
    }

    #[test]
    fn different_paths_with_same_basename_do_not_collide() {
        let tmp = tempdir().unwrap();
        let live_a = tmp.path().join("a/xxx");
        let live_b = tmp.path().join("b/xxx");
        std::fs::create_dir_all(&live_a).unwrap();
        std::fs::create_dir_all(&live_b).unwrap();
        let dir_a = Dir::new(&live_a, DirKind::Profile, "firefox").unwrap();
        let dir_b = Dir::new(&live_b, DirKind::Profile, "firefox").unwrap();
        let roots = roots_for(tmp.path());

        assert_ne!(resolve(&dir_a, &roots).backup, resolve(&dir_b, &roots).backup);
    }
}
