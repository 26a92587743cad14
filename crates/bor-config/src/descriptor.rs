//! Browser descriptors: each configured browser's procname and managed
//! directories come from running an external shell script and parsing its
//! `key=value` stdout lines. Kept behind the [`BrowserDescriptorSource`]
//! trait so `bor-core` never depends on shells directly.

use std::path::{Path, PathBuf};
use std::process::Command;

use bor_core::DirKind;
use ini::Ini;
use tracing::instrument;

use crate::error::ConfigError;

/// One configured browser's procname and list of managed directories, as
/// produced by a [`BrowserDescriptorSource`], before being turned into
/// `bor_core::Browser`/`Dir` values (which validate each path).
#[derive(Debug, Clone)]
pub struct BrowserDescriptor {
    pub procname: String,
    pub dirs: Vec<(DirKind, PathBuf)>,
}

pub trait BrowserDescriptorSource {
    fn describe(&self, name: &str, script: &Path) -> Result<BrowserDescriptor, ConfigError>;
}

/// Runs `script` as a child process and parses its stdout. Each
/// non-blank line must be `key=value` with `key` one of `procname`,
/// `profile`, `cache`; a two-token split per line, no parsing crate
/// needed for this.
pub struct ShellScriptDescriptorSource;

impl BrowserDescriptorSource for ShellScriptDescriptorSource {
    #[instrument(skip(self), fields(script = %script.display()))]
    fn describe(&self, _name: &str, script: &Path) -> Result<BrowserDescriptor, ConfigError> {
        let output = Command::new(script)
            .output()
            .map_err(|source| ConfigError::DescriptorScriptIo { path: script.to_path_buf(), source })?;

        if !output.status.success() {
            return Err(ConfigError::DescriptorScriptFailed {
                path: script.to_path_buf(),
                status: output.status,
            });
        }

        let mut procname = None;
        let mut dirs = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::DescriptorLineMalformed {
                    path: script.to_path_buf(),
                    line: line.to_string(),
                });
            };
            let value = value.trim();
            match key.trim() {
                "procname" => procname = Some(value.to_string()),
                "profile" => dirs.push((DirKind::Profile, PathBuf::from(value))),
                "cache" => dirs.push((DirKind::Cache, PathBuf::from(value))),
                _ => {
                    return Err(ConfigError::DescriptorLineMalformed {
                        path: script.to_path_buf(),
                        line: line.to_string(),
                    })
                }
            }
        }

        let procname = procname.ok_or_else(|| ConfigError::DescriptorMissingProcname { path: script.to_path_buf() })?;
        Ok(BrowserDescriptor { procname, dirs })
    }
}

/// Reads the `[browsers]` section (`name = descriptor-script-path` pairs),
/// runs each through `source`, and assembles the resulting `Browser`
/// values. Enforces `bor_core::MAX_BROWSERS`.
pub fn load_browsers(ini: &Ini, source: &dyn BrowserDescriptorSource) -> Result<Vec<bor_core::Browser>, ConfigError> {
    let Some(section) = ini.section(Some("browsers")) else {
        return Ok(Vec::new());
    };

    if section.len() > bor_core::model::MAX_BROWSERS {
        return Err(ConfigError::TooManyBrowsers(section.len(), bor_core::model::MAX_BROWSERS));
    }

    let mut browsers = Vec::new();
    for (name, script) in section.iter() {
        let descriptor = source.describe(name, Path::new(script))?;
        let mut dirs = Vec::new();
        for (kind, path) in descriptor.dirs {
            let dir = bor_core::Dir::new(&path, kind, &descriptor.procname).map_err(|source| ConfigError::InvalidDirectory {
                name: name.to_string(),
                path: path.clone(),
                source,
            })?;
            dirs.push(dir);
        }
        let browser = bor_core::Browser::new(name, &descriptor.procname, dirs).map_err(|source| ConfigError::InvalidDirectory {
            name: name.to_string(),
            path: Path::new(script).to_path_buf(),
            source,
        })?;
        browsers.push(browser);
    }
    Ok(browsers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(path: &Path, body: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).unwrap();
    }

    #[test]
    fn parses_procname_profile_and_cache_lines() {
        let tmp = tempdir().unwrap();
        let profile = tmp.path().join("profile");
        let cache = tmp.path().join("cache");
        std::fs::create_dir(&profile).unwrap();
        std::fs::create_dir(&cache).unwrap();

        let script = tmp.path().join("firefox.sh");
        write_script(
            &script,
            &format!("echo procname=firefox\necho profile={}\necho cache={}", profile.display(), cache.display()),
        );

        let descriptor = ShellScriptDescriptorSource.describe("firefox", &script).unwrap();
        assert_eq!(descriptor.procname, "firefox");
        assert_eq!(descriptor.dirs.len(), 2);
        assert_eq!(descriptor.dirs[0], (DirKind::Profile, profile));
        assert_eq!(descriptor.dirs[1], (DirKind::Cache, cache));
    }

    #[test]
    fn missing_procname_is_an_error() {
        let tmp = tempdir().unwrap();
        let script = tmp.path().join("broken.sh");
        write_script(&script, "echo profile=/tmp/x");

        let err = ShellScriptDescriptorSource.describe("broken", &script).unwrap_err();
        assert!(matches!(err, ConfigError::DescriptorMissingProcname { .. }));
    }

    #[test]
    fn malformed_line_is_an_error() {
        let tmp = tempdir().unwrap();
        let script = tmp.path().join("broken.sh");
        write_script(&script, "echo not-a-key-value-line");

        let err = ShellScriptDescriptorSource.describe("broken", &script).unwrap_err();
        assert!(matches!(err, ConfigError::DescriptorLineMalformed { .. }));
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let tmp = tempdir().unwrap();
        let script = tmp.path().join("fails.sh");
        write_script(&script, "exit 1");

        let err = ShellScriptDescriptorSource.describe("fails", &script).unwrap_err();
        assert!(matches!(err, ConfigError::DescriptorScriptFailed { .. }));
    }
}
