//! `bor.conf` (INI) loading, parsed with the `ini` crate.

use std::path::Path;

use ini::Ini;

use crate::error::ConfigError;

/// The `[config]` section of `bor.conf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub enable_overlay: bool,
    pub enable_cache: bool,
    pub resync_cache: bool,
    pub reset_overlay: bool,
    pub max_log_entries: usize,
    pub require_browser_stopped: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enable_overlay: false,
            enable_cache: false,
            resync_cache: true,
            reset_overlay: false,
            max_log_entries: 10,
            require_browser_stopped: false,
        }
    }
}

impl Config {
    /// Loads `path`, falling back to defaults for any key the `[config]`
    /// section omits. Missing file and malformed INI are both
    /// `ConfigError`s.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::MalformedIni {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Config::default();
        let Some(section) = ini.section(Some("config")) else {
            return Ok(config);
        };

        if let Some(v) = section.get("enable_overlay") {
            config.enable_overlay = parse_bool("enable_overlay", v)?;
        }
        if let Some(v) = section.get("enable_cache") {
            config.enable_cache = parse_bool("enable_cache", v)?;
        }
        if let Some(v) = section.get("resync_cache") {
            config.resync_cache = parse_bool("resync_cache", v)?;
        }
        if let Some(v) = section.get("reset_overlay") {
            config.reset_overlay = parse_bool("reset_overlay", v)?;
        }
        if let Some(v) = section.get("require_browser_stopped") {
            config.require_browser_stopped = parse_bool("require_browser_stopped", v)?;
        }
        if let Some(v) = section.get("max_log_entries") {
            config.max_log_entries = v.parse().map_err(|_| ConfigError::InvalidOption {
                key: "max_log_entries",
                value: v.to_string(),
                expected: "a non-negative integer",
            })?;
        }

        Ok(config)
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidOption {
            key,
            value: value.to_string(),
            expected: "a boolean (true/false, 1/0, yes/no, on/off)",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_config_error() {
        let tmp = tempdir().unwrap();
        let err = Config::load(&tmp.path().join("nope.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn absent_config_section_yields_defaults() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("bor.conf");
        std::fs::write(&path, "[browsers]\nfirefox=/usr/bin/firefox.sh\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parses_overridden_keys() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("bor.conf");
        std::fs::write(
            &path,
            "[config]\nenable_overlay=true\nenable_cache=yes\nresync_cache=false\nmax_log_entries=42\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert!(config.enable_overlay);
        assert!(config.enable_cache);
        assert!(!config.resync_cache);
        assert_eq!(config.max_log_entries, 42);
        assert!(!config.reset_overlay);
    }

    #[test]
    fn rejects_invalid_bool() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("bor.conf");
        std::fs::write(&path, "[config]\nenable_overlay=maybe\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { key: "enable_overlay", .. }));
    }
}
