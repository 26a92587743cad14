//! Config-loading error taxonomy. Kept separate from `bor-core`'s
//! `ActionErrorKind` since these are all fatal at startup, before a
//! session exists to recover into.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    Missing(PathBuf),

    #[error("config file {path} is not valid INI: {source}")]
    MalformedIni {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("[config] key {key} has invalid value {value:?}: expected {expected}")]
    InvalidOption {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("browser descriptor script {path} exited with {status}")]
    DescriptorScriptFailed { path: PathBuf, status: std::process::ExitStatus },

    #[error("browser descriptor script {path} produced unparseable line {line:?}")]
    DescriptorLineMalformed { path: PathBuf, line: String },

    #[error("browser descriptor script {path} did not set procname")]
    DescriptorMissingProcname { path: PathBuf },

    #[error("failed to run browser descriptor script {path}: {source}")]
    DescriptorScriptIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("browser {name} directory {path} is invalid: {source}")]
    InvalidDirectory {
        name: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("[browsers] section lists {0} entries, limit is {1}")]
    TooManyBrowsers(usize, usize),
}
