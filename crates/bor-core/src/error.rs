//! Error taxonomy for `bor-core`.
//!
//! Components report outcomes as `Result<_, ActionErrorKind>`. The kinds are
//! not exception types to unwind through; they are a closed classification
//! the orchestrator maps to logging level and continue/abort behavior.

use std::path::PathBuf;

use thiserror::Error;

/// Per-directory or whole-session failure classification.
///
/// See the spec's "Error Handling Design" section for the propagation rule
/// attached to each variant: [`SafetyViolation`](Self::SafetyViolation),
/// [`CorruptedState`](Self::CorruptedState) and [`TransientIO`](Self::TransientIO)
/// are always per-directory (the orchestrator skips the directory and
/// continues); [`FatalSystem`](Self::FatalSystem) always aborts the whole
/// session.
#[derive(Debug, Error)]
pub enum ActionErrorKind {
    #[error("{path}: owner or mode safety check failed")]
    SafetyViolation { path: PathBuf },

    #[error("{path}: physical state cannot be classified into any repair rule: {detail}")]
    CorruptedState { path: PathBuf, detail: String },

    #[error("{path}: {operation} failed: {source}")]
    TransientIO {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("overlay requested but required capabilities are not permitted: {0}")]
    CapabilityMissing(String),

    #[error("fatal system error: {0}")]
    FatalSystem(#[source] anyhow::Error),
}

impl ActionErrorKind {
    /// Whether the orchestrator should abort the whole session (`true`) or
    /// just skip this directory and continue (`false`).
    pub fn is_fatal(&self) -> bool {
        matches!(self, ActionErrorKind::FatalSystem(_))
    }

    pub(crate) fn io(path: &std::path::Path, operation: &'static str, source: std::io::Error) -> Self {
        ActionErrorKind::TransientIO {
            path: path.to_path_buf(),
            operation,
            source,
        }
    }
}
