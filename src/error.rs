//! Error types shared across the pipeline.
//!
//! Most of the crate propagates [`anyhow::Error`] with context attached at each
//! I/O boundary. The scheduler needs to tell failure kinds apart when it builds
//! a report, so per-job failures are classified into [`JobError`].

use serde::Serialize;
use thiserror::Error;

/// Why a single partition job did not produce an output container.
#[derive(Debug, Error)]
pub enum JobError {
    /// The input container could not be opened (missing, unreadable, remote
    /// endpoint unreachable, corrupt layout). No output was written.
    #[error("failed to open input: {0:#}")]
    Open(anyhow::Error),

    /// Redefining, filtering or writing a table failed. A partially written
    /// output may remain on disk.
    #[error("transform failed: {0:#}")]
    Transform(anyhow::Error),

    /// The job panicked; the payload message is kept when it was a string.
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Stable, lowercase label used in reports.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Open(_) => FailureKind::Open,
            Self::Transform(_) => FailureKind::Transform,
            Self::Panicked(_) => FailureKind::Panicked,
        }
    }
}

/// Serializable classification of a [`JobError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Open,
    Transform,
    Panicked,
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
