use std::path::PathBuf;
use std::time::Duration;

use lsprobe_types::ClientError;

use crate::matching::Mismatch;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("timed out after {after:?} waiting for {what}")]
    ExpectationTimeout { what: String, after: Duration },
    /// The wait was unbounded or longer than the harness allows.
    #[error("invalid wait of {requested:?}: waits must not exceed {max:?}")]
    InvalidWait { requested: Duration, max: Duration },
    #[error("fixture {}: {reason}", path.display())]
    Fixture { path: PathBuf, reason: String },
    #[error(transparent)]
    Mismatch(#[from] Mismatch),
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error("mock server: {0}")]
    Mock(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl HarnessError {
    pub(crate) fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }

    pub(crate) fn fixture(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Fixture {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
