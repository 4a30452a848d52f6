//! Error kinds surfaced by the core (spec §7).

use thiserror::Error;

/// Errors returned by every public operation in this crate.
///
/// `Retry` is intentionally excluded: it is reserved for a future caller
/// that needs to restart a `remove_space` walk explicitly (spec §7, §4.4.5)
/// and must never escape a public function.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no space left on device")]
    NoSpace,

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("on-disk structure corrupt: {0}")]
    Corrupt(String),

    #[error("filesystem is read-only")]
    Readonly,

    #[error("quota exceeded")]
    Quota,

    #[error("journal aborted, no further writes accepted")]
    JournalAborted,

    #[error("unsupported feature: {0}")]
    Unsupported(String),

    #[error("operation refused, filesystem busy: {0}")]
    Busy(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Internal control-flow signal. Never implements `std::error::Error` and
/// never appears in a public `Result` — callers that see this is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Retry;

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::IoError(e.to_string())
    }
}
