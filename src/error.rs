//! The error taxonomy shared by every engine operation.
//!
//! Errors are plain values; nothing in the crate unwinds across the audio
//! thread boundary. The audio thread itself never returns an [`Error`] —
//! subsystem trouble observed there is folded into the per-callback status
//! flags, and only a backend server shutdown makes it schedule a close.

use thiserror::Error;

/// Why an engine operation did not complete normally.
///
/// A successful operation returns `Ok(())`; every other outcome is one of
/// these variants. [`Error::Warning`] is special: the operation was benign
/// but redundant (closing a closed stream, starting a running one) and the
/// stream is left in a consistent state.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// The operation failed in a recoverable way.
    #[error("operation failed: {0}")]
    Failed(String),

    /// A non-critical problem; the stream state is unchanged or already
    /// what the caller asked for.
    #[error("{0}")]
    Warning(String),

    /// A required input was missing, most commonly an operation forwarded
    /// through a dispatcher that has no backend instantiated.
    #[error("missing input: {0}")]
    InputNull(String),

    /// The operation is not legal in the current stream state, or its
    /// arguments are out of range.
    #[error("invalid use: {0}")]
    InvalidUse(String),

    /// The underlying audio subsystem reported an error.
    #[error("system error: {0}")]
    SystemError(String),
}

impl Error {
    /// `true` for the benign [`Error::Warning`] outcome.
    #[inline]
    pub fn is_warning(&self) -> bool {
        matches!(self, Error::Warning(_))
    }
}
