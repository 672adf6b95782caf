//! Error types for the linkfarm engine.
//!
//! Conflicts are deliberately *not* errors: they are reported as data in
//! [`StowResult`](crate::StowResult) so that every conflict across a batch
//! can be collected before anything touches the filesystem.

use std::path::Path;

use thiserror::Error;

/// Errors produced while planning or executing link operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An ignore, defer or override pattern failed to compile.
    #[error("invalid regular expression {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },

    /// Bad input: missing package, unusable stow or target directory.
    #[error("{0}")]
    Input(String),

    /// An unexpected filesystem failure during planning or execution.
    #[error("{message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// An internal invariant of the task ledger or the folding algorithm
    /// was violated. Indicates a bug, not bad user input.
    #[error("internal error (please report this bug): {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an I/O error with a message naming the operation and path.
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    pub(crate) fn read_dir(dir: &Path, source: std::io::Error) -> Self {
        Self::io(
            format!("cannot read directory: {} ({source})", dir.display()),
            source,
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
