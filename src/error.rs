//! Error types for shadowfs.
//!
//! All fallible library operations return [`Result<T>`], an alias for
//! `Result<T, Error>`.
//!
//! # Error Categories
//!
//! - **Consistency errors**: [`Consistency`] means the storage driver's layer
//!   directories and the engine's content-hash chain disagree, or an exported
//!   archive no longer matches the layers on disk. Never patched over.
//! - **External failures**: [`Command`], [`Engine`] and [`Timeout`] cover the
//!   processes and daemons this crate drives but does not own.
//! - **System errors**: [`Io`] and [`Json`] carry the path that failed.
//! - **Configuration**: [`Config`].
//!
//! Conditions that are expected during normal use (an image that is already
//! shadowed, an export request for an image that never was) are not errors;
//! they are reported through outcome enums such as
//! [`ShadowOutcome`](crate::shadow::ShadowOutcome).
//!
//! [`Consistency`]: Error::Consistency
//! [`Command`]: Error::Command
//! [`Engine`]: Error::Engine
//! [`Timeout`]: Error::Timeout
//! [`Io`]: Error::Io
//! [`Json`]: Error::Json
//! [`Config`]: Error::Config

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for shadow and export operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// On-disk layer state does not match what the container engine reports.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// A filesystem operation failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON document could not be read or written.
    #[error("JSON error in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// An external process exited unsuccessfully or could not be spawned.
    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    /// The container engine returned something we could not use.
    #[error("container engine error: {0}")]
    Engine(String),

    /// A bounded wait on external state ran out of time.
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    /// The configuration file or a command-line override is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true for errors that mean the on-disk state cannot be trusted.
    pub fn is_consistency(&self) -> bool {
        matches!(self, Error::Consistency(_))
    }
}

/// Attach the offending path to `std::io` results.
pub(crate) trait PathContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> PathContext<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })
    }
}
