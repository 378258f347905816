//! Centralized error types for bouncewatch.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the bouncewatch library.
///
/// Per-message parse problems are not errors: they are reported through
/// [`crate::ingest::job::JobOutcome`] so one malformed bounce never aborts a run.
#[derive(Error, Debug)]
pub enum BounceError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Required configuration is missing or unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The upstream mail plugin is not installed or not active.
    #[error("Mail plugin is not active")]
    UpstreamInactive,

    /// The upstream mail plugin does not use the SMTP mailer.
    #[error("Mail plugin mailer is not SMTP")]
    UpstreamNotSmtp,

    /// Opening or authenticating the IMAP connection failed.
    #[error("IMAP connection failed: {0}")]
    Connection(String),

    /// The IMAP server answered NO/BAD or sent something we cannot parse.
    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    /// Network I/O error on an open IMAP session.
    #[error("IMAP I/O error: {0}")]
    Network(#[from] std::io::Error),

    /// The record store file is corrupt or was written by an incompatible version.
    #[error("Corrupt or incompatible store '{path}': {reason}")]
    CorruptStore { path: PathBuf, reason: String },

    /// Encoding or decoding persisted state failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Nothing matched what was asked for.
    #[error("{0}")]
    NotFound(String),

    /// Another run holds the lock.
    #[error("Another run is in progress (lock '{0}')")]
    Locked(String),
}

/// Convenience alias for `Result<T, BounceError>`.
pub type Result<T> = std::result::Result<T, BounceError>;

impl BounceError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error comes from persisted state (store, queue, status)
    /// rather than from the mailbox.
    pub fn is_store(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::CorruptStore { .. } | Self::Serialization(_) | Self::Locked(_)
        )
    }

    /// Whether this error ends the current run before any IMAP work starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::UpstreamInactive | Self::UpstreamNotSmtp
        )
    }
}

impl From<bincode::Error> for BounceError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for BounceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
