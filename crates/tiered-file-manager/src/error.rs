//! Error types for the tiered file manager.

use std::path::PathBuf;

/// Result type for tiered file operations.
pub type Result<T> = std::result::Result<T, TieredFileError>;

/// Failure modes of the tiered file manager.
#[derive(Debug, thiserror::Error)]
pub enum TieredFileError {
    /// Bubbled-up filesystem failure.
    #[error("filesystem error: {0}")]
    Fs(#[from] std::io::Error),

    /// The caller-supplied path is unusable: empty, NUL bytes, absolute,
    /// climbing above the managed root, or resolving through a symlink that
    /// leaves it.
    #[error("path {path:?} rejected: {reason}")]
    PathRejected { path: PathBuf, reason: String },

    /// An atomic write could not be committed; the temporary was discarded
    /// and the destination is untouched.
    #[error("atomic write to {path:?} failed to commit: {source}")]
    AtomicWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Bytes did not match any accepted content type.
    #[error("content rejected: detected type {detected:?}")]
    ContentRejected { detected: String },

    /// A managed directory could not be created or prepared.
    #[error("could not prepare directory {path:?}: {source}")]
    DirectorySetup {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Restrictive permissions could not be applied to a managed directory.
    #[error("could not restrict permissions on {path:?}")]
    Permissions { path: PathBuf },

    /// The builder was given an unusable configuration.
    #[error("builder misconfigured: {reason}")]
    Builder { reason: String },
}
