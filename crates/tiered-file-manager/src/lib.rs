//! # Tiered File Manager
//!
//! Sandboxed file management for services that park artifacts in retention
//! tiers. One [`FileManager`] owns one directory tree and guarantees:
//!
//! - **Sandboxed operations**: every path is relative and lexically
//!   normalized before use; anything that climbs above the base directory,
//!   or resolves through a symlink that leaves it, is rejected.
//! - **Atomic writes**: [`FileManager::write_atomic`] lands bytes via a
//!   temporary sibling plus rename, so a partial write is never observable.
//! - **Retention sweeps**: [`FileManager::sweep_expired`] removes files older
//!   than the configured [`CleanupPolicy`], honoring a caller-supplied
//!   exemption set (e.g. artifacts still owned by in-flight work).
//! - **Restart recovery**: existing files are re-registered on build, so a
//!   sweep after a crash still sees everything on disk.
//!
//! The manager deliberately has no background task of its own; the embedding
//! service decides when sweeps run and which files are exempt.
//!
//! ## Usage
//!
//! ```rust
//! use tiered_file_manager::{CleanupPolicy, FileManager};
//! use std::collections::HashSet;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = FileManager::builder()
//!     .base_directory("/var/lib/app/processed")
//!     .cleanup_policy(CleanupPolicy::new().remove_after(Duration::from_secs(3 * 24 * 3600)))
//!     .build()
//!     .await?;
//!
//! manager.write_atomic("c0ffee.png", b"bytes").await?;
//! let bytes = manager.read("c0ffee.png").await?;
//! let removed = manager.sweep_expired(&HashSet::new(), None).await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod file_types;
pub mod manager;
pub mod policy;
pub mod security;

pub use error::{Result, TieredFileError};
pub use file_types::{FileTypeInfo, FileTypeValidator};
pub use manager::{FileManager, FileManagerBuilder, FileRecord, ManagerStats};
pub use policy::{AgeBasis, CleanupPolicy};
