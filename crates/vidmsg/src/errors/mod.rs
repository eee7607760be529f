//! Error handling for the pipeline core.

pub mod types;

pub use types::{EngineError, PipelineError, RegistryError, StorageError};

/// Result type for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
