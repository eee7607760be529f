//! Error type definitions for the video-message pipeline.
//!
//! `PipelineError` is the top-level taxonomy surfaced on task records and to
//! callers; the layer-specific enums below convert into it at the stage
//! boundaries.

use thiserror::Error;

use crate::models::{Stage, TaskFailure};

/// Top-level pipeline error taxonomy.
///
/// Every variant maps to a stable `kind()` string that is stored on failed
/// task records and carried on terminal `failed` events.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Request failed declared-format or size checks; surfaced at accept
    /// time, no task is registered.
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// The detector returned an empty person set.
    #[error("No person detected in the supplied image")]
    NoPerson,

    /// An external engine reported a failure response.
    #[error("Engine error: {engine} - {message}")]
    Engine { engine: String, message: String },

    /// A stage exceeded its deadline.
    #[error("Stage {stage} timed out")]
    Timeout { stage: Stage },

    /// The task was canceled by a user or operator.
    #[error("Task canceled")]
    Canceled,

    /// The registry is at its admission cap.
    #[error("Service overloaded: {active} active tasks (cap {cap})")]
    Overloaded { active: usize, cap: usize },

    /// A required storage operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invariant violation or unexpected state.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    /// Stable error kind identifier.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput { .. } => "invalid_input",
            PipelineError::NoPerson => "no_person",
            PipelineError::Engine { .. } => "engine_error",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Canceled => "canceled",
            PipelineError::Overloaded { .. } => "overloaded",
            PipelineError::Storage(_) => "storage_error",
            PipelineError::Internal { .. } => "internal",
        }
    }

    /// Terminal failure details for the given stage.
    pub fn to_failure(&self, stage_at_failure: Stage) -> TaskFailure {
        TaskFailure {
            error_kind: self.kind().to_string(),
            stage_at_failure,
            message: self.to_string(),
        }
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Failures reported by external engine clients.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Detector ran successfully but found nobody. Not retried.
    #[error("no person found")]
    NoPerson,

    /// The engine rejected the image itself. Not retried.
    #[error("invalid image: {message}")]
    InvalidImage { message: String },

    /// The engine returned a failure response. Retried within the stage.
    #[error("{engine} failed: {message}")]
    Remote { engine: String, message: String },

    /// Transport-level failure talking to the engine. Retried.
    #[error("transport error reaching {engine}: {message}")]
    Transport { engine: String, message: String },

    /// The video synthesizer reported the job itself as failed.
    #[error("synthesis job failed: {message}")]
    JobFailed { message: String },
}

impl EngineError {
    /// Whether retrying the same call within the stage can help.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            EngineError::Remote { .. } | EngineError::Transport { .. }
        )
    }
}

impl From<EngineError> for PipelineError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoPerson => PipelineError::NoPerson,
            EngineError::InvalidImage { message } => PipelineError::Engine {
                engine: "detector".to_string(),
                message: format!("invalid image: {message}"),
            },
            EngineError::Remote { engine, message } => PipelineError::Engine { engine, message },
            EngineError::Transport { engine, message } => PipelineError::Engine {
                engine,
                message: format!("transport: {message}"),
            },
            EngineError::JobFailed { message } => PipelineError::Engine {
                engine: "video_synthesizer".to_string(),
                message,
            },
        }
    }
}

/// Task registry failures.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Task {task_id} already registered")]
    DuplicateTask { task_id: uuid::Uuid },

    #[error("Registry at capacity: {active} active tasks (cap {cap})")]
    AtCapacity { active: usize, cap: usize },

    #[error("Unknown task: {task_id}")]
    UnknownTask { task_id: uuid::Uuid },

    #[error("Illegal stage transition: {from} -> {to}")]
    IllegalTransition { from: Stage, to: Stage },

    #[error("Progress regression: {from} -> {to}")]
    ProgressRegression { from: u8, to: u8 },

    #[error("Task {task_id} is terminal; record is frozen")]
    TerminalFrozen { task_id: uuid::Uuid },

    #[error("Purge refused for {task_id}: {reason}")]
    PurgeRefused { task_id: uuid::Uuid, reason: String },

    #[error("Deadline elapsed waiting for task {task_id} to finish")]
    AwaitTimeout { task_id: uuid::Uuid },
}

impl From<RegistryError> for PipelineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AtCapacity { active, cap } => {
                PipelineError::Overloaded { active, cap }
            }
            other => PipelineError::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Storage manager failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File operation failed: {0}")]
    File(#[from] tiered_file_manager::TieredFileError),

    #[error("Malformed artifact path: {path}")]
    InvalidPath { path: String },

    #[error("Unknown artifact path: {path}")]
    UnknownPath { path: String },

    #[error("Index log error: {message}")]
    Index { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            PipelineError::invalid_input("bad image").kind(),
            "invalid_input"
        );
        assert_eq!(PipelineError::NoPerson.kind(), "no_person");
        assert_eq!(
            PipelineError::Timeout {
                stage: Stage::Detection
            }
            .kind(),
            "timeout"
        );
        assert_eq!(PipelineError::Canceled.kind(), "canceled");
        assert_eq!(
            PipelineError::Overloaded { active: 50, cap: 50 }.kind(),
            "overloaded"
        );
    }

    #[test]
    fn registry_capacity_maps_to_overloaded() {
        let err: PipelineError = RegistryError::AtCapacity { active: 50, cap: 50 }.into();
        assert_eq!(err.kind(), "overloaded");

        let err: PipelineError = RegistryError::TerminalFrozen {
            task_id: uuid::Uuid::new_v4(),
        }
        .into();
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn engine_errors_map_onto_taxonomy() {
        let err: PipelineError = EngineError::NoPerson.into();
        assert_eq!(err.kind(), "no_person");

        let err: PipelineError = EngineError::Transport {
            engine: "video_synthesizer".to_string(),
            message: "connection reset".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "engine_error");
    }

    #[test]
    fn only_remote_and_transport_are_retriable() {
        assert!(
            EngineError::Remote {
                engine: "detector".into(),
                message: "500".into()
            }
            .is_retriable()
        );
        assert!(!EngineError::NoPerson.is_retriable());
        assert!(
            !EngineError::JobFailed {
                message: "render failed".into()
            }
            .is_retriable()
        );
    }
}
