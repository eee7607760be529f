//! Domain types shared across the pipeline core.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline stages, totally ordered on the success path.
///
/// `Completed` and `Failed` are terminal; a record that reaches either never
/// changes stage again.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Initialized,
    Upload,
    Detection,
    BackgroundRemoval,
    VideoUpload,
    VideoProcessing,
    Finalizing,
    Completed,
    Failed,
}

impl Stage {
    /// Whether this stage ends the state machine.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// The next stage on the success path, if any.
    pub fn next_on_success(&self) -> Option<Stage> {
        match self {
            Stage::Initialized => Some(Stage::Upload),
            Stage::Upload => Some(Stage::Detection),
            Stage::Detection => Some(Stage::BackgroundRemoval),
            Stage::BackgroundRemoval => Some(Stage::VideoUpload),
            Stage::VideoUpload => Some(Stage::VideoProcessing),
            Stage::VideoProcessing => Some(Stage::Finalizing),
            Stage::Finalizing => Some(Stage::Completed),
            Stage::Completed | Stage::Failed => None,
        }
    }

    /// Whether an edge from `self` to `next` is legal: strict advancement on
    /// the success path, or failure from any non-terminal stage.
    pub fn can_transition_to(&self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Stage::Failed {
            return true;
        }
        self.next_on_success() == Some(next)
    }
}

/// Retention tiers for stored artifacts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    Temp,
    Uploads,
    Processed,
    Videos,
}

impl Tier {
    /// Directory name under the storage root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Tier::Temp => "temp",
            Tier::Uploads => "uploads",
            Tier::Processed => "processed",
            Tier::Videos => "videos",
        }
    }

    /// All tiers, in sweep order.
    pub fn all() -> [Tier; 4] {
        [Tier::Temp, Tier::Uploads, Tier::Processed, Tier::Videos]
    }

    /// Parse the tier component of a `<tier>/<file>` artifact path.
    pub fn from_dir_name(name: &str) -> Option<Tier> {
        match name {
            "temp" => Some(Tier::Temp),
            "uploads" => Some(Tier::Uploads),
            "processed" => Some(Tier::Processed),
            "videos" => Some(Tier::Videos),
            _ => None,
        }
    }
}

/// GPU workload classes with separate slot pools. Slots are not fungible
/// across classes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GpuClass {
    Detector,
    Segmenter,
}

/// Per-request tuning accepted alongside the inputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOverrides {
    /// Minimum detector confidence; engine default when unset.
    pub detection_confidence: Option<f32>,
    /// Whether the background mask is smoothed.
    pub smoothing: Option<bool>,
    /// Named synthesis preset passed through to the video engine.
    pub preset: Option<String>,
}

/// Immutable input bundle for one video-message request.
#[derive(Debug, Clone)]
pub struct Request {
    pub image_bytes: Bytes,
    pub image_content_type: String,
    pub audio_bytes: Bytes,
    pub audio_content_type: String,
    pub overrides: RequestOverrides,
}

/// Terminal failure details carried on a task record and on the final
/// `failed` progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub error_kind: String,
    pub stage_at_failure: Stage,
    pub message: String,
}

/// Mutable per-request record, owned by the task registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub stage: Stage,
    /// 0..=100, non-decreasing on the success path.
    pub progress_percent: u8,
    /// One entry per stage that produced output, in production order.
    /// Emptied atomically on rollback.
    pub artifact_paths: Vec<String>,
    pub error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            stage: Stage::Initialized,
            progress_percent: 0,
            artifact_paths: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// Kinds of progress events delivered to subscribers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProgressEventKind {
    StageStart,
    StageProgress,
    StageComplete,
    Failed,
    Heartbeat,
    /// Synthesized in place of events dropped from a slow subscriber's queue;
    /// tells the consumer replay via cursor is needed.
    Gap,
}

/// A progress event as published on a task's stream. `sequence` is per-task,
/// gapless, starting at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: Uuid,
    pub kind: ProgressEventKind,
    pub stage: Stage,
    pub progress: u8,
    pub message: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// What a publisher hands the hub; the hub assigns sequence and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub kind: ProgressEventKind,
    pub stage: Stage,
    pub progress: u8,
    pub message: String,
}

impl EventDraft {
    pub fn stage_start(stage: Stage, progress: u8, message: impl Into<String>) -> Self {
        Self {
            kind: ProgressEventKind::StageStart,
            stage,
            progress,
            message: message.into(),
        }
    }

    pub fn stage_progress(stage: Stage, progress: u8, message: impl Into<String>) -> Self {
        Self {
            kind: ProgressEventKind::StageProgress,
            stage,
            progress,
            message: message.into(),
        }
    }

    pub fn stage_complete(stage: Stage, progress: u8, message: impl Into<String>) -> Self {
        Self {
            kind: ProgressEventKind::StageComplete,
            stage,
            progress,
            message: message.into(),
        }
    }

    pub fn failed(stage: Stage, progress: u8, message: impl Into<String>) -> Self {
        Self {
            kind: ProgressEventKind::Failed,
            stage,
            progress,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_path_is_totally_ordered() {
        let mut stage = Stage::Initialized;
        let mut seen = vec![stage];
        while let Some(next) = stage.next_on_success() {
            assert!(stage.can_transition_to(next));
            stage = next;
            seen.push(stage);
        }
        assert_eq!(stage, Stage::Completed);
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn skipping_stages_is_illegal() {
        assert!(!Stage::Upload.can_transition_to(Stage::BackgroundRemoval));
        assert!(!Stage::Detection.can_transition_to(Stage::Finalizing));
        assert!(!Stage::Upload.can_transition_to(Stage::Upload));
    }

    #[test]
    fn any_non_terminal_stage_can_fail() {
        for stage in [
            Stage::Initialized,
            Stage::Upload,
            Stage::Detection,
            Stage::BackgroundRemoval,
            Stage::VideoUpload,
            Stage::VideoProcessing,
            Stage::Finalizing,
        ] {
            assert!(stage.can_transition_to(Stage::Failed));
        }
    }

    #[test]
    fn terminal_stages_are_frozen() {
        assert!(!Stage::Completed.can_transition_to(Stage::Failed));
        assert!(!Stage::Failed.can_transition_to(Stage::Upload));
        assert!(Stage::Completed.next_on_success().is_none());
    }

    #[test]
    fn tier_round_trips_through_dir_name() {
        for tier in Tier::all() {
            assert_eq!(Tier::from_dir_name(tier.dir_name()), Some(tier));
        }
        assert_eq!(Tier::from_dir_name("cache"), None);
    }
}
