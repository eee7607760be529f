//! Person detector contract.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Tuning parameters for a detection call.
#[derive(Debug, Clone, Default)]
pub struct DetectParams {
    /// Minimum confidence for a person to count; engine default when unset.
    pub confidence: Option<f32>,
}

/// One detected person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedPerson {
    /// Bounding box as x, y, width, height in pixels.
    pub bbox: [u32; 4],
    pub confidence: f32,
}

/// Successful detection result.
#[derive(Debug, Clone)]
pub struct Detection {
    pub persons: Vec<DetectedPerson>,
    /// Index into `persons` of the subject the pipeline continues with.
    pub selected_index: usize,
    /// Image cropped/annotated around the selected person; this is what the
    /// pipeline stores in the `processed` tier.
    pub annotated_image: Bytes,
}

/// Detects persons in a still image.
///
/// Failure modes: [`EngineError::NoPerson`] when the image contains nobody,
/// [`EngineError::InvalidImage`] when the engine rejects the image, and
/// [`EngineError::Remote`]/[`EngineError::Transport`] for engine failures.
#[async_trait]
pub trait PersonDetector: Send + Sync {
    async fn detect(&self, image: &[u8], params: &DetectParams) -> Result<Detection, EngineError>;
}
