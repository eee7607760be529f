//! Background remover contract.

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::EngineError;

/// Tuning parameters for a removal call.
#[derive(Debug, Clone, Default)]
pub struct RemoveParams {
    /// Whether the mask edge is smoothed; engine default when unset.
    pub smoothing: Option<bool>,
}

/// Successful removal result.
#[derive(Debug, Clone)]
pub struct Removal {
    /// Input image with its background masked out.
    pub masked_image: Bytes,
}

/// Removes the background from a person image.
#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    async fn remove(&self, image: &[u8], params: &RemoveParams) -> Result<Removal, EngineError>;
}
