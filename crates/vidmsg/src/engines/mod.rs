//! External engine contracts.
//!
//! The core never runs inference in-process; it drives three external
//! capabilities through these traits. Concrete implementations are selected
//! at construction time: HTTP clients in the binary ([`remote`]), scripted
//! in-process doubles in tests ([`testing`]).

pub mod detector;
pub mod remote;
pub mod remover;
pub mod synthesizer;
pub mod testing;

use std::sync::Arc;

pub use detector::{DetectParams, DetectedPerson, Detection, PersonDetector};
pub use remover::{BackgroundRemover, RemoveParams, Removal};
pub use synthesizer::{JobState, JobStatus, VideoSynthesizer};

/// The fixed capability set one orchestrator works with.
#[derive(Clone)]
pub struct EngineSet {
    pub detector: Arc<dyn PersonDetector>,
    pub remover: Arc<dyn BackgroundRemover>,
    pub synthesizer: Arc<dyn VideoSynthesizer>,
}
