//! Talking-avatar video synthesizer contract.
//!
//! The synthesizer is job-based: the pipeline submits image plus audio, then
//! polls the job to a terminal state and downloads the result so retention of
//! the final video is governed locally.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Externally reported job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
}

/// One poll response.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub state: JobState,
    /// Set when `state` is `Done`.
    pub result_url: Option<String>,
    /// Set when `state` is `Error`.
    pub error: Option<String>,
}

/// Synthesizes a talking-avatar video from an image and an audio track.
#[async_trait]
pub trait VideoSynthesizer: Send + Sync {
    /// Submit a synthesis job; returns the engine's job id.
    async fn submit_job(
        &self,
        image: &[u8],
        audio: &[u8],
        preset: Option<&str>,
    ) -> Result<String, EngineError>;

    /// Poll a submitted job.
    async fn poll_job(&self, job_id: &str) -> Result<JobStatus, EngineError>;

    /// Download the finished video the job's `result_url` points at.
    async fn fetch_result(&self, url: &str) -> Result<Bytes, EngineError>;
}
