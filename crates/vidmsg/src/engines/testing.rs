//! Scripted in-process engine doubles.
//!
//! Each double replays a queue of scripted responses, then falls back to a
//! configurable default. Optional per-call delay makes slot-contention
//! scenarios reproducible. Used by unit and integration tests; never by the
//! binary.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::errors::EngineError;

use super::detector::{DetectParams, DetectedPerson, Detection, PersonDetector};
use super::remover::{BackgroundRemover, RemoveParams, Removal};
use super::synthesizer::{JobState, JobStatus, VideoSynthesizer};

/// A plausible single-person detection.
pub fn sample_detection() -> Detection {
    Detection {
        persons: vec![DetectedPerson {
            bbox: [120, 40, 320, 480],
            confidence: 0.93,
        }],
        selected_index: 0,
        annotated_image: Bytes::from_static(b"cropped-person-bytes"),
    }
}

enum DetectorFallback {
    Succeed,
    NoPerson,
}

/// Detector double.
pub struct ScriptedDetector {
    delay: Duration,
    script: Mutex<VecDeque<Result<Detection, EngineError>>>,
    fallback: DetectorFallback,
    calls: AtomicU32,
}

impl ScriptedDetector {
    /// Always detects one person (after the scripted responses run out).
    pub fn succeeding() -> Self {
        Self {
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            fallback: DetectorFallback::Succeed,
            calls: AtomicU32::new(0),
        }
    }

    /// Always reports an empty person set.
    pub fn no_person() -> Self {
        Self {
            fallback: DetectorFallback::NoPerson,
            ..Self::succeeding()
        }
    }

    /// Hold the detector slot for `delay` on every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue one scripted response ahead of the fallback behavior.
    pub fn push_response(self, response: Result<Detection, EngineError>) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersonDetector for ScriptedDetector {
    async fn detect(&self, _image: &[u8], _params: &DetectParams) -> Result<Detection, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted;
        }
        match self.fallback {
            DetectorFallback::Succeed => Ok(sample_detection()),
            DetectorFallback::NoPerson => Err(EngineError::NoPerson),
        }
    }
}

/// Background remover double.
pub struct ScriptedRemover {
    delay: Duration,
    script: Mutex<VecDeque<Result<Removal, EngineError>>>,
    calls: AtomicU32,
}

impl ScriptedRemover {
    pub fn succeeding() -> Self {
        Self {
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    /// Hold the segmenter slot for `delay` on every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_response(self, response: Result<Removal, EngineError>) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundRemover for ScriptedRemover {
    async fn remove(&self, _image: &[u8], _params: &RemoveParams) -> Result<Removal, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(Removal {
            masked_image: Bytes::from_static(b"masked-person-bytes"),
        })
    }
}

/// Video synthesizer double.
pub struct ScriptedSynthesizer {
    result_url: String,
    result_bytes: Bytes,
    submit_script: Mutex<VecDeque<Result<String, EngineError>>>,
    poll_script: Mutex<VecDeque<Result<JobStatus, EngineError>>>,
    submits: AtomicU32,
    polls: AtomicU32,
    fetches: AtomicU32,
}

impl ScriptedSynthesizer {
    /// Submits accept immediately; polls report `done` right away.
    pub fn completing() -> Self {
        Self {
            result_url: "https://synth.invalid/results/job-1".to_string(),
            result_bytes: Bytes::from_static(b"talking-avatar-mp4-bytes"),
            submit_script: Mutex::new(VecDeque::new()),
            poll_script: Mutex::new(VecDeque::new()),
            submits: AtomicU32::new(0),
            polls: AtomicU32::new(0),
            fetches: AtomicU32::new(0),
        }
    }

    pub fn with_result_url(mut self, url: &str) -> Self {
        self.result_url = url.to_string();
        self
    }

    pub fn result_url(&self) -> &str {
        &self.result_url
    }

    pub fn result_bytes(&self) -> Bytes {
        self.result_bytes.clone()
    }

    pub fn push_submit(self, response: Result<String, EngineError>) -> Self {
        self.submit_script.lock().unwrap().push_back(response);
        self
    }

    pub fn push_poll(self, response: Result<JobStatus, EngineError>) -> Self {
        self.poll_script.lock().unwrap().push_back(response);
        self
    }

    /// Queue `n` `running` polls before the fallback `done`.
    pub fn running_polls(mut self, n: usize) -> Self {
        for _ in 0..n {
            self = self.push_poll(Ok(JobStatus {
                state: JobState::Running,
                result_url: None,
                error: None,
            }));
        }
        self
    }

    pub fn submits(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VideoSynthesizer for ScriptedSynthesizer {
    async fn submit_job(
        &self,
        _image: &[u8],
        _audio: &[u8],
        _preset: Option<&str>,
    ) -> Result<String, EngineError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.submit_script.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok("job-1".to_string())
    }

    async fn poll_job(&self, _job_id: &str) -> Result<JobStatus, EngineError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.poll_script.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(JobStatus {
            state: JobState::Done,
            result_url: Some(self.result_url.clone()),
            error: None,
        })
    }

    async fn fetch_result(&self, _url: &str) -> Result<Bytes, EngineError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.result_bytes.clone())
    }
}
