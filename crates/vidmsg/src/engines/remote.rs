//! HTTP clients for the external engines.
//!
//! Thin reqwest adapters mapping wire responses onto the engine contracts.
//! Connection-level failures become [`EngineError::Transport`] (retriable),
//! failure responses become [`EngineError::Remote`] or their semantic
//! equivalents.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::errors::EngineError;

use super::detector::{DetectParams, DetectedPerson, Detection, PersonDetector};
use super::remover::{BackgroundRemover, RemoveParams, Removal};
use super::synthesizer::{JobState, JobStatus, VideoSynthesizer};

fn build_client(timeout: Duration, engine: &'static str) -> Result<reqwest::Client, EngineError> {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
        .map_err(|e| EngineError::Transport {
            engine: engine.to_string(),
            message: format!("failed to build HTTP client: {e}"),
        })
}

fn transport(engine: &str, err: reqwest::Error) -> EngineError {
    EngineError::Transport {
        engine: engine.to_string(),
        message: err.to_string(),
    }
}

async fn check_status(
    engine: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
        return Err(EngineError::InvalidImage { message: snippet });
    }
    Err(EngineError::Remote {
        engine: engine.to_string(),
        message: format!("{status}: {snippet}"),
    })
}

/// Person detector behind an HTTP endpoint.
pub struct RemotePersonDetector {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct DetectResponse {
    persons: Vec<DetectedPerson>,
    #[serde(default)]
    selected_index: usize,
    /// Cropped image, base64 in the JSON body.
    annotated_image_b64: String,
}

impl RemotePersonDetector {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, EngineError> {
        Ok(Self {
            client: build_client(timeout, "detector")?,
            endpoint,
        })
    }
}

#[async_trait]
impl PersonDetector for RemotePersonDetector {
    async fn detect(&self, image: &[u8], params: &DetectParams) -> Result<Detection, EngineError> {
        let mut form = Form::new().part(
            "image",
            Part::bytes(image.to_vec()).file_name("input"),
        );
        if let Some(confidence) = params.confidence {
            form = form.text("confidence", confidence.to_string());
        }

        let response = self
            .client
            .post(format!("{}/detect", self.endpoint))
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport("detector", e))?;
        let response = check_status("detector", response).await?;

        let body: DetectResponse = response
            .json()
            .await
            .map_err(|e| transport("detector", e))?;

        if body.persons.is_empty() {
            return Err(EngineError::NoPerson);
        }
        let annotated = BASE64
            .decode(body.annotated_image_b64)
            .map_err(|e| EngineError::Remote {
                engine: "detector".to_string(),
                message: format!("undecodable annotated image: {e}"),
            })?;

        debug!(persons = body.persons.len(), "detector responded");
        Ok(Detection {
            persons: body.persons,
            selected_index: body.selected_index,
            annotated_image: Bytes::from(annotated),
        })
    }
}

/// Background remover behind an HTTP endpoint. Responds with the masked
/// image as the raw body.
pub struct RemoteBackgroundRemover {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteBackgroundRemover {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, EngineError> {
        Ok(Self {
            client: build_client(timeout, "remover")?,
            endpoint,
        })
    }
}

#[async_trait]
impl BackgroundRemover for RemoteBackgroundRemover {
    async fn remove(&self, image: &[u8], params: &RemoveParams) -> Result<Removal, EngineError> {
        let mut form = Form::new().part(
            "image",
            Part::bytes(image.to_vec()).file_name("input"),
        );
        if let Some(smoothing) = params.smoothing {
            form = form.text("smoothing", smoothing.to_string());
        }

        let response = self
            .client
            .post(format!("{}/remove", self.endpoint))
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport("remover", e))?;
        let response = check_status("remover", response).await?;

        let masked = response.bytes().await.map_err(|e| transport("remover", e))?;
        Ok(Removal {
            masked_image: masked,
        })
    }
}

/// Job-based video synthesizer behind an HTTP endpoint.
pub struct RemoteVideoSynthesizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct PollResponse {
    state: JobState,
    result_url: Option<String>,
    error: Option<String>,
}

impl RemoteVideoSynthesizer {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            client: build_client(timeout, "video_synthesizer")?,
            endpoint,
            api_key,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl VideoSynthesizer for RemoteVideoSynthesizer {
    async fn submit_job(
        &self,
        image: &[u8],
        audio: &[u8],
        preset: Option<&str>,
    ) -> Result<String, EngineError> {
        let mut form = Form::new()
            .part("image", Part::bytes(image.to_vec()).file_name("avatar"))
            .part("audio", Part::bytes(audio.to_vec()).file_name("speech"));
        if let Some(preset) = preset {
            form = form.text("preset", preset.to_string());
        }

        let response = self
            .authorize(self.client.post(format!("{}/jobs", self.endpoint)))
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport("video_synthesizer", e))?;
        let response = check_status("video_synthesizer", response).await?;

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| transport("video_synthesizer", e))?;
        debug!(job_id = %body.job_id, "synthesis job accepted");
        Ok(body.job_id)
    }

    async fn poll_job(&self, job_id: &str) -> Result<JobStatus, EngineError> {
        let response = self
            .authorize(self.client.get(format!("{}/jobs/{}", self.endpoint, job_id)))
            .send()
            .await
            .map_err(|e| transport("video_synthesizer", e))?;
        let response = check_status("video_synthesizer", response).await?;

        let body: PollResponse = response
            .json()
            .await
            .map_err(|e| transport("video_synthesizer", e))?;
        Ok(JobStatus {
            state: body.state,
            result_url: body.result_url,
            error: body.error,
        })
    }

    async fn fetch_result(&self, url: &str) -> Result<Bytes, EngineError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport("video_synthesizer", e))?;
        let response = check_status("video_synthesizer", response).await?;
        response
            .bytes()
            .await
            .map_err(|e| transport("video_synthesizer", e))
    }
}
