//! The pipeline orchestrator: drives one request end-to-end.
//!
//! `execute` validates inputs, registers the task and returns immediately;
//! a spawned worker walks the stage machine. Every stored artifact goes on a
//! rollback ledger; any stage failure releases the ledger in reverse order,
//! records the terminal failure, and publishes a final `failed` event.
//! Cancellation is observed at every suspension point; in-flight engine
//! calls complete and their outputs are released by the same rollback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tiered_file_manager::FileTypeValidator;

use crate::config::Config;
use crate::engines::{DetectParams, EngineSet, JobState, RemoveParams};
use crate::errors::{EngineError, PipelineError, PipelineResult};
use crate::gpu::{AcquireError, GpuScheduler};
use crate::models::{EventDraft, GpuClass, Request, Stage, TaskRecord, Tier};
use crate::progress::ProgressHub;
use crate::registry::TaskRegistry;
use crate::storage::StorageManager;
use crate::utils::retry::{RetryConfig, retry_engine_call};

// Progress anchors for each stage of the success path.
const UPLOAD_PROGRESS: u8 = 20;
const DETECTION_ENTRY: u8 = 25;
const DETECTION_DONE: u8 = 40;
const REMOVAL_ENTRY: u8 = 50;
const REMOVAL_DONE: u8 = 60;
const VIDEO_UPLOAD_PROGRESS: u8 = 70;
const POLL_ENTRY: u8 = 75;
const POLL_DONE: u8 = 80;
const FINALIZING_PROGRESS: u8 = 90;

/// Coordinates one request through detection, segmentation and synthesis.
/// Owns no task state of its own beyond the per-task cancel tokens; records
/// live in the registry, artifacts in storage, events in the hub.
pub struct PipelineOrchestrator {
    config: crate::config::PipelineConfig,
    max_image_bytes: usize,
    max_audio_bytes: usize,
    registry: Arc<TaskRegistry>,
    scheduler: Arc<GpuScheduler>,
    hub: Arc<ProgressHub>,
    storage: Arc<StorageManager>,
    engines: EngineSet,
    cancel_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    image_validator: FileTypeValidator,
    audio_validator: FileTypeValidator,
}

impl PipelineOrchestrator {
    pub fn new(
        config: &Config,
        registry: Arc<TaskRegistry>,
        scheduler: Arc<GpuScheduler>,
        hub: Arc<ProgressHub>,
        storage: Arc<StorageManager>,
        engines: EngineSet,
    ) -> Self {
        Self {
            config: config.pipeline.clone(),
            max_image_bytes: config.storage.max_image_bytes,
            max_audio_bytes: config.storage.max_audio_bytes,
            registry,
            scheduler,
            hub,
            storage,
            engines,
            cancel_tokens: Mutex::new(HashMap::new()),
            image_validator: FileTypeValidator::images(),
            audio_validator: FileTypeValidator::audio(),
        }
    }

    /// Accept a request: validate, register, spawn the worker, return the
    /// task id. Invalid inputs and over-cap submissions fail fast with no
    /// task registered.
    pub fn execute(self: &Arc<Self>, request: Request) -> PipelineResult<Uuid> {
        self.validate_request(&request)?;

        let task_id = Uuid::new_v4();
        self.registry
            .register(TaskRecord::new(task_id))
            .map_err(PipelineError::from)?;
        self.hub.ensure_task(task_id);
        self.hub.publish(
            task_id,
            EventDraft::stage_start(Stage::Initialized, 0, "request accepted"),
        );

        let cancel = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .expect("cancel token lock poisoned")
            .insert(task_id, cancel.clone());

        info!(task_id = %task_id, "pipeline accepted request");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_pipeline(task_id, request, cancel).await;
        });

        Ok(task_id)
    }

    /// Request cancellation. Observed at the next suspension point; the task
    /// terminates as `failed` with kind `canceled`. Idempotent: repeat calls
    /// (including on already-terminal tasks) simply acknowledge.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let tokens = self
            .cancel_tokens
            .lock()
            .expect("cancel token lock poisoned");
        if let Some(token) = tokens.get(&task_id) {
            debug!(task_id = %task_id, "cancel requested");
            token.cancel();
            return true;
        }
        drop(tokens);
        // Already terminal (token cleaned up) or never registered
        self.registry.get(task_id).is_some()
    }

    fn validate_request(&self, request: &Request) -> PipelineResult<()> {
        if request.image_bytes.is_empty() {
            return Err(PipelineError::invalid_input("image is empty"));
        }
        if request.image_bytes.len() > self.max_image_bytes {
            return Err(PipelineError::invalid_input(format!(
                "image is {} bytes, limit is {}",
                request.image_bytes.len(),
                self.max_image_bytes
            )));
        }
        let image_info = self
            .image_validator
            .validate_bytes(&request.image_bytes)
            .map_err(|e| PipelineError::invalid_input(format!("unsupported image: {e}")))?;
        if image_info.mime_type != request.image_content_type {
            return Err(PipelineError::invalid_input(format!(
                "image declared as {} but content is {}",
                request.image_content_type, image_info.mime_type
            )));
        }

        if request.audio_bytes.is_empty() {
            return Err(PipelineError::invalid_input("audio is empty"));
        }
        if request.audio_bytes.len() > self.max_audio_bytes {
            return Err(PipelineError::invalid_input(format!(
                "audio is {} bytes, limit is {}",
                request.audio_bytes.len(),
                self.max_audio_bytes
            )));
        }
        let audio_info = self
            .audio_validator
            .validate_bytes(&request.audio_bytes)
            .map_err(|e| PipelineError::invalid_input(format!("unsupported audio: {e}")))?;
        if audio_info.mime_type != request.audio_content_type {
            return Err(PipelineError::invalid_input(format!(
                "audio declared as {} but content is {}",
                request.audio_content_type, audio_info.mime_type
            )));
        }

        Ok(())
    }

    async fn run_pipeline(
        self: Arc<Self>,
        task_id: Uuid,
        request: Request,
        cancel: CancellationToken,
    ) {
        let mut ledger: Vec<String> = Vec::new();
        match self.run_stages(task_id, &request, &cancel, &mut ledger).await {
            Ok(()) => {
                info!(task_id = %task_id, "pipeline completed");
            }
            Err(err) => {
                self.fail_task(task_id, &err, &ledger).await;
            }
        }
        self.cancel_tokens
            .lock()
            .expect("cancel token lock poisoned")
            .remove(&task_id);
    }

    async fn run_stages(
        &self,
        task_id: Uuid,
        request: &Request,
        cancel: &CancellationToken,
        ledger: &mut Vec<String>,
    ) -> PipelineResult<()> {
        let retry = RetryConfig::with_retries(self.config.engine_retries);

        // upload: persist the inputs
        Self::ensure_not_canceled(cancel)?;
        self.enter_stage(task_id, Stage::Upload, UPLOAD_PROGRESS, "storing inputs")
            .await?;
        let image_name = format!("input.{}", extension_for(&request.image_content_type));
        let image_path = self
            .storage
            .put_owned(Tier::Uploads, &request.image_bytes, &image_name, task_id)
            .await?;
        self.record_artifact(task_id, &image_path, ledger).await?;
        let audio_name = format!("speech.{}", extension_for(&request.audio_content_type));
        let audio_path = self
            .storage
            .put_owned(Tier::Uploads, &request.audio_bytes, &audio_name, task_id)
            .await?;
        self.record_artifact(task_id, &audio_path, ledger).await?;
        self.hub.publish(
            task_id,
            EventDraft::stage_complete(Stage::Upload, UPLOAD_PROGRESS, "inputs stored"),
        );

        // detection: detector slot held for the inference call only
        Self::ensure_not_canceled(cancel)?;
        self.enter_stage(
            task_id,
            Stage::Detection,
            DETECTION_ENTRY,
            "waiting for detector slot",
        )
        .await?;
        // One stage deadline covers the slot wait and the inference call
        let stage_started = Instant::now();
        let lease = self
            .scheduler
            .acquire(
                GpuClass::Detector,
                task_id,
                self.config.detection_timeout,
                cancel,
            )
            .await
            .map_err(|e| Self::map_acquire(e, Stage::Detection))?;
        let params = DetectParams {
            confidence: request.overrides.detection_confidence,
        };
        let call_budget = self
            .config
            .detection_timeout
            .saturating_sub(stage_started.elapsed());
        let outcome = timeout(
            call_budget,
            retry_engine_call(&retry, "detect", || {
                self.engines.detector.detect(&request.image_bytes, &params)
            }),
        )
        .await;
        self.scheduler.release(lease);
        let detection = match outcome {
            Err(_elapsed) => Err(PipelineError::Timeout {
                stage: Stage::Detection,
            }),
            Ok(result) => result.map_err(PipelineError::from),
        }?;
        let crop_path = self
            .storage
            .put_owned(Tier::Processed, &detection.annotated_image, "person.png", task_id)
            .await?;
        self.record_artifact(task_id, &crop_path, ledger).await?;
        self.publish_progress(
            task_id,
            Stage::Detection,
            DETECTION_DONE,
            &format!("person selected from {} candidate(s)", detection.persons.len()),
        )
        .await?;

        // background removal: segmenter slot; detector slot already released
        Self::ensure_not_canceled(cancel)?;
        self.enter_stage(
            task_id,
            Stage::BackgroundRemoval,
            REMOVAL_ENTRY,
            "waiting for segmenter slot",
        )
        .await?;
        let stage_started = Instant::now();
        let lease = self
            .scheduler
            .acquire(
                GpuClass::Segmenter,
                task_id,
                self.config.segmentation_timeout,
                cancel,
            )
            .await
            .map_err(|e| Self::map_acquire(e, Stage::BackgroundRemoval))?;
        let remove_params = RemoveParams {
            smoothing: request.overrides.smoothing,
        };
        let call_budget = self
            .config
            .segmentation_timeout
            .saturating_sub(stage_started.elapsed());
        let outcome = timeout(
            call_budget,
            retry_engine_call(&retry, "remove_background", || {
                self.engines
                    .remover
                    .remove(&detection.annotated_image, &remove_params)
            }),
        )
        .await;
        self.scheduler.release(lease);
        let removal = match outcome {
            Err(_elapsed) => Err(PipelineError::Timeout {
                stage: Stage::BackgroundRemoval,
            }),
            Ok(result) => result.map_err(PipelineError::from),
        }?;
        let masked_path = self
            .storage
            .put_owned(Tier::Processed, &removal.masked_image, "masked.png", task_id)
            .await?;
        self.record_artifact(task_id, &masked_path, ledger).await?;
        self.publish_progress(
            task_id,
            Stage::BackgroundRemoval,
            REMOVAL_DONE,
            "background removed",
        )
        .await?;

        // video upload: no local GPU slots from here on
        Self::ensure_not_canceled(cancel)?;
        self.enter_stage(
            task_id,
            Stage::VideoUpload,
            VIDEO_UPLOAD_PROGRESS,
            "submitting synthesis job",
        )
        .await?;
        let preset = request.overrides.preset.as_deref();
        let outcome = timeout(
            self.config.submit_timeout,
            retry_engine_call(&retry, "submit_job", || {
                self.engines
                    .synthesizer
                    .submit_job(&removal.masked_image, &request.audio_bytes, preset)
            }),
        )
        .await;
        let job_id = match outcome {
            Err(_elapsed) => Err(PipelineError::Timeout {
                stage: Stage::VideoUpload,
            }),
            Ok(result) => result.map_err(PipelineError::from),
        }?;
        self.hub.publish(
            task_id,
            EventDraft::stage_complete(
                Stage::VideoUpload,
                VIDEO_UPLOAD_PROGRESS,
                format!("job {job_id} accepted"),
            ),
        );

        // video processing: poll to terminal with bounded backoff
        self.enter_stage(
            task_id,
            Stage::VideoProcessing,
            POLL_ENTRY,
            "synthesis in progress",
        )
        .await?;
        let result_url = self.poll_video_engine(task_id, &job_id, cancel).await?;

        // finalizing: copy the result into the videos tier so retention is
        // governed locally
        Self::ensure_not_canceled(cancel)?;
        self.enter_stage(
            task_id,
            Stage::Finalizing,
            FINALIZING_PROGRESS,
            "downloading result",
        )
        .await?;
        let video_bytes = match timeout(
            self.config.finalize_timeout,
            self.engines.synthesizer.fetch_result(&result_url),
        )
        .await
        {
            Err(_elapsed) => Err(PipelineError::Timeout {
                stage: Stage::Finalizing,
            }),
            Ok(result) => result.map_err(PipelineError::from),
        }?;
        let video_path = self
            .storage
            .put_owned(Tier::Videos, &video_bytes, "message.mp4", task_id)
            .await?;
        self.record_artifact(task_id, &video_path, ledger).await?;

        // completed
        self.registry
            .update(task_id, |r| {
                let mut next = r.clone();
                next.stage = Stage::Completed;
                next.progress_percent = 100;
                next
            })
            .await?;
        self.hub.publish(
            task_id,
            EventDraft::stage_complete(Stage::Completed, 100, "video message ready"),
        );
        Ok(())
    }

    /// Poll the video engine until terminal, with bounded exponential
    /// backoff. Progress advances inside the 75..=80 window per poll.
    async fn poll_video_engine(
        &self,
        task_id: Uuid,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let started = Instant::now();
        let mut delay = self.config.poll_initial_delay;
        let mut transport_failures = 0u32;
        let mut polls = 0u8;

        loop {
            Self::ensure_not_canceled(cancel)?;
            let Some(remaining) = self.config.poll_deadline.checked_sub(started.elapsed()) else {
                return Err(PipelineError::Timeout {
                    stage: Stage::VideoProcessing,
                });
            };

            tokio::select! {
                _ = tokio::time::sleep(delay.min(remaining)) => {}
                _ = cancel.cancelled() => return Err(PipelineError::Canceled),
            }
            if started.elapsed() >= self.config.poll_deadline {
                return Err(PipelineError::Timeout {
                    stage: Stage::VideoProcessing,
                });
            }

            match self.engines.synthesizer.poll_job(job_id).await {
                Ok(status) => {
                    transport_failures = 0;
                    match status.state {
                        JobState::Queued | JobState::Running => {
                            polls = polls.saturating_add(1);
                            let progress = POLL_ENTRY.saturating_add(polls).min(POLL_DONE);
                            self.publish_progress(
                                task_id,
                                Stage::VideoProcessing,
                                progress,
                                "synthesis running",
                            )
                            .await?;
                            delay = delay
                                .mul_f64(self.config.poll_backoff_multiplier)
                                .min(self.config.poll_max_delay);
                        }
                        JobState::Done => {
                            let url = status.result_url.ok_or_else(|| {
                                PipelineError::internal(
                                    "video engine reported done without a result url",
                                )
                            })?;
                            self.publish_progress(
                                task_id,
                                Stage::VideoProcessing,
                                POLL_DONE,
                                "synthesis finished",
                            )
                            .await?;
                            return Ok(url);
                        }
                        JobState::Error => {
                            return Err(PipelineError::from(EngineError::JobFailed {
                                message: status
                                    .error
                                    .unwrap_or_else(|| "unreported failure".to_string()),
                            }));
                        }
                    }
                }
                Err(err @ EngineError::Transport { .. })
                    if transport_failures < self.config.poll_transport_retries =>
                {
                    transport_failures += 1;
                    warn!(
                        task_id = %task_id,
                        attempt = transport_failures,
                        "poll transport error, backing off: {}",
                        err
                    );
                    delay = delay
                        .mul_f64(self.config.poll_backoff_multiplier)
                        .min(self.config.poll_max_delay);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Terminal failure path: release the ledger in reverse order
    /// (best-effort, idempotent, never raises), freeze the record as
    /// `failed`, publish the final event.
    async fn fail_task(&self, task_id: Uuid, err: &PipelineError, ledger: &[String]) {
        let record = self.registry.get(task_id);
        let stage_at_failure = record.as_ref().map(|r| r.stage).unwrap_or(Stage::Failed);
        let last_progress = record.as_ref().map(|r| r.progress_percent).unwrap_or(0);

        warn!(
            task_id = %task_id,
            stage = %stage_at_failure,
            kind = err.kind(),
            "pipeline failed: {}",
            err
        );

        for path in ledger.iter().rev() {
            match self.storage.release(path).await {
                Ok(_) => {}
                Err(release_err) => {
                    warn!(
                        task_id = %task_id,
                        path = %path,
                        "rollback release failed, skipping: {}",
                        release_err
                    );
                }
            }
        }

        let failure = err.to_failure(stage_at_failure);
        let updated = self
            .registry
            .update(task_id, |r| {
                let mut next = r.clone();
                next.stage = Stage::Failed;
                next.error = Some(failure.clone());
                next.artifact_paths.clear();
                next
            })
            .await;
        if let Err(update_err) = updated {
            error!(
                task_id = %task_id,
                "could not record terminal failure: {}",
                update_err
            );
        }

        self.hub.publish(
            task_id,
            EventDraft::failed(
                stage_at_failure,
                last_progress,
                format!("{}: {}", failure.error_kind, failure.message),
            ),
        );
    }

    async fn enter_stage(
        &self,
        task_id: Uuid,
        stage: Stage,
        progress: u8,
        message: &str,
    ) -> PipelineResult<()> {
        self.registry
            .update(task_id, |r| {
                let mut next = r.clone();
                next.stage = stage;
                next.progress_percent = progress.max(r.progress_percent);
                next
            })
            .await?;
        self.hub
            .publish(task_id, EventDraft::stage_start(stage, progress, message));
        Ok(())
    }

    async fn publish_progress(
        &self,
        task_id: Uuid,
        stage: Stage,
        progress: u8,
        message: &str,
    ) -> PipelineResult<()> {
        self.registry
            .update(task_id, |r| {
                let mut next = r.clone();
                next.progress_percent = progress.max(r.progress_percent);
                next
            })
            .await?;
        self.hub.publish(
            task_id,
            EventDraft::stage_progress(stage, progress, message),
        );
        Ok(())
    }

    async fn record_artifact(
        &self,
        task_id: Uuid,
        path: &str,
        ledger: &mut Vec<String>,
    ) -> PipelineResult<()> {
        ledger.push(path.to_string());
        self.registry
            .update(task_id, |r| {
                let mut next = r.clone();
                next.artifact_paths.push(path.to_string());
                next
            })
            .await?;
        Ok(())
    }

    fn ensure_not_canceled(cancel: &CancellationToken) -> PipelineResult<()> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Canceled);
        }
        Ok(())
    }

    fn map_acquire(err: AcquireError, stage: Stage) -> PipelineError {
        match err {
            AcquireError::Timeout => PipelineError::Timeout { stage },
            AcquireError::Canceled => PipelineError::Canceled,
        }
    }
}

/// File extension for a declared content type, for debuggable artifact names.
fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "audio/x-wav" => "wav",
        "audio/mpeg" => "mp3",
        "audio/m4a" => "m4a",
        "audio/ogg" => "ogg",
        _ => "bin",
    }
}
