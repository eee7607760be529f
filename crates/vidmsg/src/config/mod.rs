use anyhow::Result;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod defaults;
pub mod duration_serde;

use defaults::*;
use duration_serde::duration;

/// Top-level service configuration. Every section has workable defaults, so
/// an empty file (or no file at all) yields a runnable development setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gpu: GpuConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
}

/// Tier roots, retentions and cleanup cadence for the storage manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default = "default_temp_retention", with = "duration")]
    pub temp_retention: Duration,
    #[serde(default = "default_uploads_retention", with = "duration")]
    pub uploads_retention: Duration,
    #[serde(default = "default_processed_retention", with = "duration")]
    pub processed_retention: Duration,
    #[serde(default = "default_videos_retention", with = "duration")]
    pub videos_retention: Duration,
    #[serde(default = "default_cleanup_interval", with = "duration")]
    pub cleanup_interval: Duration,
    /// Free-byte floor below which cleanup runs its aggressive pass.
    #[serde(default = "default_disk_pressure_threshold_bytes")]
    pub disk_pressure_threshold_bytes: u64,
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
    #[serde(default = "default_max_audio_bytes")]
    pub max_audio_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            temp_retention: default_temp_retention(),
            uploads_retention: default_uploads_retention(),
            processed_retention: default_processed_retention(),
            videos_retention: default_videos_retention(),
            cleanup_interval: default_cleanup_interval(),
            disk_pressure_threshold_bytes: default_disk_pressure_threshold_bytes(),
            max_image_bytes: default_max_image_bytes(),
            max_audio_bytes: default_max_audio_bytes(),
        }
    }
}

/// GPU slot classes and the VRAM budget check. Slot counts and per-slot
/// footprints are deployment knobs; the sum of peaks must fit the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuConfig {
    #[serde(default = "default_device_vram_mb")]
    pub device_vram_mb: u64,
    #[serde(default = "default_detector_slots")]
    pub detector_slots: usize,
    #[serde(default = "default_detector_slot_vram_mb")]
    pub detector_slot_vram_mb: u64,
    #[serde(default = "default_segmenter_slots")]
    pub segmenter_slots: usize,
    #[serde(default = "default_segmenter_slot_vram_mb")]
    pub segmenter_slot_vram_mb: u64,
}

impl GpuConfig {
    /// Peak VRAM the configured slot classes can pin simultaneously.
    pub fn required_vram_mb(&self) -> u64 {
        self.detector_slots as u64 * self.detector_slot_vram_mb
            + self.segmenter_slots as u64 * self.segmenter_slot_vram_mb
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            device_vram_mb: default_device_vram_mb(),
            detector_slots: default_detector_slots(),
            detector_slot_vram_mb: default_detector_slot_vram_mb(),
            segmenter_slots: default_segmenter_slots(),
            segmenter_slot_vram_mb: default_segmenter_slot_vram_mb(),
        }
    }
}

/// Per-stage deadlines, retry counts and the video-engine polling schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_detection_timeout", with = "duration")]
    pub detection_timeout: Duration,
    #[serde(default = "default_segmentation_timeout", with = "duration")]
    pub segmentation_timeout: Duration,
    #[serde(default = "default_submit_timeout", with = "duration")]
    pub submit_timeout: Duration,
    /// Overall budget for polling the video engine to a terminal state.
    #[serde(default = "default_poll_deadline", with = "duration")]
    pub poll_deadline: Duration,
    #[serde(default = "default_finalize_timeout", with = "duration")]
    pub finalize_timeout: Duration,
    #[serde(default = "default_poll_initial_delay", with = "duration")]
    pub poll_initial_delay: Duration,
    #[serde(default = "default_poll_backoff_multiplier")]
    pub poll_backoff_multiplier: f64,
    #[serde(default = "default_poll_max_delay", with = "duration")]
    pub poll_max_delay: Duration,
    /// Retries for retriable engine failures within a stage.
    #[serde(default = "default_engine_retries")]
    pub engine_retries: u32,
    /// Retries for transport errors while polling the video engine.
    #[serde(default = "default_poll_transport_retries")]
    pub poll_transport_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection_timeout: default_detection_timeout(),
            segmentation_timeout: default_segmentation_timeout(),
            submit_timeout: default_submit_timeout(),
            poll_deadline: default_poll_deadline(),
            finalize_timeout: default_finalize_timeout(),
            poll_initial_delay: default_poll_initial_delay(),
            poll_backoff_multiplier: default_poll_backoff_multiplier(),
            poll_max_delay: default_poll_max_delay(),
            engine_retries: default_engine_retries(),
            poll_transport_retries: default_poll_transport_retries(),
        }
    }
}

/// Progress hub sizing and liveness knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_subscriber_queue_depth")]
    pub subscriber_queue_depth: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// How long terminal task state is kept for late subscribers.
    #[serde(default = "default_terminal_retention", with = "duration")]
    pub terminal_retention: Duration,
    #[serde(default = "default_heartbeat_interval", with = "duration")]
    pub heartbeat_interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_depth: default_subscriber_queue_depth(),
            history_limit: default_history_limit(),
            terminal_retention: default_terminal_retention(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

/// Task registry admission cap and purge grace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_max_active_tasks")]
    pub max_active_tasks: usize,
    #[serde(default = "default_purge_grace", with = "duration")]
    pub purge_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_active_tasks: default_max_active_tasks(),
            purge_grace: default_purge_grace(),
        }
    }
}

/// Endpoints for the external engines the binary talks to over HTTP. The
/// library core takes engine trait objects directly; tests inject in-process
/// doubles and never touch this section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnginesConfig {
    pub detector_endpoint: Option<String>,
    pub remover_endpoint: Option<String>,
    pub video_endpoint: Option<String>,
    pub video_api_key: Option<String>,
    #[serde(default = "default_engine_request_timeout", with = "duration")]
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration from a TOML file with `VIDMSG_*` environment
    /// overrides (`VIDMSG_STORAGE__ROOT=/srv/vidmsg` style nesting).
    pub fn load_from_file(path: &str) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VIDMSG_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Startup validation. Failures here are configuration errors the binary
    /// turns into a non-zero exit: an unwritable storage root, or slot
    /// classes whose combined peak VRAM oversubscribes the device.
    pub fn validate(&self) -> Result<()> {
        if self.gpu.detector_slots == 0 || self.gpu.segmenter_slots == 0 {
            anyhow::bail!(
                "GPU configuration invalid: each slot class needs at least one slot \
                 (detector={}, segmenter={})",
                self.gpu.detector_slots,
                self.gpu.segmenter_slots
            );
        }

        let required = self.gpu.required_vram_mb();
        if required > self.gpu.device_vram_mb {
            anyhow::bail!(
                "GPU capacity insufficient: slot classes need {} MB peak but device has {} MB",
                required,
                self.gpu.device_vram_mb
            );
        }

        if self.pipeline.poll_backoff_multiplier < 1.0 {
            anyhow::bail!(
                "poll_backoff_multiplier must be >= 1.0 (got {})",
                self.pipeline.poll_backoff_multiplier
            );
        }

        // Storage root must exist (or be creatable) and accept writes
        std::fs::create_dir_all(&self.storage.root).map_err(|e| {
            anyhow::anyhow!(
                "storage root {:?} cannot be created: {}",
                self.storage.root,
                e
            )
        })?;
        let probe = self.storage.root.join(".write-probe");
        std::fs::write(&probe, b"probe").map_err(|e| {
            anyhow::anyhow!("storage root {:?} is not writable: {}", self.storage.root, e)
        })?;
        let _ = std::fs::remove_file(&probe);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let config = Config::default();
        assert_eq!(config.gpu.required_vram_mb(), 2 * 2048 + 6144);
        assert!(config.gpu.required_vram_mb() <= config.gpu.device_vram_mb);
        assert_eq!(config.registry.max_active_tasks, 50);
        assert_eq!(config.progress.subscriber_queue_depth, 64);
    }

    #[test]
    fn validate_accepts_defaults_in_temp_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.root = dir.path().join("data");
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_vram_oversubscription() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.root = dir.path().to_path_buf();
        config.gpu.device_vram_mb = 4096;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("GPU capacity insufficient"));
    }

    #[test]
    fn validate_rejects_zero_slot_classes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.root = dir.path().to_path_buf();
        config.gpu.segmenter_slots = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_durations_are_human_readable() {
        let toml = r#"
            [storage]
            temp_retention = "30m"
            cleanup_interval = "15m"

            [pipeline]
            poll_deadline = "2m"
        "#;
        let config: Config = ::toml::from_str(toml).unwrap();
        assert_eq!(config.storage.temp_retention, Duration::from_secs(1800));
        assert_eq!(config.storage.cleanup_interval, Duration::from_secs(900));
        assert_eq!(config.pipeline.poll_deadline, Duration::from_secs(120));
        // Untouched sections keep defaults
        assert_eq!(config.gpu.detector_slots, 2);
    }
}
