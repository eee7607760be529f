//! Default values for configuration fields.

use std::path::PathBuf;
use std::time::Duration;

pub fn default_storage_root() -> PathBuf {
    PathBuf::from("./data")
}

pub fn default_temp_retention() -> Duration {
    Duration::from_secs(60 * 60)
}

pub fn default_uploads_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

pub fn default_processed_retention() -> Duration {
    Duration::from_secs(3 * 24 * 60 * 60)
}

pub fn default_videos_retention() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

pub fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

pub fn default_disk_pressure_threshold_bytes() -> u64 {
    5 * 1024 * 1024 * 1024
}

pub fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}

pub fn default_max_audio_bytes() -> usize {
    20 * 1024 * 1024
}

pub fn default_device_vram_mb() -> u64 {
    16 * 1024
}

pub fn default_detector_slots() -> usize {
    2
}

pub fn default_detector_slot_vram_mb() -> u64 {
    2 * 1024
}

pub fn default_segmenter_slots() -> usize {
    1
}

pub fn default_segmenter_slot_vram_mb() -> u64 {
    6 * 1024
}

pub fn default_detection_timeout() -> Duration {
    Duration::from_secs(30)
}

pub fn default_segmentation_timeout() -> Duration {
    Duration::from_secs(60)
}

pub fn default_submit_timeout() -> Duration {
    Duration::from_secs(30)
}

pub fn default_poll_deadline() -> Duration {
    Duration::from_secs(5 * 60)
}

pub fn default_finalize_timeout() -> Duration {
    Duration::from_secs(30)
}

pub fn default_poll_initial_delay() -> Duration {
    Duration::from_secs(2)
}

pub fn default_poll_backoff_multiplier() -> f64 {
    1.5
}

pub fn default_poll_max_delay() -> Duration {
    Duration::from_secs(15)
}

pub fn default_engine_retries() -> u32 {
    2
}

pub fn default_poll_transport_retries() -> u32 {
    3
}

pub fn default_subscriber_queue_depth() -> usize {
    64
}

pub fn default_history_limit() -> usize {
    256
}

pub fn default_terminal_retention() -> Duration {
    Duration::from_secs(60 * 60)
}

pub fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

pub fn default_max_active_tasks() -> usize {
    50
}

pub fn default_purge_grace() -> Duration {
    Duration::from_secs(60 * 60)
}

pub fn default_engine_request_timeout() -> Duration {
    Duration::from_secs(30)
}
