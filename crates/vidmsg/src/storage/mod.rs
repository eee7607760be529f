//! Tiered storage manager.
//!
//! Four retention tiers (`temp`, `uploads`, `processed`, `videos`) live under
//! one storage root, each backed by its own sandboxed [`FileManager`]. The
//! manager assigns artifact names (`<tier>/<uuid><ext>`), keeps an in-process
//! metadata index, and journals every put/release to an append-only
//! `index.log` replayed at startup. Periodic cleanup sweeps each tier by
//! retention, exempting artifacts that still belong to in-flight tasks, and
//! turns aggressive when free disk space drops below the configured floor.

pub mod index_log;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tiered_file_manager::{AgeBasis, CleanupPolicy, FileManager};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::errors::StorageError;
use crate::models::Tier;
use crate::registry::TaskRegistry;
use index_log::{IndexLog, IndexOp, IndexRecord};

/// Metadata for one live artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactMeta {
    /// Tier-qualified path (`<tier>/<file>`), stable for the artifact's life.
    pub path: String,
    pub tier: Tier,
    pub size: u64,
    /// Owning task, when the artifact was produced by a pipeline stage.
    pub task_id: Option<Uuid>,
    pub created_at: chrono::DateTime<Utc>,
    /// Per-artifact retention replacing the tier default when set.
    pub retention_override: Option<Duration>,
}

/// Optional knobs for [`StorageManager::put_with`].
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub owner: Option<Uuid>,
    pub retention_override: Option<Duration>,
}

/// Per-tier usage as reported by [`StorageManager::stat`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TierStats {
    pub count: usize,
    pub bytes: u64,
}

/// Storage statistics for operators and the admission layer.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub per_tier: BTreeMap<String, TierStats>,
    pub free_bytes: u64,
    pub used_percent: f64,
}

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupSummary {
    pub files_removed: usize,
    pub aggressive: bool,
}

/// Tiered, retention-driven artifact store.
pub struct StorageManager {
    config: StorageConfig,
    tiers: HashMap<Tier, FileManager>,
    index: RwLock<HashMap<String, ArtifactMeta>>,
    log: IndexLog,
}

impl StorageManager {
    /// Build the tier managers under `config.root`, then rebuild the live
    /// index by replaying `index.log` against what is actually on disk:
    /// a `put` without a matching file is dropped, a `release` removes its
    /// entry.
    pub async fn new(config: StorageConfig) -> Result<Self, StorageError> {
        let mut tiers = HashMap::new();
        for tier in Tier::all() {
            let retention = match tier {
                Tier::Temp => config.temp_retention,
                Tier::Uploads => config.uploads_retention,
                Tier::Processed => config.processed_retention,
                Tier::Videos => config.videos_retention,
            };
            let manager = FileManager::builder()
                .base_directory(config.root.join(tier.dir_name()))
                .cleanup_policy(
                    CleanupPolicy::new()
                        .remove_after(retention)
                        .basis(AgeBasis::Created),
                )
                .build()
                .await?;
            tiers.insert(tier, manager);
        }

        let log_path = config.root.join("index.log");
        let replayed = IndexLog::replay(&log_path).await?;
        let log = IndexLog::open(&log_path).await?;

        let mut index = HashMap::new();
        let mut dropped = 0usize;
        for record in replayed {
            match record.op {
                IndexOp::Put => {
                    let exists = Self::tier_file(&tiers, &record.path)
                        .map(|(manager, file)| manager.exists(file).unwrap_or(false))
                        .unwrap_or(false);
                    if exists {
                        index.insert(
                            record.path.clone(),
                            ArtifactMeta {
                                path: record.path,
                                tier: record.tier,
                                size: record.size,
                                task_id: record.task_id,
                                created_at: record.created_at,
                                retention_override: None,
                            },
                        );
                    } else {
                        dropped += 1;
                    }
                }
                IndexOp::Release => {
                    index.remove(&record.path);
                }
            }
        }
        if dropped > 0 {
            info!("dropped {} index entries without backing files", dropped);
        }
        let live = index.len();

        let manager = Self {
            config,
            tiers,
            index: RwLock::new(index),
            log,
        };

        info!(
            "storage manager ready at {:?} ({} live artifacts)",
            manager.config.root, live
        );
        Ok(manager)
    }

    fn tier_file<'a>(
        tiers: &'a HashMap<Tier, FileManager>,
        path: &'a str,
    ) -> Result<(&'a FileManager, &'a str), StorageError> {
        let (tier_name, file) = path.split_once('/').ok_or_else(|| StorageError::InvalidPath {
            path: path.to_string(),
        })?;
        if file.is_empty() || file.contains('/') {
            return Err(StorageError::InvalidPath {
                path: path.to_string(),
            });
        }
        let tier = Tier::from_dir_name(tier_name).ok_or_else(|| StorageError::InvalidPath {
            path: path.to_string(),
        })?;
        let manager = tiers.get(&tier).ok_or_else(|| StorageError::UnknownPath {
            path: path.to_string(),
        })?;
        Ok((manager, file))
    }

    /// Store bytes in a tier. The returned path is assigned by the manager;
    /// `suggested_name` only contributes its extension for debuggability.
    pub async fn put(
        &self,
        tier: Tier,
        bytes: &[u8],
        suggested_name: &str,
    ) -> Result<String, StorageError> {
        self.put_with(tier, bytes, suggested_name, PutOptions::default())
            .await
    }

    /// Store bytes owned by a pipeline task.
    pub async fn put_owned(
        &self,
        tier: Tier,
        bytes: &[u8],
        suggested_name: &str,
        task_id: Uuid,
    ) -> Result<String, StorageError> {
        self.put_with(
            tier,
            bytes,
            suggested_name,
            PutOptions {
                owner: Some(task_id),
                ..PutOptions::default()
            },
        )
        .await
    }

    /// Store bytes with full options. The write is atomic: a partially
    /// written artifact is never observable under its final name.
    pub async fn put_with(
        &self,
        tier: Tier,
        bytes: &[u8],
        suggested_name: &str,
        options: PutOptions,
    ) -> Result<String, StorageError> {
        let ext = Path::new(suggested_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let file_name = format!("{}{}", Uuid::new_v4().simple(), ext);

        let manager = self.tiers.get(&tier).ok_or_else(|| StorageError::UnknownPath {
            path: tier.dir_name().to_string(),
        })?;
        let size = manager.write_atomic(&file_name, bytes).await?;

        let path = format!("{}/{}", tier.dir_name(), file_name);
        let meta = ArtifactMeta {
            path: path.clone(),
            tier,
            size,
            task_id: options.owner,
            created_at: Utc::now(),
            retention_override: options.retention_override,
        };
        let record = IndexRecord {
            op: IndexOp::Put,
            tier,
            path: path.clone(),
            size,
            task_id: options.owner,
            created_at: meta.created_at,
        };

        self.index
            .write()
            .expect("storage index lock poisoned")
            .insert(path.clone(), meta);
        self.log.append(&record).await?;

        debug!(path = %path, size, "artifact stored");
        Ok(path)
    }

    /// Read an artifact back.
    pub async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let (manager, file) = Self::tier_file(&self.tiers, path)?;
        Ok(manager.read(file).await?)
    }

    /// Immediately delete an artifact. Releasing an unknown or already
    /// released path is a no-op; returns whether anything was deleted.
    pub async fn release(&self, path: &str) -> Result<bool, StorageError> {
        let (manager, file) = Self::tier_file(&self.tiers, path)?;

        let meta = self
            .index
            .write()
            .expect("storage index lock poisoned")
            .remove(path);
        let removed = manager.remove_file(file).await?;

        if let Some(meta) = meta {
            self.log
                .append(&IndexRecord {
                    op: IndexOp::Release,
                    tier: meta.tier,
                    path: path.to_string(),
                    size: meta.size,
                    task_id: meta.task_id,
                    created_at: meta.created_at,
                })
                .await?;
        }

        if removed {
            debug!(path = %path, "artifact released");
        }
        Ok(removed)
    }

    /// Metadata snapshot for one artifact.
    pub fn meta(&self, path: &str) -> Option<ArtifactMeta> {
        self.index
            .read()
            .expect("storage index lock poisoned")
            .get(path)
            .cloned()
    }

    /// Paths of artifacts owned by a task, in no particular order.
    pub fn artifacts_owned_by(&self, task_id: Uuid) -> Vec<String> {
        self.index
            .read()
            .expect("storage index lock poisoned")
            .values()
            .filter(|m| m.task_id == Some(task_id))
            .map(|m| m.path.clone())
            .collect()
    }

    /// Per-tier usage, free bytes and used percentage.
    pub fn stat(&self) -> StorageStats {
        let mut per_tier: BTreeMap<String, TierStats> = Tier::all()
            .into_iter()
            .map(|t| (t.dir_name().to_string(), TierStats::default()))
            .collect();

        {
            let index = self.index.read().expect("storage index lock poisoned");
            for meta in index.values() {
                let entry = per_tier.entry(meta.tier.dir_name().to_string()).or_default();
                entry.count += 1;
                entry.bytes += meta.size;
            }
        }

        let (free_bytes, used_percent) = self.disk_usage();
        StorageStats {
            per_tier,
            free_bytes,
            used_percent,
        }
    }

    /// Free space and used percentage of the disk holding the storage root.
    /// Unknown mounts report effectively-infinite free space so pressure
    /// handling stays quiet rather than thrashing.
    fn disk_usage(&self) -> (u64, f64) {
        let root = self
            .config
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.config.root.clone());

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let best = disks
            .list()
            .iter()
            .filter(|d| root.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());

        match best {
            Some(disk) => {
                let total = disk.total_space();
                let available = disk.available_space();
                let used_percent = if total > 0 {
                    ((total - available) as f64 / total as f64) * 100.0
                } else {
                    0.0
                };
                (available, used_percent)
            }
            None => (u64::MAX, 0.0),
        }
    }

    /// Retention pass over every tier. `live_tasks` are the non-terminal
    /// tasks whose artifacts are exempt regardless of tier retention.
    /// Pressure is decided from free disk space; see
    /// [`Self::cleanup_with_pressure`] for the mechanics.
    pub async fn cleanup(&self, live_tasks: &HashSet<Uuid>) -> CleanupSummary {
        let (free_bytes, _) = self.disk_usage();
        let aggressive = free_bytes < self.config.disk_pressure_threshold_bytes;
        if aggressive {
            warn!(
                free_bytes,
                threshold = self.config.disk_pressure_threshold_bytes,
                "disk pressure: running aggressive cleanup pass"
            );
        }
        self.cleanup_with_pressure(live_tasks, aggressive).await
    }

    /// Retention pass with an explicit pressure decision. Under pressure the
    /// `temp` tier is cleared at any age and `processed` retention is halved
    /// for this pass.
    pub async fn cleanup_with_pressure(
        &self,
        live_tasks: &HashSet<Uuid>,
        aggressive: bool,
    ) -> CleanupSummary {
        let mut summary = CleanupSummary {
            files_removed: 0,
            aggressive,
        };

        // Artifacts whose per-artifact retention expired are released
        // directly; the tier sweep below would otherwise hold them until the
        // tier default.
        let overridden_expired: Vec<String> = {
            let index = self.index.read().expect("storage index lock poisoned");
            let now = Utc::now();
            index
                .values()
                .filter(|m| {
                    if m.task_id.map(|t| live_tasks.contains(&t)).unwrap_or(false) {
                        return false;
                    }
                    m.retention_override.is_some_and(|retention| {
                        let age = now.signed_duration_since(m.created_at);
                        age >= chrono::Duration::from_std(retention)
                            .unwrap_or(chrono::Duration::MAX)
                    })
                })
                .map(|m| m.path.clone())
                .collect()
        };
        for path in overridden_expired {
            match self.release(&path).await {
                Ok(true) => summary.files_removed += 1,
                Ok(false) => {}
                Err(e) => warn!(path = %path, "failed to release overridden artifact: {}", e),
            }
        }

        for tier in Tier::all() {
            let manager = &self.tiers[&tier];

            // Exempt: artifacts of live tasks, plus artifacts whose override
            // retention has not yet expired.
            let exempt: HashSet<String> = {
                let index = self.index.read().expect("storage index lock poisoned");
                let now = Utc::now();
                index
                    .values()
                    .filter(|m| m.tier == tier)
                    .filter(|m| {
                        let live_owner =
                            m.task_id.map(|t| live_tasks.contains(&t)).unwrap_or(false);
                        let override_active = m.retention_override.is_some_and(|retention| {
                            let age = now.signed_duration_since(m.created_at);
                            age < chrono::Duration::from_std(retention)
                                .unwrap_or(chrono::Duration::MAX)
                        });
                        live_owner || override_active
                    })
                    .filter_map(|m| m.path.split_once('/').map(|(_, f)| f.to_string()))
                    .collect()
            };

            let override_policy = if aggressive {
                match tier {
                    Tier::Temp => Some(CleanupPolicy::new().remove_after(Duration::ZERO)),
                    Tier::Processed => Some(manager.policy().halved()),
                    _ => None,
                }
            } else {
                None
            };

            summary.files_removed += manager
                .sweep_expired(&exempt, override_policy.as_ref())
                .await;

            // Reconcile: drop index entries whose files the sweep removed
            let stale: Vec<String> = {
                let index = self.index.read().expect("storage index lock poisoned");
                index
                    .values()
                    .filter(|m| m.tier == tier)
                    .map(|m| m.path.clone())
                    .collect()
            };
            for path in stale {
                let missing = Self::tier_file(&self.tiers, &path)
                    .map(|(manager, file)| !manager.exists(file).unwrap_or(true))
                    .unwrap_or(false);
                if missing {
                    let meta = self
                        .index
                        .write()
                        .expect("storage index lock poisoned")
                        .remove(&path);
                    if let Some(meta) = meta
                        && let Err(e) = self
                            .log
                            .append(&IndexRecord {
                                op: IndexOp::Release,
                                tier: meta.tier,
                                path: path.clone(),
                                size: meta.size,
                                task_id: meta.task_id,
                                created_at: meta.created_at,
                            })
                            .await
                    {
                        warn!(path = %path, "failed to journal sweep release: {}", e);
                    }
                }
            }
        }

        if summary.files_removed > 0 {
            info!(
                removed = summary.files_removed,
                aggressive = summary.aggressive,
                "cleanup pass finished"
            );
        }
        summary
    }

    /// Background cleanup loop: one pass every `cleanup_interval`, exempting
    /// whatever the registry reports as live, until shutdown.
    pub async fn run_cleanup_scheduler(
        self: Arc<Self>,
        registry: Arc<TaskRegistry>,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick doubles as the post-restart orphan sweep
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let live: HashSet<Uuid> = registry.live_task_ids().into_iter().collect();
                    self.cleanup(&live).await;
                }
                _ = shutdown.cancelled() => {
                    debug!("storage cleanup scheduler stopped");
                    return;
                }
            }
        }
    }
}
