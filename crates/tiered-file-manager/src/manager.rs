//! Core file manager implementation.

use crate::{
    error::{Result, TieredFileError},
    policy::CleanupPolicy,
    security,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, sync::RwLock};
use uuid::Uuid;

/// Metadata for a file tracked by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Normalized relative path within the managed directory; doubles as the
    /// record key.
    pub path: String,
    pub absolute_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Aggregate statistics over tracked files.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub file_count: usize,
    pub total_bytes: u64,
    pub base_directory: PathBuf,
}

/// Snapshot entry used for two-phase sweep evaluation.
#[derive(Debug, Clone)]
struct SweepCandidate {
    path: String,
    absolute_path: PathBuf,
    created_at: DateTime<Utc>,
}

/// Sandboxed manager for one directory tree.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone, Debug)]
pub struct FileManager {
    base_dir: PathBuf,
    registry: Arc<RwLock<HashMap<String, FileRecord>>>,
    policy: CleanupPolicy,
}

impl FileManager {
    /// Create a new builder for configuring the manager.
    #[must_use]
    pub fn builder() -> FileManagerBuilder {
        FileManagerBuilder::new()
    }

    /// The directory this manager is rooted at.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The retention policy sweeps apply by default.
    pub fn policy(&self) -> &CleanupPolicy {
        &self.policy
    }

    /// Turn a caller-supplied path into (registry key, absolute path), both
    /// pinned inside the managed directory.
    fn member_path(&self, raw: &str) -> Result<(String, PathBuf)> {
        if raw.contains('\0') {
            return Err(TieredFileError::PathRejected {
                path: PathBuf::from(raw),
                reason: "contains NUL bytes".to_string(),
            });
        }
        let (clean, absolute) = security::resolve_under_root(&self.base_dir, Path::new(raw))?;
        Ok((clean.to_string_lossy().into_owned(), absolute))
    }

    /// Write `contents` to `path` atomically: the bytes land in a temporary
    /// sibling which is renamed over the destination only once fully written.
    /// A failed rename unlinks the temporary and surfaces the error, so a
    /// partial file is never observable under the destination name.
    ///
    /// # Errors
    /// Returns an error if the path is invalid or escapes the sandbox, or if
    /// the write or rename fails.
    pub async fn write_atomic<P: AsRef<str>, C: AsRef<[u8]>>(
        &self,
        path: P,
        contents: C,
    ) -> Result<u64> {
        let (key, absolute) = self.member_path(path.as_ref())?;
        let bytes = contents.as_ref();

        let parent = absolute
            .parent()
            .ok_or_else(|| TieredFileError::PathRejected {
                path: absolute.clone(),
                reason: "has no parent directory".to_string(),
            })?;
        if !parent.exists() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TieredFileError::DirectorySetup {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let tmp_path = parent.join(format!(".{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp_path, bytes).await?;

        if let Err(rename_err) = fs::rename(&tmp_path, &absolute).await {
            if let Err(unlink_err) = fs::remove_file(&tmp_path).await {
                tracing::warn!(
                    "Failed to unlink temporary {:?} after rename failure: {}",
                    tmp_path,
                    unlink_err
                );
            }
            return Err(TieredFileError::AtomicWrite {
                path: absolute,
                source: rename_err,
            });
        }

        let record = FileRecord {
            path: key.clone(),
            absolute_path: absolute,
            created_at: Utc::now(),
            size_bytes: bytes.len() as u64,
        };
        self.registry.write().await.insert(key, record);

        Ok(bytes.len() as u64)
    }

    /// Read an entire file into memory.
    ///
    /// # Errors
    /// Returns an error if the path is invalid or the file cannot be read.
    pub async fn read<P: AsRef<str>>(&self, path: P) -> Result<Vec<u8>> {
        let (_key, absolute) = self.member_path(path.as_ref())?;
        let content = fs::read(&absolute).await?;
        Ok(content)
    }

    /// Remove a file. Returns `true` if a file was deleted, `false` if it was
    /// already gone; the registry entry is dropped either way, which makes
    /// repeated removal of the same path harmless.
    ///
    /// # Errors
    /// Returns an error if the path is invalid or deletion fails for a reason
    /// other than the file being absent.
    pub async fn remove_file<P: AsRef<str>>(&self, path: P) -> Result<bool> {
        let (key, absolute) = self.member_path(path.as_ref())?;

        let removed = match fs::remove_file(&absolute).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        self.registry.write().await.remove(&key);
        Ok(removed)
    }

    /// Whether a file exists under the managed directory.
    ///
    /// # Errors
    /// Returns an error if the path is invalid or escapes the sandbox.
    pub fn exists<P: AsRef<str>>(&self, path: P) -> Result<bool> {
        let (_key, absolute) = self.member_path(path.as_ref())?;
        Ok(absolute.exists())
    }

    /// Metadata record for a tracked file, if present.
    pub async fn record<P: AsRef<str>>(&self, path: P) -> Option<FileRecord> {
        let (key, _absolute) = self.member_path(path.as_ref()).ok()?;
        self.registry.read().await.get(&key).cloned()
    }

    /// Relative paths of all tracked files.
    pub async fn list_files(&self) -> Vec<String> {
        self.registry.read().await.keys().cloned().collect()
    }

    /// Aggregate statistics over tracked files.
    pub async fn stats(&self) -> ManagerStats {
        let registry = self.registry.read().await;
        let file_count = registry.len();
        let total_bytes = registry.values().map(|r| r.size_bytes).sum();
        drop(registry);

        ManagerStats {
            file_count,
            total_bytes,
            base_directory: self.base_dir.clone(),
        }
    }

    /// Remove files past retention, skipping any relative path in `exempt`.
    /// `override_policy` substitutes the configured policy for this pass only
    /// (used for aggressive pressure sweeps). Returns the number of files
    /// actually deleted. Files that disappeared out from under the registry
    /// are dropped from it without counting as removals.
    ///
    /// Two-phase: a read-lock snapshot decides candidates, then a write lock
    /// applies removals.
    pub async fn sweep_expired(
        &self,
        exempt: &HashSet<String>,
        override_policy: Option<&CleanupPolicy>,
    ) -> usize {
        let policy = override_policy.unwrap_or(&self.policy);
        if !policy.enabled {
            return 0;
        }

        let snapshot: Vec<SweepCandidate> = {
            let registry = self.registry.read().await;
            registry
                .values()
                .filter(|r| !exempt.contains(&r.path))
                .map(|r| SweepCandidate {
                    path: r.path.clone(),
                    absolute_path: r.absolute_path.clone(),
                    created_at: r.created_at,
                })
                .collect()
        };

        let mut removals = Vec::new();
        for candidate in &snapshot {
            match fs::metadata(&candidate.absolute_path).await {
                Ok(meta) => {
                    let modified =
                        DateTime::from(meta.modified().unwrap_or(std::time::UNIX_EPOCH));
                    if policy.should_remove(candidate.created_at, modified) {
                        removals
                            .push((candidate.path.clone(), Some(candidate.absolute_path.clone())));
                    }
                }
                // File already gone: registry entry is stale
                Err(_) => removals.push((candidate.path.clone(), None)),
            }
        }

        if removals.is_empty() {
            return 0;
        }

        let mut removed = 0;
        let mut registry = self.registry.write().await;
        for (path, maybe_absolute) in removals {
            if let Some(absolute) = maybe_absolute {
                match fs::remove_file(&absolute).await {
                    Ok(()) => {
                        tracing::debug!("Removed expired file: {}", path);
                        removed += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to remove expired file {:?}: {}", absolute, e);
                        continue;
                    }
                }
            }
            registry.remove(&path);
        }

        if removed > 0 {
            tracing::info!("Swept {} expired files from {:?}", removed, self.base_dir);
        }
        removed
    }

    /// Re-register files already on disk so sweeps after a restart still see
    /// everything. Temporary files left by interrupted atomic writes are
    /// deleted immediately.
    async fn load_existing_files(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await?;
        let mut loaded = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let file_name = file_name.to_string();

            if file_name.starts_with('.') && file_name.ends_with(".tmp") {
                if let Err(e) = fs::remove_file(&path).await {
                    tracing::warn!("Failed to remove stale temporary {:?}: {}", path, e);
                }
                continue;
            }

            let metadata = entry.metadata().await?;
            let created_at = DateTime::from(
                metadata
                    .created()
                    .or_else(|_| metadata.modified())
                    .unwrap_or(std::time::UNIX_EPOCH),
            );

            let record = FileRecord {
                path: file_name.to_string(),
                absolute_path: path,
                created_at,
                size_bytes: metadata.len(),
            };
            self.registry
                .write()
                .await
                .insert(file_name.to_string(), record);
            loaded += 1;
        }

        if loaded > 0 {
            tracing::info!("Loaded {} existing files from {:?}", loaded, self.base_dir);
        }
        Ok(())
    }
}

/// Builder for configuring a [`FileManager`].
pub struct FileManagerBuilder {
    base_directory: Option<PathBuf>,
    policy: CleanupPolicy,
}

impl FileManagerBuilder {
    fn new() -> Self {
        Self {
            base_directory: None,
            policy: CleanupPolicy::default(),
        }
    }

    /// Set the directory the manager is rooted at.
    #[must_use]
    pub fn base_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.base_directory = Some(path.into());
        self
    }

    /// Set the retention policy sweeps apply by default.
    #[must_use]
    pub fn cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build the manager: create the directory, secure it, and re-register
    /// any files already present.
    ///
    /// # Errors
    /// Returns an error if the base directory is missing from the builder,
    /// cannot be created or secured, or the startup rescan fails.
    pub async fn build(self) -> Result<FileManager> {
        let base_dir = self.base_directory.ok_or_else(|| TieredFileError::Builder {
            reason: "base directory is required".to_string(),
        })?;

        fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| TieredFileError::DirectorySetup {
                path: base_dir.clone(),
                source: e,
            })?;

        security::set_secure_permissions(&base_dir).await?;

        let manager = FileManager {
            base_dir,
            registry: Arc::new(RwLock::new(HashMap::new())),
            policy: self.policy,
        };

        manager.load_existing_files().await?;

        tracing::debug!(
            "FileManager initialized - base_dir: {:?}, retention_enabled: {}",
            manager.base_dir,
            manager.policy.enabled
        );

        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn manager_in(dir: &Path) -> FileManager {
        FileManager::builder()
            .base_directory(dir)
            .cleanup_policy(CleanupPolicy::disabled())
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn write_atomic_then_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager_in(temp_dir.path()).await;

        let written = manager.write_atomic("a.bin", b"payload").await.unwrap();
        assert_eq!(written, 7);
        assert_eq!(manager.read("a.bin").await.unwrap(), b"payload");

        let record = manager.record("a.bin").await.unwrap();
        assert_eq!(record.size_bytes, 7);
    }

    #[tokio::test]
    async fn write_atomic_leaves_no_temporaries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager_in(temp_dir.path()).await;

        manager.write_atomic("a.bin", b"one").await.unwrap();
        manager.write_atomic("a.bin", b"two").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.bin".to_string()]);
        assert_eq!(manager.read("a.bin").await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn traversal_segments_are_normalized_into_the_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager_in(temp_dir.path()).await;

        manager
            .write_atomic("dir/../file.txt", b"content")
            .await
            .unwrap();

        // Normalization keys the file at the folded path
        assert_eq!(manager.read("file.txt").await.unwrap(), b"content");
        assert!(manager.record("file.txt").await.is_some());
        assert_eq!(manager.list_files().await, vec!["file.txt".to_string()]);
    }

    #[tokio::test]
    async fn remove_file_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager_in(temp_dir.path()).await;

        manager.write_atomic("gone.bin", b"x").await.unwrap();
        assert!(manager.remove_file("gone.bin").await.unwrap());
        assert!(!manager.remove_file("gone.bin").await.unwrap());
        assert!(manager.record("gone.bin").await.is_none());
    }

    #[tokio::test]
    async fn invalid_paths_are_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = manager_in(temp_dir.path()).await;

        for bad in ["/etc/passwd", "", "file\0.bin", "../escape.bin", "a/../../up.bin"] {
            assert!(
                manager.write_atomic(bad, b"x").await.is_err(),
                "should reject {bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn sweep_respects_exemptions() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = FileManager::builder()
            .base_directory(temp_dir.path())
            .cleanup_policy(CleanupPolicy::new().remove_after(Duration::from_millis(50)))
            .build()
            .await
            .unwrap();

        manager.write_atomic("keep.bin", b"k").await.unwrap();
        manager.write_atomic("drop.bin", b"d").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let exempt: HashSet<String> = ["keep.bin".to_string()].into_iter().collect();
        let removed = manager.sweep_expired(&exempt, None).await;

        assert_eq!(removed, 1);
        assert!(manager.exists("keep.bin").unwrap());
        assert!(!manager.exists("drop.bin").unwrap());
    }

    #[tokio::test]
    async fn sweep_honors_override_policy() {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = FileManager::builder()
            .base_directory(temp_dir.path())
            .cleanup_policy(CleanupPolicy::new().remove_after(Duration::from_secs(3600)))
            .build()
            .await
            .unwrap();

        manager.write_atomic("fresh.bin", b"f").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Steady-state policy keeps the file
        assert_eq!(manager.sweep_expired(&HashSet::new(), None).await, 0);

        // Pressure pass with a tiny retention removes it
        let aggressive = CleanupPolicy::new().remove_after(Duration::from_millis(1));
        assert_eq!(
            manager
                .sweep_expired(&HashSet::new(), Some(&aggressive))
                .await,
            1
        );
    }

    #[tokio::test]
    async fn restart_rescan_recovers_files_and_drops_temporaries() {
        let temp_dir = tempfile::tempdir().unwrap();

        {
            let manager = manager_in(temp_dir.path()).await;
            manager.write_atomic("survivor.bin", b"s").await.unwrap();
        }
        // Simulate a crash mid-write
        std::fs::write(temp_dir.path().join(".deadbeef.tmp"), b"partial").unwrap();

        let manager = manager_in(temp_dir.path()).await;
        let mut files = manager.list_files().await;
        files.sort();
        assert_eq!(files, vec!["survivor.bin".to_string()]);
        assert!(!temp_dir.path().join(".deadbeef.tmp").exists());
    }
}
