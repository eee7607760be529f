//! Append-only metadata log for the storage index.
//!
//! One JSON object per line, `{op, tier, path, size, task_id, created_at}`.
//! The log is replayed in order at startup to rebuild the live index; a `put`
//! whose file no longer exists is dropped during replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::errors::StorageError;
use crate::models::Tier;

/// Log record operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOp {
    Put,
    Release,
}

/// One line of the index log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub op: IndexOp,
    pub tier: Tier,
    /// Tier-qualified artifact path (`<tier>/<file>`).
    pub path: String,
    pub size: u64,
    pub task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Append handle over the on-disk log.
pub struct IndexLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl IndexLog {
    /// Open (or create) the log at `path` for appending.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it.
    pub async fn append(&self, record: &IndexRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(record).map_err(|e| StorageError::Index {
            message: format!("failed to encode index record: {e}"),
        })?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read all records from `path`, in order. Malformed lines (torn writes
    /// from a crash) are skipped with a warning.
    pub async fn replay(path: &Path) -> Result<Vec<IndexRecord>, StorageError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IndexRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        "skipping malformed index log line {} in {:?}: {}",
                        line_no + 1,
                        path,
                        e
                    );
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(op: IndexOp, path: &str) -> IndexRecord {
        IndexRecord {
            op,
            tier: Tier::Uploads,
            path: path.to_string(),
            size: 42,
            task_id: Some(Uuid::new_v4()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_then_replay_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("index.log");

        let log = IndexLog::open(&log_path).await.unwrap();
        log.append(&record(IndexOp::Put, "uploads/a.png")).await.unwrap();
        log.append(&record(IndexOp::Release, "uploads/a.png"))
            .await
            .unwrap();

        let records = IndexLog::replay(&log_path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].op, IndexOp::Put);
        assert_eq!(records[1].op, IndexOp::Release);
        assert_eq!(records[1].path, "uploads/a.png");
    }

    #[tokio::test]
    async fn replay_of_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records = IndexLog::replay(&dir.path().join("absent.log"))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("index.log");

        let log = IndexLog::open(&log_path).await.unwrap();
        log.append(&record(IndexOp::Put, "uploads/a.png")).await.unwrap();
        // Simulate a torn write at the tail
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .await
            .unwrap()
            .write_all(b"{\"op\":\"put\",\"tier\"")
            .await
            .unwrap();

        let records = IndexLog::replay(&log_path).await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
