//! Task registry: the single owner of per-request task records.
//!
//! Records are mutated only through [`TaskRegistry::update`], which
//! serializes mutations per task, enforces the legal stage edges, keeps
//! progress monotone, and freezes terminal records. Reads are cheap
//! snapshots. Admission is capped: registration fails fast once the
//! non-terminal task count reaches the configured limit.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::errors::RegistryError;
use crate::models::{Stage, TaskRecord};

#[derive(Clone)]
struct TaskEntry {
    /// Serializes mutations to this task; different tasks update in parallel.
    update_lock: Arc<Mutex<()>>,
    tx: Arc<watch::Sender<TaskRecord>>,
}

/// In-process task registry.
pub struct TaskRegistry {
    config: RegistryConfig,
    tasks: RwLock<HashMap<Uuid, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Number of tasks not yet in a terminal stage.
    pub fn active_count(&self) -> usize {
        let tasks = self.tasks.read().expect("task registry lock poisoned");
        tasks
            .values()
            .filter(|e| !e.tx.borrow().is_terminal())
            .count()
    }

    /// Register a new record. Fails on duplicate ids and when the admission
    /// cap is reached; an over-cap submission registers nothing.
    pub fn register(&self, record: TaskRecord) -> Result<(), RegistryError> {
        let mut tasks = self.tasks.write().expect("task registry lock poisoned");

        if tasks.contains_key(&record.task_id) {
            return Err(RegistryError::DuplicateTask {
                task_id: record.task_id,
            });
        }

        let active = tasks
            .values()
            .filter(|e| !e.tx.borrow().is_terminal())
            .count();
        if active >= self.config.max_active_tasks {
            warn!(
                active,
                cap = self.config.max_active_tasks,
                "admission cap reached, rejecting task"
            );
            return Err(RegistryError::AtCapacity {
                active,
                cap: self.config.max_active_tasks,
            });
        }

        let task_id = record.task_id;
        let (tx, _rx) = watch::channel(record);
        tasks.insert(
            task_id,
            TaskEntry {
                update_lock: Arc::new(Mutex::new(())),
                tx: Arc::new(tx),
            },
        );
        debug!(task_id = %task_id, active = active + 1, "task registered");
        Ok(())
    }

    /// Snapshot of a record.
    pub fn get(&self, task_id: Uuid) -> Option<TaskRecord> {
        let tasks = self.tasks.read().expect("task registry lock poisoned");
        tasks.get(&task_id).map(|e| e.tx.borrow().clone())
    }

    /// Apply `mutator` to the current record under the task's lock and
    /// persist the result.
    ///
    /// Enforced invariants: stage transitions follow the state machine,
    /// progress never decreases, and terminal records reject any further
    /// update. `started_at` is stamped when the task leaves `initialized`,
    /// `finished_at` when it turns terminal.
    pub async fn update<F>(&self, task_id: Uuid, mutator: F) -> Result<TaskRecord, RegistryError>
    where
        F: FnOnce(&TaskRecord) -> TaskRecord,
    {
        let entry = {
            let tasks = self.tasks.read().expect("task registry lock poisoned");
            tasks
                .get(&task_id)
                .cloned()
                .ok_or(RegistryError::UnknownTask { task_id })?
        };

        let _guard = entry.update_lock.lock().await;
        let current = entry.tx.borrow().clone();

        if current.is_terminal() {
            return Err(RegistryError::TerminalFrozen { task_id });
        }

        let mut next = mutator(&current);

        if next.stage != current.stage && !current.stage.can_transition_to(next.stage) {
            return Err(RegistryError::IllegalTransition {
                from: current.stage,
                to: next.stage,
            });
        }
        if next.progress_percent < current.progress_percent {
            return Err(RegistryError::ProgressRegression {
                from: current.progress_percent,
                to: next.progress_percent,
            });
        }

        if current.stage == Stage::Initialized
            && next.stage != Stage::Initialized
            && next.started_at.is_none()
        {
            next.started_at = Some(Utc::now());
        }
        if next.is_terminal() && next.finished_at.is_none() {
            next.finished_at = Some(Utc::now());
        }

        entry.tx.send_replace(next.clone());
        Ok(next)
    }

    /// Wait until the task reaches a terminal stage, or `deadline` elapses.
    /// Waiting does not affect execution.
    pub async fn await_terminal(
        &self,
        task_id: Uuid,
        deadline: Duration,
    ) -> Result<TaskRecord, RegistryError> {
        let mut rx = {
            let tasks = self.tasks.read().expect("task registry lock poisoned");
            tasks
                .get(&task_id)
                .ok_or(RegistryError::UnknownTask { task_id })?
                .tx
                .subscribe()
        };

        match tokio::time::timeout(deadline, rx.wait_for(|r| r.is_terminal())).await {
            Ok(Ok(record)) => Ok(record.clone()),
            // Sender dropped: task purged while we waited
            Ok(Err(_)) => Err(RegistryError::UnknownTask { task_id }),
            Err(_elapsed) => Err(RegistryError::AwaitTimeout { task_id }),
        }
    }

    /// Remove a record. Permitted only for terminal records whose
    /// `finished_at` is older than the configured grace period.
    pub fn purge(&self, task_id: Uuid) -> Result<(), RegistryError> {
        let mut tasks = self.tasks.write().expect("task registry lock poisoned");
        let entry = tasks
            .get(&task_id)
            .ok_or(RegistryError::UnknownTask { task_id })?;

        let record = entry.tx.borrow().clone();
        if !record.is_terminal() {
            return Err(RegistryError::PurgeRefused {
                task_id,
                reason: "task is not terminal".to_string(),
            });
        }
        let finished_at = record.finished_at.ok_or(RegistryError::PurgeRefused {
            task_id,
            reason: "terminal record missing finished_at".to_string(),
        })?;
        let age = Utc::now().signed_duration_since(finished_at);
        let grace =
            chrono::Duration::from_std(self.config.purge_grace).unwrap_or(chrono::Duration::MAX);
        if age < grace {
            return Err(RegistryError::PurgeRefused {
                task_id,
                reason: format!("terminal for {age}, grace is {grace}"),
            });
        }

        tasks.remove(&task_id);
        debug!(task_id = %task_id, "task purged");
        Ok(())
    }

    /// Ids of all non-terminal tasks (used to exempt their artifacts from
    /// retention sweeps).
    pub fn live_task_ids(&self) -> Vec<Uuid> {
        let tasks = self.tasks.read().expect("task registry lock poisoned");
        tasks
            .iter()
            .filter(|(_, e)| !e.tx.borrow().is_terminal())
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskFailure;

    fn registry(cap: usize) -> TaskRegistry {
        TaskRegistry::new(RegistryConfig {
            max_active_tasks: cap,
            purge_grace: Duration::from_secs(3600),
        })
    }

    fn advance(record: &TaskRecord, stage: Stage, progress: u8) -> TaskRecord {
        let mut next = record.clone();
        next.stage = stage;
        next.progress_percent = progress;
        next
    }

    #[tokio::test]
    async fn register_and_walk_the_success_path() {
        let registry = registry(10);
        let task_id = Uuid::new_v4();
        registry.register(TaskRecord::new(task_id)).unwrap();

        let steps = [
            (Stage::Upload, 20),
            (Stage::Detection, 40),
            (Stage::BackgroundRemoval, 60),
            (Stage::VideoUpload, 70),
            (Stage::VideoProcessing, 80),
            (Stage::Finalizing, 90),
            (Stage::Completed, 100),
        ];
        for (stage, progress) in steps {
            registry
                .update(task_id, |r| advance(r, stage, progress))
                .await
                .unwrap();
        }

        let record = registry.get(task_id).unwrap();
        assert_eq!(record.stage, Stage::Completed);
        assert_eq!(record.progress_percent, 100);
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = registry(10);
        let record = TaskRecord::new(Uuid::new_v4());
        registry.register(record.clone()).unwrap();
        assert!(matches!(
            registry.register(record),
            Err(RegistryError::DuplicateTask { .. })
        ));
    }

    #[tokio::test]
    async fn admission_cap_rejects_and_recovers() {
        let registry = registry(2);
        let first = Uuid::new_v4();
        registry.register(TaskRecord::new(first)).unwrap();
        registry.register(TaskRecord::new(Uuid::new_v4())).unwrap();

        let over_cap = registry.register(TaskRecord::new(Uuid::new_v4()));
        assert!(matches!(
            over_cap,
            Err(RegistryError::AtCapacity { active: 2, cap: 2 })
        ));

        // Finishing one task makes room for exactly one more
        registry
            .update(first, |r| {
                let mut next = r.clone();
                next.stage = Stage::Failed;
                next.error = Some(TaskFailure {
                    error_kind: "canceled".to_string(),
                    stage_at_failure: Stage::Initialized,
                    message: "canceled".to_string(),
                });
                next
            })
            .await
            .unwrap();
        registry.register(TaskRecord::new(Uuid::new_v4())).unwrap();
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let registry = registry(10);
        let task_id = Uuid::new_v4();
        registry.register(TaskRecord::new(task_id)).unwrap();

        let skip = registry
            .update(task_id, |r| advance(r, Stage::Detection, 30))
            .await;
        assert!(matches!(
            skip,
            Err(RegistryError::IllegalTransition {
                from: Stage::Initialized,
                to: Stage::Detection,
            })
        ));
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let registry = registry(10);
        let task_id = Uuid::new_v4();
        registry.register(TaskRecord::new(task_id)).unwrap();
        registry
            .update(task_id, |r| advance(r, Stage::Upload, 20))
            .await
            .unwrap();

        let regression = registry
            .update(task_id, |r| advance(r, Stage::Upload, 10))
            .await;
        assert!(matches!(
            regression,
            Err(RegistryError::ProgressRegression { from: 20, to: 10 })
        ));
    }

    #[tokio::test]
    async fn terminal_records_are_frozen() {
        let registry = registry(10);
        let task_id = Uuid::new_v4();
        registry.register(TaskRecord::new(task_id)).unwrap();
        registry
            .update(task_id, |r| advance(r, Stage::Failed, 0))
            .await
            .unwrap();

        let further = registry
            .update(task_id, |r| advance(r, Stage::Upload, 20))
            .await;
        assert!(matches!(
            further,
            Err(RegistryError::TerminalFrozen { .. })
        ));
    }

    #[tokio::test]
    async fn await_terminal_sees_completion() {
        let registry = Arc::new(registry(10));
        let task_id = Uuid::new_v4();
        registry.register(TaskRecord::new(task_id)).unwrap();

        let registry2 = registry.clone();
        let waiter = tokio::spawn(async move {
            registry2
                .await_terminal(task_id, Duration::from_secs(2))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry
            .update(task_id, |r| advance(r, Stage::Failed, 0))
            .await
            .unwrap();

        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.stage, Stage::Failed);
    }

    #[tokio::test]
    async fn await_terminal_times_out_without_affecting_execution() {
        let registry = registry(10);
        let task_id = Uuid::new_v4();
        registry.register(TaskRecord::new(task_id)).unwrap();

        let result = registry
            .await_terminal(task_id, Duration::from_millis(30))
            .await;
        assert!(result.is_err());
        assert_eq!(registry.get(task_id).unwrap().stage, Stage::Initialized);
    }

    #[tokio::test]
    async fn purge_respects_grace_period() {
        let registry = TaskRegistry::new(RegistryConfig {
            max_active_tasks: 10,
            purge_grace: Duration::from_millis(10),
        });
        let task_id = Uuid::new_v4();
        registry.register(TaskRecord::new(task_id)).unwrap();

        // Non-terminal: refused
        assert!(registry.purge(task_id).is_err());

        registry
            .update(task_id, |r| advance(r, Stage::Failed, 0))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.purge(task_id).unwrap();
        assert!(registry.get(task_id).is_none());
    }
}
