//! Service facade: the API boundary the embedding adapter talks to.
//!
//! Bundles the long-lived components (registry, scheduler, hub, storage,
//! orchestrator), each constructed once at startup and passed explicitly.
//! No process-wide singletons; tests build as many independent services as
//! they like.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::engines::EngineSet;
use crate::errors::{PipelineResult, RegistryError};
use crate::gpu::{GpuScheduler, SchedulerSnapshot};
use crate::models::{Request, TaskRecord};
use crate::pipeline::PipelineOrchestrator;
use crate::progress::{ProgressHub, SubscribeError, Subscription};
use crate::registry::TaskRegistry;
use crate::storage::{StorageManager, StorageStats};

/// The assembled pipeline core.
pub struct VideoMessageService {
    registry: Arc<TaskRegistry>,
    scheduler: Arc<GpuScheduler>,
    hub: Arc<ProgressHub>,
    storage: Arc<StorageManager>,
    orchestrator: Arc<PipelineOrchestrator>,
    shutdown: CancellationToken,
}

impl VideoMessageService {
    /// Construct every component from configuration plus the engine set.
    pub async fn new(config: Config, engines: EngineSet) -> PipelineResult<Self> {
        let registry = Arc::new(TaskRegistry::new(config.registry.clone()));
        let scheduler = Arc::new(GpuScheduler::new(&config.gpu));
        let hub = Arc::new(ProgressHub::new(config.progress.clone()));
        let storage = Arc::new(StorageManager::new(config.storage.clone()).await?);
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            &config,
            registry.clone(),
            scheduler.clone(),
            hub.clone(),
            storage.clone(),
            engines,
        ));

        Ok(Self {
            registry,
            scheduler,
            hub,
            storage,
            orchestrator,
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the background workers: storage cleanup scheduler and progress
    /// hub maintenance. They run until [`Self::shutdown`].
    pub fn start_background_tasks(&self) {
        tokio::spawn(
            self.storage
                .clone()
                .run_cleanup_scheduler(self.registry.clone(), self.shutdown.child_token()),
        );
        tokio::spawn(
            self.hub
                .clone()
                .run_maintenance(self.shutdown.child_token()),
        );
        info!("background tasks started");
    }

    /// Stop the background workers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accept a request; returns as soon as the task is registered.
    pub fn execute_request(&self, request: Request) -> PipelineResult<Uuid> {
        self.orchestrator.execute(request)
    }

    /// Snapshot of a task's record: stage, progress, artifacts, error,
    /// timestamps.
    pub fn get_task_status(&self, task_id: Uuid) -> Option<TaskRecord> {
        self.registry.get(task_id)
    }

    /// Block until the task is terminal or the deadline passes. Waiting has
    /// no effect on execution.
    pub async fn await_task(
        &self,
        task_id: Uuid,
        deadline: Duration,
    ) -> Result<TaskRecord, RegistryError> {
        self.registry.await_terminal(task_id, deadline).await
    }

    /// Subscribe to a task's progress stream, optionally resuming after a
    /// previously seen sequence number.
    pub fn subscribe_progress(
        &self,
        task_id: Uuid,
        resume_cursor: Option<u64>,
    ) -> Result<Subscription, SubscribeError> {
        Arc::clone(&self.hub).subscribe(task_id, resume_cursor)
    }

    /// Request cancellation; acknowledged even when the task already
    /// finished (cancel is idempotent). `false` only for unknown ids.
    pub fn cancel_task(&self, task_id: Uuid) -> bool {
        self.orchestrator.cancel(task_id)
    }

    /// Storage usage per tier plus free-space figures.
    pub fn get_storage_stats(&self) -> StorageStats {
        self.storage.stat()
    }

    /// GPU slot occupancy per class.
    pub fn gpu_snapshot(&self) -> SchedulerSnapshot {
        self.scheduler.snapshot()
    }

    /// The storage manager (adapters serve artifact bytes through it).
    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    /// The task registry.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }
}

impl Drop for VideoMessageService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
