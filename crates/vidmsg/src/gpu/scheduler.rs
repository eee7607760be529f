//! Slot-based admission control for the shared accelerator.
//!
//! Two workload classes compete for a fixed-capacity device: many small
//! detector slots and few large segmenter slots. Each class has its own FIFO
//! waiter queue; slots are not fungible across classes, and a freed slot
//! wakes exactly the head waiter of its class. Waiters that time out or get
//! canceled remove themselves without leaking a reservation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::GpuConfig;
use crate::models::GpuClass;

/// A held GPU slot. Must be handed back via [`GpuScheduler::release`]
/// exactly once; the type is deliberately not `Clone`.
#[derive(Debug)]
pub struct GpuLease {
    id: Uuid,
    class: GpuClass,
    task_id: Uuid,
}

impl GpuLease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn class(&self) -> GpuClass {
        self.class
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }
}

/// Why an acquire did not produce a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The deadline elapsed while queued.
    Timeout,
    /// The caller's cancellation token fired while queued.
    Canceled,
}

/// Consistent per-class state snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClassSnapshot {
    pub capacity: usize,
    pub in_use: usize,
    pub queued: usize,
}

/// Snapshot across both classes, captured under one critical section.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SchedulerSnapshot {
    pub detector: ClassSnapshot,
    pub segmenter: ClassSnapshot,
}

impl SchedulerSnapshot {
    pub fn class(&self, class: GpuClass) -> ClassSnapshot {
        match class {
            GpuClass::Detector => self.detector,
            GpuClass::Segmenter => self.segmenter,
        }
    }
}

struct Waiter {
    id: Uuid,
    task_id: Uuid,
    tx: oneshot::Sender<GpuLease>,
}

struct ClassState {
    capacity: usize,
    /// lease id -> owning task id
    in_use: HashMap<Uuid, Uuid>,
    waiters: VecDeque<Waiter>,
}

impl ClassState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: HashMap::new(),
            waiters: VecDeque::new(),
        }
    }

    fn has_free_slot(&self) -> bool {
        self.in_use.len() < self.capacity
    }
}

struct SchedulerState {
    detector: ClassState,
    segmenter: ClassState,
}

impl SchedulerState {
    fn class_mut(&mut self, class: GpuClass) -> &mut ClassState {
        match class {
            GpuClass::Detector => &mut self.detector,
            GpuClass::Segmenter => &mut self.segmenter,
        }
    }
}

/// Admission scheduler over the configured slot classes.
pub struct GpuScheduler {
    state: Mutex<SchedulerState>,
}

impl GpuScheduler {
    pub fn new(config: &GpuConfig) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                detector: ClassState::new(config.detector_slots),
                segmenter: ClassState::new(config.segmenter_slots),
            }),
        }
    }

    /// Acquire a slot of `class` for `task_id`, waiting at most `deadline`.
    /// FIFO within the class: a waiter is never passed over once a slot of
    /// its class frees up.
    ///
    /// # Errors
    /// `Timeout` when the deadline elapses, `Canceled` when `cancel` fires;
    /// in both cases the waiter has been removed and no slot is held.
    pub async fn acquire(
        &self,
        class: GpuClass,
        task_id: Uuid,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<GpuLease, AcquireError> {
        let (waiter_id, mut rx) = {
            let mut state = self.state.lock().expect("gpu scheduler lock poisoned");
            let class_state = state.class_mut(class);

            if class_state.has_free_slot() && class_state.waiters.is_empty() {
                let lease = GpuLease {
                    id: Uuid::new_v4(),
                    class,
                    task_id,
                };
                class_state.in_use.insert(lease.id, task_id);
                debug!(task_id = %task_id, class = %class, lease_id = %lease.id, "gpu slot acquired");
                return Ok(lease);
            }

            let waiter_id = Uuid::new_v4();
            let (tx, rx) = oneshot::channel();
            class_state.waiters.push_back(Waiter {
                id: waiter_id,
                task_id,
                tx,
            });
            debug!(
                task_id = %task_id,
                class = %class,
                queued = class_state.waiters.len(),
                "gpu slot busy, queued"
            );
            (waiter_id, rx)
        };

        tokio::select! {
            granted = &mut rx => match granted {
                Ok(lease) => Ok(lease),
                // Sender dropped without granting: scheduler state was torn
                // down; report as timeout rather than panic.
                Err(_) => Err(AcquireError::Timeout),
            },
            _ = tokio::time::sleep(deadline) => {
                Err(self.abandon_wait(class, waiter_id, rx, AcquireError::Timeout))
            }
            _ = cancel.cancelled() => {
                Err(self.abandon_wait(class, waiter_id, rx, AcquireError::Canceled))
            }
        }
    }

    /// Release a lease. Exactly one `in_use` decrement per lease; an unknown
    /// or already-released lease is logged and ignored.
    pub fn release(&self, lease: GpuLease) {
        let mut state = self.state.lock().expect("gpu scheduler lock poisoned");
        let class_state = state.class_mut(lease.class);

        if class_state.in_use.remove(&lease.id).is_none() {
            warn!(
                lease_id = %lease.id,
                class = %lease.class,
                "release of unknown or already-released gpu lease ignored"
            );
            return;
        }
        debug!(
            task_id = %lease.task_id,
            class = %lease.class,
            lease_id = %lease.id,
            "gpu slot released"
        );
        Self::wake_next(class_state, lease.class);
    }

    /// Per-class capacity / in-use / queue-length, captured atomically.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.lock().expect("gpu scheduler lock poisoned");
        SchedulerSnapshot {
            detector: ClassSnapshot {
                capacity: state.detector.capacity,
                in_use: state.detector.in_use.len(),
                queued: state.detector.waiters.len(),
            },
            segmenter: ClassSnapshot {
                capacity: state.segmenter.capacity,
                in_use: state.segmenter.in_use.len(),
                queued: state.segmenter.waiters.len(),
            },
        }
    }

    /// Remove a departing waiter. If the grant raced ahead of the wakeup the
    /// waiter already owns a slot, which is handed straight back so nothing
    /// leaks.
    fn abandon_wait(
        &self,
        class: GpuClass,
        waiter_id: Uuid,
        mut rx: oneshot::Receiver<GpuLease>,
        reason: AcquireError,
    ) -> AcquireError {
        let mut state = self.state.lock().expect("gpu scheduler lock poisoned");
        let class_state = state.class_mut(class);

        let was_queued = {
            let before = class_state.waiters.len();
            class_state.waiters.retain(|w| w.id != waiter_id);
            class_state.waiters.len() != before
        };

        if !was_queued {
            // Grants happen under the lock, so the lease is already in the
            // channel by the time the waiter is gone from the queue.
            if let Ok(lease) = rx.try_recv() {
                class_state.in_use.remove(&lease.id);
                Self::wake_next(class_state, class);
            }
        }

        debug!(class = %class, waiter_id = %waiter_id, ?reason, "gpu waiter departed");
        reason
    }

    /// Hand free slots to queued waiters, head first. A waiter whose receiver
    /// vanished (timeout race) is skipped and its slot reclaimed.
    fn wake_next(class_state: &mut ClassState, class: GpuClass) {
        while class_state.has_free_slot() {
            let Some(waiter) = class_state.waiters.pop_front() else {
                break;
            };
            let lease = GpuLease {
                id: Uuid::new_v4(),
                class,
                task_id: waiter.task_id,
            };
            let lease_id = lease.id;
            class_state.in_use.insert(lease_id, waiter.task_id);
            if let Err(_unsent) = waiter.tx.send(lease) {
                class_state.in_use.remove(&lease_id);
            }
        }
    }
}
