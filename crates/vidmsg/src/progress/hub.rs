//! Per-task progress event hub.
//!
//! Publishers append events to a task's history; any number of subscribers
//! receive them through bounded per-subscriber queues. A slow subscriber
//! loses oldest events first and sees an explicit gap marker in their place,
//! so it can resume via cursor without ever blocking the publisher or its
//! peers. Sequences are per-task, gapless, assigned under the hub lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProgressConfig;
use crate::models::{EventDraft, ProgressEvent, ProgressEventKind, Stage};

/// Result of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Event accepted and fanned out with this sequence number.
    Published(u64),
    /// Draft identical to the previous event; dropped as a re-publish.
    Duplicate,
    /// Progress regression rejected (monotonicity defender).
    RegressionRejected,
    /// Task already terminal; nothing further is accepted.
    TaskTerminal,
    /// No channel exists for this task id.
    UnknownTask,
}

/// Why a subscribe attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("unknown task")]
    UnknownTask,
}

#[derive(Debug)]
struct SubscriberState {
    queue: VecDeque<ProgressEvent>,
    capacity: usize,
    /// Oldest events dropped since the last gap marker was consumed.
    dropped: u64,
    dropped_first_seq: u64,
    closed: bool,
    notify: Arc<Notify>,
    last_seen: Instant,
}

impl SubscriberState {
    fn push(&mut self, event: ProgressEvent) {
        while self.queue.len() >= self.capacity {
            if let Some(evicted) = self.queue.pop_front() {
                if evicted.kind != ProgressEventKind::Gap {
                    if self.dropped == 0 {
                        self.dropped_first_seq = evicted.sequence;
                    }
                    self.dropped += 1;
                }
            }
        }
        self.queue.push_back(event);
        self.notify.notify_one();
    }

    fn close(&mut self) {
        self.closed = true;
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct TaskChannel {
    next_sequence: u64,
    history: VecDeque<ProgressEvent>,
    last_progress: u8,
    last_draft: Option<EventDraft>,
    last_stage: Stage,
    terminal: bool,
    terminal_at: Option<Instant>,
    /// Last non-heartbeat publish; heartbeats count from here.
    last_activity: Instant,
    last_heartbeat: Instant,
    subscribers: HashMap<Uuid, SubscriberState>,
}

impl TaskChannel {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            next_sequence: 0,
            history: VecDeque::new(),
            last_progress: 0,
            last_draft: None,
            last_stage: Stage::Initialized,
            terminal: false,
            terminal_at: None,
            last_activity: now,
            last_heartbeat: now,
            subscribers: HashMap::new(),
        }
    }
}

/// Pub-sub hub for per-task progress streams.
#[derive(Debug)]
pub struct ProgressHub {
    config: ProgressConfig,
    tasks: Mutex<HashMap<Uuid, TaskChannel>>,
}

impl ProgressHub {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Create the channel for a task. Idempotent; called when the task is
    /// registered so subscribers can attach before the first event.
    pub fn ensure_task(&self, task_id: Uuid) {
        let mut tasks = self.tasks.lock().expect("progress hub lock poisoned");
        tasks.entry(task_id).or_insert_with(TaskChannel::new);
    }

    /// Append an event to the task's stream and wake subscribers.
    ///
    /// Rejects progress regressions and drops exact re-publishes of the
    /// previous event; heartbeats bypass both checks (they repeat by design
    /// and always carry the last progress).
    pub fn publish(&self, task_id: Uuid, draft: EventDraft) -> PublishOutcome {
        let mut tasks = self.tasks.lock().expect("progress hub lock poisoned");
        let Some(channel) = tasks.get_mut(&task_id) else {
            warn!(task_id = %task_id, "publish to unknown task ignored");
            return PublishOutcome::UnknownTask;
        };

        if channel.terminal {
            debug!(task_id = %task_id, "publish after terminal event ignored");
            return PublishOutcome::TaskTerminal;
        }

        let is_heartbeat = draft.kind == ProgressEventKind::Heartbeat;

        if !is_heartbeat {
            if draft.progress < channel.last_progress {
                warn!(
                    task_id = %task_id,
                    from = channel.last_progress,
                    to = draft.progress,
                    "progress regression rejected"
                );
                return PublishOutcome::RegressionRejected;
            }
            if channel.last_draft.as_ref() == Some(&draft) {
                debug!(task_id = %task_id, "duplicate event dropped");
                return PublishOutcome::Duplicate;
            }
        }

        let sequence = channel.next_sequence;
        channel.next_sequence += 1;

        let event = ProgressEvent {
            task_id,
            kind: draft.kind,
            stage: draft.stage,
            progress: draft.progress,
            message: draft.message.clone(),
            sequence,
            timestamp: Utc::now(),
        };

        let terminal = matches!(draft.kind, ProgressEventKind::Failed)
            || (draft.kind == ProgressEventKind::StageComplete && draft.stage == Stage::Completed);

        if !is_heartbeat {
            channel.last_progress = draft.progress;
            channel.last_stage = draft.stage;
            channel.last_draft = Some(draft);
            channel.last_activity = Instant::now();
        } else {
            channel.last_heartbeat = Instant::now();
        }

        channel.history.push_back(event.clone());
        while channel.history.len() > self.config.history_limit {
            channel.history.pop_front();
        }

        for subscriber in channel.subscribers.values_mut() {
            subscriber.push(event.clone());
            if terminal {
                subscriber.close();
            }
        }

        if terminal {
            channel.terminal = true;
            channel.terminal_at = Some(Instant::now());
        }

        PublishOutcome::Published(sequence)
    }

    /// Register a sink on a task. History after `cursor` (all history when
    /// `cursor` is `None`) is queued for delivery before any live event.
    pub fn subscribe(
        self: &Arc<Self>,
        task_id: Uuid,
        cursor: Option<u64>,
    ) -> Result<Subscription, SubscribeError> {
        let mut tasks = self.tasks.lock().expect("progress hub lock poisoned");
        let channel = tasks.get_mut(&task_id).ok_or(SubscribeError::UnknownTask)?;

        let subscriber_id = Uuid::new_v4();
        let notify = Arc::new(Notify::new());
        let mut state = SubscriberState {
            queue: VecDeque::new(),
            capacity: self.config.subscriber_queue_depth,
            dropped: 0,
            dropped_first_seq: 0,
            closed: channel.terminal,
            notify: notify.clone(),
            last_seen: Instant::now(),
        };

        for event in &channel.history {
            let past_cursor = match cursor {
                Some(c) => event.sequence > c,
                None => true,
            };
            if past_cursor {
                state.push(event.clone());
            }
        }

        channel.subscribers.insert(subscriber_id, state);
        debug!(
            task_id = %task_id,
            subscriber_id = %subscriber_id,
            subscribers = channel.subscribers.len(),
            "subscriber attached"
        );

        Ok(Subscription {
            hub: Arc::clone(self),
            task_id,
            subscriber_id,
            notify,
        })
    }

    /// Tear down one subscriber sink.
    pub fn unsubscribe(&self, task_id: Uuid, subscriber_id: Uuid) {
        let mut tasks = self.tasks.lock().expect("progress hub lock poisoned");
        if let Some(channel) = tasks.get_mut(&task_id)
            && let Some(mut state) = channel.subscribers.remove(&subscriber_id)
        {
            state.close();
            debug!(task_id = %task_id, subscriber_id = %subscriber_id, "subscriber detached");
        }
    }

    /// Events currently retained for a task (diagnostics and tests).
    pub fn history(&self, task_id: Uuid) -> Vec<ProgressEvent> {
        let tasks = self.tasks.lock().expect("progress hub lock poisoned");
        tasks
            .get(&task_id)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// One maintenance pass: emit due heartbeats, drop dead subscribers,
    /// purge terminal task state past its retention. Returns the number of
    /// heartbeats emitted.
    pub fn run_maintenance_pass(&self) -> usize {
        // Collect heartbeat targets under the lock, publish after, since
        // publish re-locks.
        let (due, dead, purge): (Vec<Uuid>, Vec<(Uuid, Uuid)>, Vec<Uuid>) = {
            let tasks = self.tasks.lock().expect("progress hub lock poisoned");
            let now = Instant::now();
            let heartbeat_after = self.config.heartbeat_interval;
            let dead_after = 3 * self.config.heartbeat_interval;

            let mut due = Vec::new();
            let mut dead = Vec::new();
            let mut purge = Vec::new();

            for (task_id, channel) in tasks.iter() {
                if let Some(terminal_at) = channel.terminal_at
                    && now.duration_since(terminal_at) >= self.config.terminal_retention
                {
                    purge.push(*task_id);
                    continue;
                }

                for (subscriber_id, state) in &channel.subscribers {
                    if now.duration_since(state.last_seen) >= dead_after {
                        dead.push((*task_id, *subscriber_id));
                    }
                }

                if !channel.terminal && !channel.subscribers.is_empty() {
                    let quiet_since = channel.last_activity.max(channel.last_heartbeat);
                    if now.duration_since(quiet_since) >= heartbeat_after {
                        due.push(*task_id);
                    }
                }
            }
            (due, dead, purge)
        };

        for (task_id, subscriber_id) in dead {
            warn!(task_id = %task_id, subscriber_id = %subscriber_id, "dropping dead subscriber");
            self.unsubscribe(task_id, subscriber_id);
        }

        let mut emitted = 0;
        for task_id in due {
            let (stage, progress) = {
                let tasks = self.tasks.lock().expect("progress hub lock poisoned");
                match tasks.get(&task_id) {
                    Some(c) => (c.last_stage, c.last_progress),
                    None => continue,
                }
            };
            let draft = EventDraft {
                kind: ProgressEventKind::Heartbeat,
                stage,
                progress,
                message: "heartbeat".to_string(),
            };
            if matches!(self.publish(task_id, draft), PublishOutcome::Published(_)) {
                emitted += 1;
            }
        }

        if !purge.is_empty() {
            let mut tasks = self.tasks.lock().expect("progress hub lock poisoned");
            for task_id in purge {
                if let Some(mut channel) = tasks.remove(&task_id) {
                    for state in channel.subscribers.values_mut() {
                        state.close();
                    }
                    debug!(task_id = %task_id, "terminal task state purged");
                }
            }
        }

        emitted
    }

    /// Long-running maintenance loop; drives [`Self::run_maintenance_pass`]
    /// until shutdown.
    pub async fn run_maintenance(self: Arc<Self>, shutdown: CancellationToken) {
        let tick = (self.config.heartbeat_interval / 2).max(std::time::Duration::from_millis(50));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_maintenance_pass();
                }
                _ = shutdown.cancelled() => {
                    debug!("progress hub maintenance stopped");
                    return;
                }
            }
        }
    }

    fn pop_event(&self, task_id: Uuid, subscriber_id: Uuid) -> PopResult {
        let mut tasks = self.tasks.lock().expect("progress hub lock poisoned");
        let Some(channel) = tasks.get_mut(&task_id) else {
            return PopResult::Closed;
        };
        let Some(state) = channel.subscribers.get_mut(&subscriber_id) else {
            return PopResult::Closed;
        };

        state.last_seen = Instant::now();

        if state.dropped > 0 {
            // Everything dropped was older than anything still queued, so the
            // marker goes out first.
            let next_seq = state
                .queue
                .front()
                .map(|e| e.sequence)
                .unwrap_or(channel.next_sequence);
            let gap = ProgressEvent {
                task_id,
                kind: ProgressEventKind::Gap,
                stage: channel.last_stage,
                progress: channel.last_progress,
                message: format!(
                    "{} events dropped (sequences {}..{}); resume via cursor",
                    state.dropped,
                    state.dropped_first_seq,
                    next_seq.saturating_sub(1)
                ),
                sequence: next_seq,
                timestamp: Utc::now(),
            };
            state.dropped = 0;
            return PopResult::Event(gap);
        }

        match state.queue.pop_front() {
            Some(event) => PopResult::Event(event),
            None if state.closed => PopResult::Closed,
            None => PopResult::Empty,
        }
    }
}

enum PopResult {
    Event(ProgressEvent),
    Empty,
    Closed,
}

/// A live subscription to one task's event stream. Dropping it detaches the
/// subscriber.
#[derive(Debug)]
pub struct Subscription {
    hub: Arc<ProgressHub>,
    task_id: Uuid,
    subscriber_id: Uuid,
    notify: Arc<Notify>,
}

impl Subscription {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn subscriber_id(&self) -> Uuid {
        self.subscriber_id
    }

    /// Next event in publish order. Returns `None` once the stream has
    /// terminated (terminal event consumed, unsubscribe, or purge) and the
    /// queue is drained. Polling refreshes the subscriber's liveness.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.hub.pop_event(self.task_id, self.subscriber_id) {
                PopResult::Event(event) => return Some(event),
                PopResult::Closed => return None,
                PopResult::Empty => self.notify.notified().await,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.task_id, self.subscriber_id);
    }
}
