//! Task lifecycle, scheduling and retries.
//!
//! Pending tasks are kept in a map ordered by `(priority desc, sequence)`, so the first
//! eligible entry is always the most urgent, oldest task. A task that goes back to
//! pending after a retryable failure gets a fresh sequence number and lines up behind
//! its peers. Admission is re-evaluated after every transition.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::QueueSettings;
use crate::crawler::progress::{ProgressPublisher, QueueStatistics};
use crate::crawler::task::{CrawlResult, CrawlTask, Priority, TaskFailure, TaskState};
use crate::crawler::worker::TaskRunner;
use crate::storage::ResultSink;

type OrderKey = (Reverse<Priority>, u64);

struct TaskEntry {
    task: CrawlTask,
    /// Per-task pause overlay
    paused: bool,
    /// Set by `cancel()` on running tasks; the result is thrown away when it arrives
    discard: bool,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<Uuid, TaskEntry>,
    order: BTreeMap<OrderKey, Uuid>,
    /// Owner item id of every pending or running task
    owners: HashMap<String, Uuid>,
    next_seq: u64,
    running: usize,
    completed: usize,
    failed: usize,
    /// Settled tasks whose result is still being delivered
    settling: usize,
    paused: bool,
    started: bool,
    revision: u64,
    /// Work was admitted since the queue last went idle
    busy: bool,
}

impl QueueState {
    fn next_key(&mut self, priority: Priority) -> OrderKey {
        self.next_seq += 1;
        (Reverse(priority), self.next_seq)
    }

    fn statistics(&self) -> QueueStatistics {
        let mut pending = 0;
        let mut paused = 0;
        for id in self.order.values() {
            let task_paused = self.tasks.get(id).map_or(false, |entry| entry.paused);
            if self.paused || task_paused {
                paused += 1;
            } else {
                pending += 1;
            }
        }
        QueueStatistics::new(pending, self.running, paused, self.completed, self.failed)
    }

    /// Statistics for a transition, tagged with a new revision
    fn transition(&mut self) -> (u64, QueueStatistics) {
        self.revision += 1;
        (self.revision, self.statistics())
    }

    fn is_idle(&self) -> bool {
        self.order.is_empty() && self.running == 0 && self.settling == 0
    }

    /// Returns the final statistics when the queue just ran dry after doing work
    fn take_completion(&mut self) -> Option<QueueStatistics> {
        if self.busy && self.is_idle() {
            self.busy = false;
            Some(self.statistics())
        } else {
            None
        }
    }

    fn release_owner(&mut self, owner_item_id: &str, id: Uuid) {
        if self.owners.get(owner_item_id) == Some(&id) {
            self.owners.remove(owner_item_id);
        }
    }

    /// Move eligible tasks to running, most urgent first
    fn admit(&mut self, limit: usize) -> Vec<(CrawlTask, CancellationToken)> {
        let mut admitted = Vec::new();
        if !self.started || self.paused {
            return admitted;
        }

        while self.running < limit {
            let next = self
                .order
                .iter()
                .find(|(_, id)| self.tasks.get(*id).map_or(false, |entry| !entry.paused))
                .map(|(key, id)| (*key, *id));

            let Some((key, id)) = next else {
                break;
            };
            self.order.remove(&key);

            let Some(entry) = self.tasks.get_mut(&id) else {
                continue;
            };
            entry.task.state = TaskState::Running;
            entry.task.attempts += 1;
            admitted.push((entry.task.clone(), entry.cancel.clone()));
            self.running += 1;
        }

        if !admitted.is_empty() {
            self.busy = true;
        }
        admitted
    }
}

/// How one attempt ended
enum AttemptOutcome {
    Finished(CrawlResult),
    /// The runner panicked
    Crashed(String),
}

/// What `finish` does after releasing the lock
enum Settlement {
    Retry,
    Discarded,
    Settled {
        owner_item_id: String,
        deliver: Option<CrawlResult>,
        failure: Option<TaskFailure>,
    },
}

struct QueueInner {
    state: Mutex<QueueState>,
    settings: QueueSettings,
    runner: Arc<dyn TaskRunner>,
    sink: Arc<dyn ResultSink>,
    publisher: ProgressPublisher,
    idle: Notify,
}

/// Priority queue of crawl tasks with bounded concurrency
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(
        settings: QueueSettings,
        runner: Arc<dyn TaskRunner>,
        sink: Arc<dyn ResultSink>,
        publisher: ProgressPublisher,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                settings,
                runner,
                sink,
                publisher,
                idle: Notify::new(),
            }),
        }
    }

    pub fn publisher(&self) -> &ProgressPublisher {
        &self.inner.publisher
    }

    pub fn concurrency(&self) -> usize {
        self.inner.settings.concurrency
    }

    /// Add tasks at `priority`. Tasks whose owner item is already pending or running are
    /// skipped. Returns the number of pending and running tasks.
    pub fn enqueue(&self, tasks: Vec<CrawlTask>, priority: Priority) -> usize {
        self.enqueue_counted(tasks, priority).1
    }

    /// Like [`enqueue`](Self::enqueue), also returning how many tasks were accepted
    pub(crate) fn enqueue_counted(
        &self,
        tasks: Vec<CrawlTask>,
        priority: Priority,
    ) -> (usize, usize) {
        let (added, size, snapshot) = {
            let mut state = self.inner.state.lock();
            let mut added = 0;

            for mut task in tasks {
                if state.owners.contains_key(&task.owner_item_id) {
                    debug!("Item {} already queued, skipping {}", task.owner_item_id, task.url);
                    continue;
                }

                task.priority = priority;
                task.state = TaskState::Pending;
                task.attempts = 0;
                task.last_error = None;
                task.enqueued_at = Utc::now();

                let key = state.next_key(priority);
                state.order.insert(key, task.id);
                state.owners.insert(task.owner_item_id.clone(), task.id);
                state.tasks.insert(
                    task.id,
                    TaskEntry {
                        task,
                        paused: false,
                        discard: false,
                        cancel: CancellationToken::new(),
                    },
                );
                added += 1;
            }

            debug!("Enqueued {} tasks at {:?} priority", added, priority);
            let snapshot = (added > 0).then(|| state.transition());
            (added, state.order.len() + state.running, snapshot)
        };

        if let Some((revision, stats)) = snapshot {
            self.inner.publisher.publish_progress(revision, stats);
            self.pump();
        }
        (added, size)
    }

    /// Begin admitting tasks. Calling it again has no effect.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.started {
                return;
            }
            state.started = true;
        }
        info!("Task queue started (concurrency {})", self.inner.settings.concurrency);
        self.pump();
    }

    /// Stop admitting tasks. Running tasks finish normally. Returns false if already paused.
    pub fn pause(&self) -> bool {
        let (revision, stats) = {
            let mut state = self.inner.state.lock();
            if state.paused {
                return false;
            }
            state.paused = true;
            state.transition()
        };
        info!("Task queue paused");
        self.inner.publisher.publish_progress(revision, stats);
        true
    }

    /// Returns false if the queue was not paused
    pub fn resume(&self) -> bool {
        let (revision, stats) = {
            let mut state = self.inner.state.lock();
            if !state.paused {
                return false;
            }
            state.paused = false;
            state.transition()
        };
        info!("Task queue resumed");
        self.inner.publisher.publish_progress(revision, stats);
        self.pump();
        true
    }

    /// Hold back one pending task without losing its place
    pub fn pause_task(&self, id: Uuid) -> bool {
        let (revision, stats) = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.tasks.get_mut(&id) else {
                return false;
            };
            if entry.paused || entry.task.state != TaskState::Pending {
                return false;
            }
            entry.paused = true;
            entry.task.state = TaskState::Paused;
            state.transition()
        };
        debug!("Task {} paused", id);
        self.inner.publisher.publish_progress(revision, stats);
        true
    }

    pub fn resume_task(&self, id: Uuid) -> bool {
        let (revision, stats) = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.tasks.get_mut(&id) else {
                return false;
            };
            if !entry.paused {
                return false;
            }
            entry.paused = false;
            entry.task.state = TaskState::Pending;
            state.transition()
        };
        debug!("Task {} resumed", id);
        self.inner.publisher.publish_progress(revision, stats);
        self.pump();
        true
    }

    /// Cancel every pending task and discard the results of running ones.
    ///
    /// Completed and failed counters are cleared; running tasks stay in the totals
    /// until they settle. Returns the number of tasks affected.
    pub fn cancel(&self) -> usize {
        let (affected, (revision, stats), completion) = {
            let mut state = self.inner.state.lock();

            let pending: Vec<Uuid> = std::mem::take(&mut state.order).into_values().collect();
            for id in &pending {
                if let Some(mut entry) = state.tasks.remove(id) {
                    entry.task.state = TaskState::Cancelled;
                    state.release_owner(&entry.task.owner_item_id, *id);
                    debug!("Cancelled pending task {} ({})", id, entry.task.url);
                }
            }

            let mut discarded = Vec::new();
            for (id, entry) in state.tasks.iter_mut() {
                if !entry.discard {
                    entry.discard = true;
                    entry.cancel.cancel();
                    discarded.push((entry.task.owner_item_id.clone(), *id));
                }
            }
            for (owner_item_id, id) in &discarded {
                state.release_owner(owner_item_id, *id);
            }

            state.completed = 0;
            state.failed = 0;

            let affected = pending.len() + discarded.len();
            (affected, state.transition(), state.take_completion())
        };

        info!("Cancelled queue ({} tasks affected)", affected);
        self.inner.publisher.publish_progress(revision, stats);
        self.settle_idle(completion);
        affected
    }

    /// Current statistics, without notifying anyone
    pub fn get_statistics(&self) -> QueueStatistics {
        self.inner.state.lock().statistics()
    }

    /// Nothing pending, running or being delivered
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle()
    }

    /// Wait until the queue is idle
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// State of a task that is still owned by the queue
    pub fn task_state(&self, id: Uuid) -> Option<TaskState> {
        self.inner.state.lock().tasks.get(&id).map(|entry| entry.task.state)
    }

    fn pump(&self) {
        let (admitted, snapshot) = {
            let mut state = self.inner.state.lock();
            let admitted = state.admit(self.inner.settings.concurrency);
            if admitted.is_empty() {
                return;
            }
            (admitted, state.transition())
        };

        self.inner.publisher.publish_progress(snapshot.0, snapshot.1);
        for (task, cancel) in admitted {
            self.spawn_attempt(task, cancel);
        }
    }

    fn spawn_attempt(&self, task: CrawlTask, cancel: CancellationToken) {
        let queue = self.clone();
        tokio::spawn(async move {
            debug!("Starting attempt {} for {}", task.attempts, task.url);

            let runner = queue.inner.runner.clone();
            let attempt = task.clone();
            let handle = tokio::spawn(async move { runner.run(&attempt, cancel).await });

            let outcome = match handle.await {
                Ok(result) => AttemptOutcome::Finished(result),
                Err(e) => {
                    error!("Worker for {} crashed: {}", task.url, e);
                    AttemptOutcome::Crashed(e.to_string())
                }
            };

            queue.finish(task.id, outcome).await;
        });
    }

    async fn finish(&self, id: Uuid, outcome: AttemptOutcome) {
        let max_attempts = self.inner.settings.max_attempts;

        let (settlement, (revision, stats)) = {
            let mut state = self.inner.state.lock();
            state.running = state.running.saturating_sub(1);

            let Some(entry) = state.tasks.get_mut(&id) else {
                warn!("Finished task {} is no longer tracked", id);
                return;
            };

            let settlement = if entry.discard {
                let entry = state.tasks.remove(&id);
                if let Some(entry) = entry {
                    info!("Discarded result of cancelled task {}", entry.task.url);
                }
                Settlement::Discarded
            } else {
                match outcome {
                    AttemptOutcome::Finished(result)
                        if result.is_retryable() && entry.task.attempts < max_attempts =>
                    {
                        entry.task.state = TaskState::Pending;
                        entry.task.last_error = result.error_detail.clone();
                        debug!(
                            "Retrying {} after attempt {}: {}",
                            entry.task.url,
                            entry.task.attempts,
                            entry.task.last_error.as_deref().unwrap_or("unknown error")
                        );
                        let priority = entry.task.priority;
                        let key = state.next_key(priority);
                        state.order.insert(key, id);
                        Settlement::Retry
                    }
                    outcome => {
                        let Some(mut entry) = state.tasks.remove(&id) else {
                            return;
                        };
                        let owner_item_id = entry.task.owner_item_id.clone();
                        state.release_owner(&owner_item_id, id);

                        let (deliver, error) = match outcome {
                            AttemptOutcome::Finished(result) if result.is_retryable() => {
                                let error = result
                                    .error_detail
                                    .clone()
                                    .unwrap_or_else(|| "attempts exhausted".to_string());
                                (Some(result), Some(error))
                            }
                            AttemptOutcome::Finished(result) => (Some(result), None),
                            AttemptOutcome::Crashed(message) => (None, Some(message)),
                        };

                        let failure = match error {
                            Some(error) => {
                                entry.task.state = TaskState::Failed;
                                entry.task.last_error = Some(error.clone());
                                state.failed += 1;
                                warn!(
                                    "Task for {} failed after {} attempts: {}",
                                    entry.task.url, entry.task.attempts, error
                                );
                                Some(TaskFailure {
                                    task_id: id,
                                    owner_item_id: owner_item_id.clone(),
                                    url: entry.task.url.clone(),
                                    attempts: entry.task.attempts,
                                    error,
                                    occurred_at: Utc::now(),
                                })
                            }
                            None => {
                                entry.task.state = TaskState::Completed;
                                state.completed += 1;
                                None
                            }
                        };

                        state.settling += 1;
                        Settlement::Settled {
                            owner_item_id,
                            deliver,
                            failure,
                        }
                    }
                }
            };

            (settlement, state.transition())
        };

        self.inner.publisher.publish_progress(revision, stats);

        if let Settlement::Settled {
            owner_item_id,
            deliver,
            failure,
        } = &settlement
        {
            if let Some(result) = deliver {
                if let Err(e) = self.inner.sink.upsert(owner_item_id, result).await {
                    error!("Failed to store result for {}: {}", owner_item_id, e);
                }
            }
            if let Some(failure) = failure {
                self.inner.publisher.publish_error(failure);
            }
        }

        let completion = {
            let mut state = self.inner.state.lock();
            if matches!(settlement, Settlement::Settled { .. }) {
                state.settling -= 1;
            }
            state.take_completion()
        };

        self.settle_idle(completion);
        self.pump();
    }

    /// Report a drained queue and wake idle waiters
    fn settle_idle(&self, completion: Option<QueueStatistics>) {
        if let Some(stats) = completion {
            info!(
                "Queue drained: {} completed, {} failed",
                stats.completed, stats.failed
            );
            self.inner.publisher.publish_complete(stats);
        }

        if self.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }
}
