//! Queue statistics and subscriber notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crawler::task::TaskFailure;

/// Snapshot of the queue, derived on every transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    /// Settled share of `total`, 0 to 100
    pub progress: u8,
}

impl QueueStatistics {
    pub fn new(
        pending: usize,
        running: usize,
        paused: usize,
        completed: usize,
        failed: usize,
    ) -> Self {
        let total = pending + running + paused + completed + failed;
        let progress = if total == 0 {
            0
        } else {
            (((completed + failed) * 100 + total / 2) / total) as u8
        };

        Self {
            total,
            pending,
            running,
            paused,
            completed,
            failed,
            progress,
        }
    }

    /// `total` equals the sum of the per-state counters
    pub fn is_consistent(&self) -> bool {
        self.total == self.pending + self.running + self.paused + self.completed + self.failed
    }
}

type StatsCallback = Arc<dyn Fn(&QueueStatistics) + Send + Sync>;
type FailureCallback = Arc<dyn Fn(&TaskFailure) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Progress,
    Complete,
    Error,
}

#[derive(Default)]
struct Listeners {
    progress: Vec<(u64, StatsCallback)>,
    complete: Vec<(u64, StatsCallback)>,
    error: Vec<(u64, FailureCallback)>,
}

#[derive(Default)]
struct PublisherInner {
    listeners: RwLock<Listeners>,
    /// Latest snapshot and the queue revision it belongs to
    latest: Mutex<Option<(u64, QueueStatistics)>>,
    next_id: AtomicU64,
}

/// Fans queue events out to subscribers
#[derive(Clone, Default)]
pub struct ProgressPublisher {
    inner: Arc<PublisherInner>,
}

/// Handle returned by the `on_*` methods
#[must_use = "dropping a Subscription keeps the callback registered; \
              call unsubscribe() to remove it"]
pub struct Subscription {
    publisher: Weak<PublisherInner>,
    kind: ListenerKind,
    id: u64,
}

impl Subscription {
    /// Remove the callback. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.publisher.upgrade() else {
            return false;
        };
        let mut listeners = inner.listeners.write();
        let before;
        let after;
        match self.kind {
            ListenerKind::Progress => {
                before = listeners.progress.len();
                listeners.progress.retain(|(id, _)| *id != self.id);
                after = listeners.progress.len();
            }
            ListenerKind::Complete => {
                before = listeners.complete.len();
                listeners.complete.retain(|(id, _)| *id != self.id);
                after = listeners.complete.len();
            }
            ListenerKind::Error => {
                before = listeners.error.len();
                listeners.error.retain(|(id, _)| *id != self.id);
                after = listeners.error.len();
            }
        }
        before != after
    }
}

impl ProgressPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscription(&self, kind: ListenerKind) -> Subscription {
        Subscription {
            publisher: Arc::downgrade(&self.inner),
            kind,
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Called with a fresh snapshot on every queue transition
    pub fn on_progress(
        &self,
        callback: impl Fn(&QueueStatistics) + Send + Sync + 'static,
    ) -> Subscription {
        let subscription = self.subscription(ListenerKind::Progress);
        self.inner
            .listeners
            .write()
            .progress
            .push((subscription.id, Arc::new(callback)));
        subscription
    }

    /// Called when the queue runs dry after doing work
    pub fn on_complete(
        &self,
        callback: impl Fn(&QueueStatistics) + Send + Sync + 'static,
    ) -> Subscription {
        let subscription = self.subscription(ListenerKind::Complete);
        self.inner
            .listeners
            .write()
            .complete
            .push((subscription.id, Arc::new(callback)));
        subscription
    }

    /// Called for every task that exhausted its attempts
    pub fn on_error(
        &self,
        callback: impl Fn(&TaskFailure) + Send + Sync + 'static,
    ) -> Subscription {
        let subscription = self.subscription(ListenerKind::Error);
        self.inner
            .listeners
            .write()
            .error
            .push((subscription.id, Arc::new(callback)));
        subscription
    }

    /// Latest snapshot, `None` before the queue's first transition
    pub fn get_progress(&self) -> Option<QueueStatistics> {
        self.inner.latest.lock().map(|(_, stats)| stats)
    }

    /// Record and broadcast a snapshot. Snapshots older than the latest one are dropped.
    pub(crate) fn publish_progress(&self, revision: u64, stats: QueueStatistics) {
        {
            let mut latest = self.inner.latest.lock();
            if let Some((seen, _)) = *latest {
                if revision <= seen {
                    debug!("Dropping stale progress snapshot (revision {} <= {})", revision, seen);
                    return;
                }
            }
            *latest = Some((revision, stats));
        }

        let callbacks: Vec<StatsCallback> = self
            .inner
            .listeners
            .read()
            .progress
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(&stats);
        }
    }

    pub(crate) fn publish_complete(&self, stats: QueueStatistics) {
        let callbacks: Vec<StatsCallback> = self
            .inner
            .listeners
            .read()
            .complete
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(&stats);
        }
    }

    pub(crate) fn publish_error(&self, failure: &TaskFailure) {
        let callbacks: Vec<FailureCallback> = self
            .inner
            .listeners
            .read()
            .error
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    #[test]
    fn statistics_totals_and_progress() {
        let stats = QueueStatistics::new(1, 1, 0, 1, 0);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.progress, 33);
        assert!(stats.is_consistent());

        assert_eq!(QueueStatistics::new(0, 0, 0, 0, 0).progress, 0);
        assert_eq!(QueueStatistics::new(0, 0, 0, 2, 1).progress, 100);
        assert_eq!(QueueStatistics::new(1, 0, 0, 1, 0).progress, 50);
    }

    #[test]
    fn subscribers_receive_until_unsubscribed() {
        let publisher = ProgressPublisher::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let subscription = publisher.on_progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(publisher.get_progress(), None);
        publisher.publish_progress(1, QueueStatistics::new(1, 0, 0, 0, 0));
        publisher.publish_progress(2, QueueStatistics::new(0, 1, 0, 0, 0));
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        assert!(subscription.unsubscribe());
        publisher.publish_progress(3, QueueStatistics::new(0, 0, 0, 1, 0));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.get_progress().unwrap().completed, 1);
    }

    #[test]
    fn stale_revisions_are_ignored() {
        let publisher = ProgressPublisher::new();
        publisher.publish_progress(5, QueueStatistics::new(0, 0, 0, 3, 0));
        publisher.publish_progress(4, QueueStatistics::new(3, 0, 0, 0, 0));
        assert_eq!(publisher.get_progress().unwrap().completed, 3);
    }

    #[test]
    fn error_and_complete_listeners() {
        let publisher = ProgressPublisher::new();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let completions = Arc::new(AtomicUsize::new(0));

        let sink = failures.clone();
        let _errors =
            publisher.on_error(move |failure| sink.lock().push(failure.owner_item_id.clone()));
        let counter = completions.clone();
        let complete = publisher.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        publisher.publish_error(&TaskFailure {
            task_id: Uuid::new_v4(),
            owner_item_id: "item-9".to_string(),
            url: "https://gone.example/".to_string(),
            attempts: 3,
            error: "connection refused".to_string(),
            occurred_at: Utc::now(),
        });
        publisher.publish_complete(QueueStatistics::new(0, 0, 0, 0, 1));

        assert_eq!(*failures.lock(), vec!["item-9".to_string()]);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert!(complete.unsubscribe());
    }
}
