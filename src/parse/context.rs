//! Lifecycle of the isolated parse context.
//!
//! The host platform decides how a context is created and may tear it down at any
//! time. [`ParseContextManager`] creates one lazily, hands out its port while it is
//! alive and recreates it on demand after it disappears.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Sender handed to a context for its reply frames
pub type ReplySender = mpsc::UnboundedSender<String>;

/// Reply frames from whichever context is currently alive
pub type ReplyStream = mpsc::UnboundedReceiver<String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("receiving end does not exist")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("isolated parse contexts are not supported on this platform")]
    Unsupported,
    #[error("failed to create parse context: {0}")]
    CreationFailed(String),
}

/// Sending side of a live context
pub trait ContextPort: Send + Sync {
    /// Post one request frame. Fails when the context is gone.
    fn post(&self, frame: String) -> Result<(), PortError>;

    fn is_alive(&self) -> bool;

    /// Ask the context to shut down
    fn close(&self);
}

/// Platform facility that can create isolated contexts
#[async_trait]
pub trait ContextHost: Send + Sync {
    fn is_supported(&self) -> bool;

    async fn create(&self, replies: ReplySender) -> Result<Arc<dyn ContextPort>, ContextError>;
}

/// Host for platforms without isolated contexts; every caller falls back
pub struct UnsupportedHost;

#[async_trait]
impl ContextHost for UnsupportedHost {
    fn is_supported(&self) -> bool {
        false
    }

    async fn create(&self, _replies: ReplySender) -> Result<Arc<dyn ContextPort>, ContextError> {
        Err(ContextError::Unsupported)
    }
}

#[derive(Default)]
struct ContextSlot {
    port: Option<Arc<dyn ContextPort>>,
    last_attempt_failed: bool,
}

/// Owner of the single process-wide parse context
pub struct ParseContextManager {
    host: Arc<dyn ContextHost>,
    replies: ReplySender,
    /// Held across creation so concurrent callers wait for the same attempt
    slot: Mutex<ContextSlot>,
    /// Finished creation attempts, bumped before the slot lock is released
    attempts: AtomicU64,
    created: AtomicU64,
}

impl ParseContextManager {
    /// Create a manager and the stream on which every context's replies arrive
    pub fn new(host: Arc<dyn ContextHost>) -> (Arc<Self>, ReplyStream) {
        let (replies, stream) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            host,
            replies,
            slot: Mutex::new(ContextSlot::default()),
            attempts: AtomicU64::new(0),
            created: AtomicU64::new(0),
        });
        (manager, stream)
    }

    /// Make sure a live context exists. Returns false when none can be provided.
    pub async fn ensure(&self, reason: &str) -> bool {
        self.port(reason).await.is_some()
    }

    /// Port of the live context, creating the context first if needed
    pub async fn port(&self, reason: &str) -> Option<Arc<dyn ContextPort>> {
        let seen_attempts = self.attempts.load(Ordering::SeqCst);
        let mut slot = self.slot.lock().await;

        if let Some(port) = &slot.port {
            if port.is_alive() {
                return Some(port.clone());
            }
            debug!("Parse context went away, dropping stale port");
            slot.port = None;
        }

        // Another caller's attempt finished while we waited for the lock
        if self.attempts.load(Ordering::SeqCst) != seen_attempts && slot.last_attempt_failed {
            return None;
        }

        if !self.host.is_supported() {
            return None;
        }

        info!("Creating parse context ({})", reason);
        let created = self.host.create(self.replies.clone()).await;
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match created {
            Ok(port) => {
                self.created.fetch_add(1, Ordering::SeqCst);
                slot.port = Some(port.clone());
                slot.last_attempt_failed = false;
                Some(port)
            }
            Err(e) => {
                warn!("Parse context unavailable: {}", e);
                slot.last_attempt_failed = true;
                None
            }
        }
    }

    /// Tear the context down. Returns whether one was open.
    pub async fn dispose(&self) -> bool {
        let port = self.slot.lock().await.port.take();
        match port {
            Some(port) => {
                info!("Disposing parse context");
                port.close();
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self) -> bool {
        self.slot
            .lock()
            .await
            .port
            .as_ref()
            .map_or(false, |port| port.is_alive())
    }

    /// Number of contexts successfully created so far
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    struct NullPort {
        alive: AtomicBool,
    }

    impl ContextPort for NullPort {
        fn post(&self, _frame: String) -> Result<(), PortError> {
            if self.is_alive() {
                Ok(())
            } else {
                Err(PortError::Disconnected)
            }
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    struct SlowHost {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ContextHost for SlowHost {
        fn is_supported(&self) -> bool {
            true
        }

        async fn create(
            &self,
            _replies: ReplySender,
        ) -> Result<Arc<dyn ContextPort>, ContextError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            if self.fail {
                return Err(ContextError::CreationFailed("no document".to_string()));
            }
            Ok(Arc::new(NullPort {
                alive: AtomicBool::new(true),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_ensure_creates_once() {
        let host = Arc::new(SlowHost {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let (manager, _replies) = ParseContextManager::new(host.clone());

        let results = futures::future::join_all((0..8).map(|_| manager.ensure("test"))).await;

        assert!(results.into_iter().all(|ok| ok));
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.created_count(), 1);
        assert!(manager.ensure("again").await);
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_a_failed_attempt() {
        let host = Arc::new(SlowHost {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let (manager, _replies) = ParseContextManager::new(host.clone());

        let results = futures::future::join_all((0..5).map(|_| manager.ensure("test"))).await;

        assert!(results.into_iter().all(|ok| !ok));
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);

        // A later, separate call tries again
        assert!(!manager.ensure("retry").await);
        assert_eq!(host.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_arriving_mid_creation_waits_for_it() {
        let host = Arc::new(SlowHost {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let (manager, _replies) = ParseContextManager::new(host.clone());

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.ensure("first").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);

        assert!(!manager.ensure("second").await);
        assert!(!first.await.unwrap());
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_context_is_recreated_and_dispose_closes() {
        let host = Arc::new(SlowHost {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let (manager, _replies) = ParseContextManager::new(host.clone());

        let port = manager.port("first").await.unwrap();
        port.close();
        assert!(!manager.is_active().await);

        assert!(manager.ensure("after teardown").await);
        assert_eq!(manager.created_count(), 2);

        assert!(manager.dispose().await);
        assert!(!manager.dispose().await);
        assert!(!manager.is_active().await);
    }

    #[tokio::test]
    async fn unsupported_host_reports_false() {
        let (manager, _replies) = ParseContextManager::new(Arc::new(UnsupportedHost));
        assert!(!manager.ensure("test").await);
        assert_eq!(manager.created_count(), 0);
    }
}
