//! Request/response correlation with the parse context.
//!
//! Each call gets a fresh request id and a oneshot waiter stored in the pending table.
//! A background pump routes reply frames to their waiters; replies without a waiter
//! are dropped. Waiters are removed when the call settles, whatever the outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cli::config::DispatchSettings;
use crate::crawler::task::PageMeta;
use crate::parse::context::{ParseContextManager, PortError, ReplyStream};
use crate::parse::protocol::{ParseReply, ParseRequest, RequestKind};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("parse context unavailable")]
    ContextUnavailable,

    #[error("receiving end does not exist (gave up after {attempts} attempts)")]
    ChannelClosed { attempts: u32 },

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("parse context rejected the request: {0}")]
    Remote(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("malformed payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

type Waiter = oneshot::Sender<Result<Value, String>>;
type PendingTable = Arc<Mutex<HashMap<u64, Waiter>>>;

/// Removes a waiter from the pending table when the call settles or is dropped
struct PendingGuard {
    pending: PendingTable,
    req_id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.req_id);
    }
}

pub struct Dispatcher {
    contexts: Arc<ParseContextManager>,
    settings: DispatchSettings,
    next_req_id: AtomicU64,
    pending: PendingTable,
    pump: JoinHandle<()>,
}

impl Dispatcher {
    /// Create a dispatcher reading replies from `replies`. Must be called inside a
    /// tokio runtime.
    pub fn new(
        contexts: Arc<ParseContextManager>,
        replies: ReplyStream,
        settings: DispatchSettings,
    ) -> Self {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let pump = tokio::spawn(pump_replies(replies, pending.clone()));

        Self {
            contexts,
            settings,
            next_req_id: AtomicU64::new(1),
            pending,
            pump,
        }
    }

    pub fn contexts(&self) -> &Arc<ParseContextManager> {
        &self.contexts
    }

    /// Send a request with the configured timeout
    pub async fn send(&self, kind: RequestKind, payload: Value) -> Result<Value, DispatchError> {
        self.dispatch(kind, payload, self.settings.timeout(), None).await
    }

    pub async fn send_with_timeout(
        &self,
        kind: RequestKind,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        self.dispatch(kind, payload, timeout, None).await
    }

    /// Like [`send`](Self::send), but settles early once `cancel` fires
    pub async fn send_with_cancel(
        &self,
        kind: RequestKind,
        payload: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        self.dispatch(kind, payload, self.settings.timeout(), Some(cancel)).await
    }

    /// Ask the parse context for the metadata of a page
    pub async fn extract_metadata(
        &self,
        html: &str,
        page_url: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<PageMeta, DispatchError> {
        let payload = json!({ "html": html, "url": page_url });
        let value = self
            .dispatch(RequestKind::ExtractMetadata, payload, self.settings.timeout(), cancel)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn dispatch(
        &self,
        kind: RequestKind,
        payload: Value,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, DispatchError> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        let frame = serde_json::to_string(&ParseRequest {
            req_id,
            request_type: kind,
            payload,
        })?;

        let (waiter, reply) = oneshot::channel();
        self.pending.lock().insert(req_id, waiter);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            req_id,
        };

        let settled = async {
            self.post_with_retry(req_id, frame).await?;
            match tokio::time::timeout(timeout, reply).await {
                Err(_) => {
                    debug!("Request {} timed out after {:?}", req_id, timeout);
                    Err(DispatchError::Timeout(timeout))
                }
                Ok(Err(_)) => Err(DispatchError::ContextUnavailable),
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(message))) => Err(DispatchError::Remote(message)),
            }
        };

        match cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => Err(DispatchError::Cancelled),
                outcome = settled => outcome,
            },
            None => settled.await,
        }
    }

    /// Post a frame, retrying when the context disappeared between lookup and post
    async fn post_with_retry(&self, req_id: u64, frame: String) -> Result<(), DispatchError> {
        let max_attempts = self.settings.transient_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let port = self
                .contexts
                .port("dispatch")
                .await
                .ok_or(DispatchError::ContextUnavailable)?;

            match port.post(frame.clone()) {
                Ok(()) => return Ok(()),
                Err(PortError::Disconnected) if attempt < max_attempts => {
                    debug!(
                        "Request {}: receiving end missing (attempt {}/{}), retrying",
                        req_id, attempt, max_attempts
                    );
                    tokio::time::sleep(self.settings.retry_backoff()).await;
                }
                Err(PortError::Disconnected) => {
                    warn!(
                        "Request {}: parse context unreachable after {} attempts",
                        req_id, attempt
                    );
                    return Err(DispatchError::ChannelClosed { attempts: attempt });
                }
            }
        }
    }

    /// Number of requests still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_replies(mut replies: ReplyStream, pending: PendingTable) {
    while let Some(frame) = replies.recv().await {
        route_reply(&pending, &frame);
    }
}

fn route_reply(pending: &PendingTable, frame: &str) {
    let reply: ParseReply = match serde_json::from_str(frame) {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Dropping malformed reply frame: {}", e);
            return;
        }
    };

    let waiter = pending.lock().remove(&reply.req_id);
    let Some(waiter) = waiter else {
        debug!("Dropping reply for unknown request {}", reply.req_id);
        return;
    };

    let outcome = match reply.error {
        Some(error) => Err(error),
        None => Ok(reply.payload.unwrap_or(Value::Null)),
    };
    // The caller may have given up in the meantime
    let _ = waiter.send(outcome);
}
