//! Parse context backed by a dedicated OS thread.
//!
//! The thread owns its own message loop and shares no state with the scheduler: request
//! frames arrive as JSON text and replies leave the same way. It shuts itself down after
//! a period without requests, which is the "platform tore the context down" case the
//! dispatcher has to absorb.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use scraper::{Html, Selector};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use crate::crawler::task::PageMeta;
use crate::parse::context::{ContextError, ContextHost, ContextPort, PortError, ReplySender};
use crate::parse::protocol::{ExtractPayload, ParseReply, ParseRequest, RequestKind};

/// Creates parse contexts as worker threads
pub struct WorkerThreadHost {
    idle_timeout: Duration,
}

impl WorkerThreadHost {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }
}

#[async_trait]
impl ContextHost for WorkerThreadHost {
    fn is_supported(&self) -> bool {
        true
    }

    async fn create(&self, replies: ReplySender) -> Result<Arc<dyn ContextPort>, ContextError> {
        let (frames_tx, frames_rx) = mpsc::channel::<String>();
        let (ready_tx, ready_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let frames = Arc::new(Mutex::new(Some(frames_tx)));

        let thread_alive = alive.clone();
        let thread_frames = Arc::downgrade(&frames);
        let idle_timeout = self.idle_timeout;
        thread::Builder::new()
            .name("parse-context".to_string())
            .spawn(move || {
                let selectors = match MetaSelectors::compile() {
                    Ok(selectors) => selectors,
                    Err(e) => {
                        thread_alive.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run_context(&frames_rx, &thread_frames, &replies, &selectors, idle_timeout);
                thread_alive.store(false, Ordering::SeqCst);
            })
            .map_err(|e| ContextError::CreationFailed(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Arc::new(WorkerPort { frames, alive })),
            Ok(Err(e)) => Err(ContextError::CreationFailed(e)),
            Err(_) => Err(ContextError::CreationFailed(
                "context exited during startup".to_string(),
            )),
        }
    }
}

/// Sending side shared between a port and its thread
type FrameSlot = Mutex<Option<mpsc::Sender<String>>>;

struct WorkerPort {
    frames: Arc<FrameSlot>,
    alive: Arc<AtomicBool>,
}

impl ContextPort for WorkerPort {
    fn post(&self, frame: String) -> Result<(), PortError> {
        let frames = self.frames.lock();
        let Some(sender) = frames.as_ref() else {
            return Err(PortError::Disconnected);
        };
        sender.send(frame).map_err(|_| {
            self.alive.store(false, Ordering::SeqCst);
            PortError::Disconnected
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.frames.lock().is_some()
    }

    fn close(&self) {
        // Dropping the sender ends the thread's receive loop
        self.frames.lock().take();
    }
}

fn run_context(
    frames: &mpsc::Receiver<String>,
    slot: &Weak<FrameSlot>,
    replies: &ReplySender,
    selectors: &MetaSelectors,
    idle_timeout: Duration,
) {
    debug!("Parse context started");
    loop {
        match frames.recv_timeout(idle_timeout) {
            Ok(frame) => {
                if !answer(&frame, replies, selectors) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!("Parse context idle for {:?}, shutting down", idle_timeout);
                shut_down_idle(frames, slot, replies, selectors);
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Parse context stopped");
}

/// Refuse further posts, then answer whatever was accepted before the sender went away
fn shut_down_idle(
    frames: &mpsc::Receiver<String>,
    slot: &Weak<FrameSlot>,
    replies: &ReplySender,
    selectors: &MetaSelectors,
) {
    if let Some(slot) = slot.upgrade() {
        slot.lock().take();
    }
    while let Ok(frame) = frames.try_recv() {
        if !answer(&frame, replies, selectors) {
            break;
        }
    }
}

/// Handle one frame. Returns false once nobody listens for replies.
fn answer(frame: &str, replies: &ReplySender, selectors: &MetaSelectors) -> bool {
    let Some(reply) = handle_frame(frame, selectors) else {
        return true;
    };
    match serde_json::to_string(&reply) {
        Ok(encoded) => replies.send(encoded).is_ok(),
        Err(e) => {
            warn!("Failed to encode reply {}: {}", reply.req_id, e);
            true
        }
    }
}

fn handle_frame(frame: &str, selectors: &MetaSelectors) -> Option<ParseReply> {
    let request: ParseRequest = match serde_json::from_str(frame) {
        Ok(request) => request,
        Err(e) => {
            warn!("Dropping malformed request frame: {}", e);
            return None;
        }
    };

    let reply = match request.request_type {
        RequestKind::Ping => ParseReply::ok(request.req_id, Value::String("pong".to_string())),
        RequestKind::ExtractMetadata => {
            match serde_json::from_value::<ExtractPayload>(request.payload) {
                Ok(payload) => {
                    let meta = selectors.extract(&payload.html, &payload.url);
                    match serde_json::to_value(meta) {
                        Ok(value) => ParseReply::ok(request.req_id, value),
                        Err(e) => ParseReply::error(request.req_id, e.to_string()),
                    }
                }
                Err(e) => {
                    ParseReply::error(request.req_id, format!("invalid extract payload: {}", e))
                }
            }
        }
    };
    Some(reply)
}

struct MetaSelectors {
    title: Selector,
    meta: Selector,
}

impl MetaSelectors {
    fn compile() -> Result<Self, String> {
        Ok(Self {
            title: Selector::parse("title").map_err(|e| format!("{:?}", e))?,
            meta: Selector::parse("meta[content]").map_err(|e| format!("{:?}", e))?,
        })
    }

    fn extract(&self, html: &str, page_url: &str) -> PageMeta {
        let document = Html::parse_document(html);
        let mut meta = PageMeta {
            title: document
                .select(&self.title)
                .next()
                .map(|el| collapse_whitespace(&el.text().collect::<String>()))
                .filter(|title| !title.is_empty()),
            ..PageMeta::default()
        };

        for element in document.select(&self.meta) {
            let value = element.value();
            let Some(key) = value.attr("property").or_else(|| value.attr("name")) else {
                continue;
            };
            let content = collapse_whitespace(value.attr("content").unwrap_or_default());
            if content.is_empty() {
                continue;
            }

            let field = match key.trim().to_ascii_lowercase().as_str() {
                "description" => &mut meta.description,
                "og:title" => &mut meta.og_title,
                "og:description" => &mut meta.og_description,
                "og:image" => &mut meta.og_image,
                "og:site_name" => &mut meta.og_site_name,
                _ => continue,
            };
            if field.is_none() {
                *field = Some(content);
            }
        }

        if let Some(image) = meta.og_image.take() {
            meta.og_image = Some(resolve_url(page_url, &image));
        }
        meta
    }
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve a possibly relative link against the page URL
pub(crate) fn resolve_url(page_url: &str, link: &str) -> String {
    Url::parse(page_url)
        .and_then(|base| base.join(link))
        .map(|url| url.to_string())
        .unwrap_or_else(|_| link.to_string())
}
