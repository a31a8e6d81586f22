//! Per-host request spacing.
//!
//! Every request to a host first passes through [`DomainThrottle::await_slot`], which
//! suspends the caller until at least the configured interval has passed since the
//! previous request to that host was issued.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;
use url::Url;

use crate::cli::config::ThrottleSettings;

/// Minimum-interval gate keyed by domain
#[derive(Debug)]
pub struct DomainThrottle {
    min_interval: Duration,
    /// Issuance instant of the most recent request per domain
    last_request: Mutex<HashMap<String, Instant>>,
}

impl DomainThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &ThrottleSettings) -> Self {
        Self::new(settings.min_interval())
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until a request to `domain` may be issued and record it as issued.
    ///
    /// The slot is reserved before sleeping, so concurrent callers for the same domain
    /// line up one interval apart instead of waking together. Returns how long the
    /// caller was held back.
    pub async fn await_slot(&self, domain: &str) -> Duration {
        let slot = {
            let mut last_request = self.last_request.lock();
            let now = Instant::now();
            let slot = match last_request.get(domain) {
                Some(&last) => std::cmp::max(now, last + self.min_interval),
                None => now,
            };
            last_request.insert(domain.to_string(), slot);
            slot
        };

        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!("Throttling {} for {}ms", domain, wait.as_millis());
            sleep_until(slot).await;
        }
        wait
    }

    /// When the last request to `domain` was issued (or is scheduled to be)
    pub fn last_request_at(&self, domain: &str) -> Option<Instant> {
        self.last_request.lock().get(domain).copied()
    }

    pub fn tracked_domains(&self) -> usize {
        self.last_request.lock().len()
    }
}

/// Throttle and cache key for a URL: lowercase host, plus the port when one is given
/// explicitly and differs from the scheme default.
pub fn domain_of(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    match url.port() {
        Some(port) => Some(format!("{}:{}", host, port)),
        None => Some(host),
    }
}
