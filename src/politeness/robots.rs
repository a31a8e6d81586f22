//! Robots policy cache.
//!
//! Only a coarse verdict is kept per host: either the host disallows everything for
//! all user agents, or it is treated as allowed. Failed lookups are cached as allowed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cli::config::RobotsSettings;

/// Verdict for a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotsPolicy {
    pub allowed_all: bool,
}

#[derive(Debug, Clone, Copy)]
struct RobotsEntry {
    allowed_all: bool,
    fetched_at: Instant,
}

/// TTL cache of robots verdicts keyed by domain
pub struct RobotsPolicyCache {
    client: Client,
    settings: RobotsSettings,
    entries: Mutex<HashMap<String, RobotsEntry>>,
    /// One lookup gate per domain; held while its robots file is fetched
    lookups: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RobotsPolicyCache {
    pub fn new(client: Client, settings: RobotsSettings) -> Self {
        Self {
            client,
            settings,
            entries: Mutex::new(HashMap::new()),
            lookups: Mutex::new(HashMap::new()),
        }
    }

    /// Get the policy for `domain`, fetching `/robots.txt` when no fresh entry exists.
    /// Concurrent callers for one domain share a single fetch.
    pub async fn get_policy(&self, domain: &str) -> RobotsPolicy {
        if let Some(entry) = self.fresh_entry(domain) {
            return RobotsPolicy {
                allowed_all: entry.allowed_all,
            };
        }

        let gate = self
            .lookups
            .lock()
            .entry(domain.to_string())
            .or_default()
            .clone();
        let _lookup = gate.lock().await;

        // Filled in by the caller we waited for
        if let Some(entry) = self.fresh_entry(domain) {
            return RobotsPolicy {
                allowed_all: entry.allowed_all,
            };
        }

        let policy = self.lookup(domain).await;
        self.lookups.lock().remove(domain);
        policy
    }

    async fn lookup(&self, domain: &str) -> RobotsPolicy {
        let allowed_all = match self.fetch_robots(domain).await {
            Ok(Some(body)) => !disallows_everything(&body),
            Ok(None) => true,
            Err(e) => {
                warn!("Robots lookup for {} failed, treating as allowed: {}", domain, e);
                true
            }
        };

        debug!("Robots policy for {}: allowed_all={}", domain, allowed_all);
        self.entries.lock().insert(
            domain.to_string(),
            RobotsEntry {
                allowed_all,
                fetched_at: Instant::now(),
            },
        );

        RobotsPolicy { allowed_all }
    }

    fn fresh_entry(&self, domain: &str) -> Option<RobotsEntry> {
        let entries = self.entries.lock();
        entries
            .get(domain)
            .filter(|entry| entry.fetched_at.elapsed() < self.settings.ttl())
            .copied()
    }

    /// Returns the body on a successful response, `None` on any other status
    async fn fetch_robots(&self, domain: &str) -> Result<Option<String>, reqwest::Error> {
        let robots_url = format!("{}://{}/robots.txt", self.settings.scheme, domain);
        debug!("Fetching {}", robots_url);

        let response = self
            .client
            .get(&robots_url)
            .timeout(self.settings.fetch_timeout())
            .send()
            .await?;

        if !response.status().is_success() {
            debug!("{} answered {}", robots_url, response.status());
            return Ok(None);
        }

        Ok(Some(response.text().await?))
    }

    /// Drop the cached verdict for one domain
    pub fn invalidate(&self, domain: &str) -> bool {
        self.entries.lock().remove(domain).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn cached_domains(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Whether a robots file blocks the whole site for every user agent.
///
/// Consecutive `User-agent` lines form a group; a group naming `*` that contains
/// `Disallow: /` blocks everything. Path-specific rules are ignored.
pub fn disallows_everything(robots: &str) -> bool {
    let mut agents: Vec<String> = Vec::new();
    let mut in_rules = false;

    for line in robots.lines() {
        let line = match line.find('#') {
            Some(idx) => &line[..idx],
            None => line,
        }
        .trim();

        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_ascii_lowercase();
        let value = value.trim();

        match field.as_str() {
            "user-agent" => {
                if in_rules {
                    agents.clear();
                    in_rules = false;
                }
                agents.push(value.to_string());
            }
            "disallow" => {
                in_rules = true;
                if value == "/" && agents.iter().any(|agent| agent == "*") {
                    return true;
                }
            }
            "allow" | "crawl-delay" => in_rules = true,
            _ => {}
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> RobotsSettings {
        RobotsSettings {
            scheme: "http".to_string(),
            ..RobotsSettings::default()
        }
    }

    #[test]
    fn wildcard_disallow_root_blocks_everything() {
        assert!(disallows_everything("User-agent: *\nDisallow: /\n"));
        assert!(disallows_everything(
            "# hi\nuser-agent: googlebot\nUser-Agent: *\nDISALLOW: / # all\n"
        ));
    }

    #[test]
    fn partial_or_agent_specific_rules_are_allowed() {
        assert!(!disallows_everything("User-agent: *\nDisallow: /private\n"));
        assert!(!disallows_everything("User-agent: *\nDisallow:\n"));
        assert!(!disallows_everything("User-agent: BadBot\nDisallow: /\n"));
        assert!(!disallows_everything(
            "User-agent: *\nAllow: /\n\nUser-agent: BadBot\nDisallow: /\n"
        ));
        assert!(!disallows_everything(""));
    }

    #[tokio::test]
    async fn second_lookup_within_ttl_uses_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let domain = server.address().to_string();
        let cache = RobotsPolicyCache::new(Client::new(), settings());

        let first = cache.get_policy(&domain).await;
        let second = cache.get_policy(&domain).await;

        assert!(!first.allowed_all);
        assert_eq!(first, second);
        assert_eq!(cache.cached_domains(), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /tmp\n"),
            )
            .expect(2)
            .mount(&server)
            .await;

        let domain = server.address().to_string();
        let cache = RobotsPolicyCache::new(
            Client::new(),
            RobotsSettings {
                ttl_ms: 0,
                ..settings()
            },
        );

        assert!(cache.get_policy(&domain).await.allowed_all);
        assert!(cache.get_policy(&domain).await.allowed_all);
    }

    #[tokio::test]
    async fn missing_robots_file_is_allowed_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let domain = server.address().to_string();
        let cache = RobotsPolicyCache::new(Client::new(), settings());
        assert!(cache.get_policy(&domain).await.allowed_all);
        assert!(cache.get_policy(&domain).await.allowed_all);
    }

    #[tokio::test]
    async fn unreachable_host_fails_open() {
        // Bind then drop a listener so the port is very likely closed
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let domain = format!("127.0.0.1:{}", port);

        let cache = RobotsPolicyCache::new(Client::new(), settings());
        assert!(cache.get_policy(&domain).await.allowed_all);
        assert!(cache.invalidate(&domain));
        assert_eq!(cache.cached_domains(), 0);
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("User-agent: *\nDisallow: /\n")
                    .set_delay(std::time::Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let domain = server.address().to_string();
        let cache = RobotsPolicyCache::new(Client::new(), settings());

        let policies =
            futures::future::join_all((0..4).map(|_| cache.get_policy(&domain))).await;

        assert!(policies.iter().all(|policy| !policy.allowed_all));
        assert_eq!(cache.cached_domains(), 1);
    }
}
