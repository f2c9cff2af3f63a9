//! Greylist store
//!
//! Remembers (network block, envelope from, envelope to) tuples and defers the
//! first delivery attempt of each. Entries live in a sharded `DashMap`; every
//! read-modify-write of one tuple happens under its shard's entry lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ipnet::IpNet;
use mailgate_common::config::{GreylistConfig, MAX_DURATION_SECS};
use mailgate_common::{CheckRequest, EmailAddress};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Greylist verdict for one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreylistDecision {
    /// Ask the sender to retry later
    Defer,
    /// Let the message through
    Pass,
}

/// SHA-256 of the normalized tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GreylistKey([u8; 32]);

impl GreylistKey {
    fn new(block: &str, mail_from: Option<&EmailAddress>, rcpt_to: &EmailAddress) -> Self {
        let from = mail_from
            .map(|addr| addr.to_string().to_lowercase())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(block.as_bytes());
        hasher.update([0u8]);
        hasher.update(from.as_bytes());
        hasher.update([0u8]);
        hasher.update(rcpt_to.to_string().to_lowercase().as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for GreylistKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// State of one tuple
#[derive(Debug, Clone)]
pub struct GreylistEntry {
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub passed: bool,
    pub expires_at: Instant,
}

impl GreylistEntry {
    fn fresh(now: Instant, retry_window: Duration) -> Self {
        Self {
            first_seen: now,
            last_seen: now,
            passed: false,
            expires_at: now + retry_window,
        }
    }
}

/// Durations past the validated maximum would overflow `Instant` arithmetic
fn bounded(secs: u64) -> Duration {
    Duration::from_secs(secs.min(MAX_DURATION_SECS))
}

/// Sharded greylist store
pub struct GreylistStore {
    entries: DashMap<GreylistKey, GreylistEntry>,
    enabled: bool,
    min_wait: Duration,
    retry_window: Duration,
    pass_ttl: Duration,
    ipv4_prefix: u8,
    ipv6_prefix: u8,
    whitelist: Vec<IpNet>,
}

impl GreylistStore {
    pub fn new(config: &GreylistConfig) -> Self {
        Self {
            entries: DashMap::new(),
            enabled: config.enabled,
            min_wait: bounded(config.min_wait_secs),
            retry_window: bounded(config.retry_window_secs),
            pass_ttl: bounded(config.pass_ttl_secs),
            ipv4_prefix: config.ipv4_prefix,
            ipv6_prefix: config.ipv6_prefix,
            whitelist: config.whitelist.clone(),
        }
    }

    /// Check a delivery attempt now
    ///
    /// Returns the decision and whether tuple state was recorded; exempt
    /// requests are passed without touching the store.
    pub fn check(&self, req: &CheckRequest) -> (GreylistDecision, bool) {
        self.check_at(req, Instant::now())
    }

    pub fn check_at(&self, req: &CheckRequest, now: Instant) -> (GreylistDecision, bool) {
        if let Some(reason) = self.exemption(req) {
            debug!("Greylisting skipped for {}: {}", req.client_ip, reason);
            return (GreylistDecision::Pass, false);
        }

        let block = self.network_block(req.client_ip);
        let key = GreylistKey::new(&block, req.mail_from.as_ref(), &req.rcpt_to);

        let decision = match self.entries.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(GreylistEntry::fresh(now, self.retry_window));
                debug!("New greylist tuple {} from {}", key, block);
                GreylistDecision::Defer
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.expires_at < now {
                    *entry = GreylistEntry::fresh(now, self.retry_window);
                    debug!("Expired greylist tuple {} restarted", key);
                    GreylistDecision::Defer
                } else if entry.passed {
                    entry.last_seen = now;
                    entry.expires_at = now + self.pass_ttl;
                    GreylistDecision::Pass
                } else if now.duration_since(entry.first_seen) < self.min_wait {
                    // Retried too early: the wait starts over
                    *entry = GreylistEntry::fresh(now, self.retry_window);
                    debug!("Greylist tuple {} retried before min wait", key);
                    GreylistDecision::Defer
                } else {
                    entry.passed = true;
                    entry.last_seen = now;
                    entry.expires_at = now + self.pass_ttl;
                    info!("Greylist tuple {} from {} passed", key, block);
                    GreylistDecision::Pass
                }
            }
        };

        (decision, true)
    }

    fn exemption(&self, req: &CheckRequest) -> Option<&'static str> {
        if !self.enabled {
            Some("disabled")
        } else if req.authenticated_as.is_some() {
            Some("authenticated sender")
        } else if self.whitelist.iter().any(|net| net.contains(&req.client_ip)) {
            Some("whitelisted network")
        } else {
            None
        }
    }

    /// Network block the client IP belongs to, e.g. `203.0.113.0/24`
    fn network_block(&self, ip: IpAddr) -> String {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        let prefix = match ip {
            IpAddr::V4(_) => self.ipv4_prefix,
            IpAddr::V6(_) => self.ipv6_prefix,
        };
        IpNet::new(ip, prefix)
            .map(|net| net.trunc().to_string())
            .unwrap_or_else(|_| ip.to_string())
    }

    /// Drop expired entries
    pub fn prune_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at >= now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Periodically prune expired entries until `shutdown` fires
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.prune_at(Instant::now());
                        if removed > 0 {
                            debug!("Pruned {} expired greylist entries", removed);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GreylistStore {
        GreylistStore::new(&GreylistConfig::default())
    }

    fn request(ip: &str) -> CheckRequest {
        CheckRequest::new(
            ip.parse().unwrap(),
            "mail.sender.example",
            Some(EmailAddress::new("alice", "sender.example")),
            EmailAddress::new("bob", "example.org"),
        )
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_key_is_stable_and_case_insensitive() {
        let to = EmailAddress::new("Bob", "example.org");
        let from = EmailAddress::new("Alice", "x.example");
        let a = GreylistKey::new("192.0.2.0/24", Some(&from), &to);
        let b = GreylistKey::new(
            "192.0.2.0/24",
            Some(&EmailAddress::new("alice", "X.EXAMPLE")),
            &EmailAddress::new("bob", "example.org"),
        );
        assert_eq!(a, b);
        assert_eq!(a.to_string().len(), 64);
        assert_ne!(a, GreylistKey::new("192.0.2.0/24", None, &to));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_defers_then_passes() {
        let store = store();
        let req = request("203.0.113.5");

        assert_eq!(store.check(&req), (GreylistDecision::Defer, true));
        tokio::time::advance(6 * MINUTE).await;
        assert_eq!(store.check(&req), (GreylistDecision::Pass, true));
        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        assert_eq!(store.check(&req), (GreylistDecision::Pass, true));
    }

    #[test]
    fn test_early_retry_restarts_cycle() {
        let store = store();
        let req = request("203.0.113.5");
        let t0 = Instant::now();

        assert_eq!(store.check_at(&req, t0).0, GreylistDecision::Defer);
        assert_eq!(store.check_at(&req, t0 + 2 * MINUTE).0, GreylistDecision::Defer);
        // Only 4 minutes since the restart
        assert_eq!(store.check_at(&req, t0 + 6 * MINUTE).0, GreylistDecision::Defer);
        assert_eq!(store.check_at(&req, t0 + 12 * MINUTE).0, GreylistDecision::Pass);
    }

    #[test]
    fn test_late_retry_starts_over() {
        let store = store();
        let req = request("203.0.113.5");
        let t0 = Instant::now();

        store.check_at(&req, t0);
        assert_eq!(store.check_at(&req, t0 + 5 * 60 * MINUTE).0, GreylistDecision::Defer);
        assert_eq!(
            store.check_at(&req, t0 + 5 * 60 * MINUTE + 5 * MINUTE).0,
            GreylistDecision::Pass
        );
    }

    #[test]
    fn test_same_block_shares_tuple() {
        let store = store();
        let t0 = Instant::now();

        store.check_at(&request("203.0.113.5"), t0);
        let later = t0 + 10 * MINUTE;
        assert_eq!(store.check_at(&request("203.0.113.200"), later).0, GreylistDecision::Pass);
        assert_eq!(store.check_at(&request("203.0.114.5"), later).0, GreylistDecision::Defer);

        store.check_at(&request("2001:db8:1:2::1"), t0);
        assert_eq!(
            store.check_at(&request("2001:db8:1:2:ffff::9"), t0 + 10 * MINUTE).0,
            GreylistDecision::Pass
        );
    }

    #[test]
    fn test_exempt_requests_are_not_recorded() {
        let mut config = GreylistConfig::default();
        config.whitelist = vec!["198.51.100.0/24".parse().unwrap()];
        let store = GreylistStore::new(&config);

        assert_eq!(store.check(&request("198.51.100.7")), (GreylistDecision::Pass, false));
        assert_eq!(
            store.check(&request("192.0.2.1").authenticated("alice")),
            (GreylistDecision::Pass, false)
        );
        assert!(store.is_empty());

        config.enabled = false;
        let disabled = GreylistStore::new(&config);
        assert_eq!(disabled.check(&request("192.0.2.1")), (GreylistDecision::Pass, false));
    }

    #[test]
    fn test_prune_removes_expired() {
        let store = store();
        let t0 = Instant::now();
        store.check_at(&request("192.0.2.1"), t0);
        store.check_at(&request("198.51.100.1"), t0);
        store.check_at(&request("198.51.100.1"), t0 + 10 * MINUTE);

        // The unpassed tuple expires after the retry window, the passed one lives on
        assert_eq!(store.prune_at(t0 + 5 * 60 * MINUTE), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.prune_at(t0 + Duration::from_secs(40 * 24 * 3600)), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unvalidated_ttl_does_not_overflow() {
        let config = GreylistConfig {
            min_wait_secs: 0,
            pass_ttl_secs: i64::MAX as u64,
            retry_window_secs: u64::MAX,
            ..GreylistConfig::default()
        };
        let store = GreylistStore::new(&config);
        let req = request("192.0.2.1");
        let t0 = Instant::now();

        assert_eq!(store.check_at(&req, t0).0, GreylistDecision::Defer);
        assert_eq!(store.check_at(&req, t0 + MINUTE).0, GreylistDecision::Pass);
        assert_eq!(store.check_at(&req, t0 + 2 * MINUTE).0, GreylistDecision::Pass);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_while_pruning() {
        let store = Arc::new(store());
        let req = request("203.0.113.5");
        let t0 = Instant::now();
        store.check_at(&req, t0);

        // Every retry lands after the minimum wait, so the tuple passes once
        // and must stay passed
        let retry_at = t0 + 10 * MINUTE;
        let checkers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let req = req.clone();
                tokio::spawn(async move {
                    let mut decisions = Vec::new();
                    for _ in 0..50 {
                        decisions.push(store.check_at(&req, retry_at).0);
                        tokio::task::yield_now().await;
                    }
                    decisions
                })
            })
            .collect();
        let pruner = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut removed = 0;
                for _ in 0..50 {
                    removed += store.prune_at(retry_at);
                    tokio::task::yield_now().await;
                }
                removed
            })
        };

        for checker in checkers {
            let decisions = checker.await.unwrap();
            assert!(decisions.iter().all(|d| *d == GreylistDecision::Pass));
        }
        assert_eq!(pruner.await.unwrap(), 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.check_at(&req, retry_at + MINUTE).0, GreylistDecision::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_cancel() {
        let store = Arc::new(store());
        store.check(&request("192.0.2.1"));
        let token = CancellationToken::new();
        let handle = store.clone().spawn_sweeper(MINUTE, token.clone());

        tokio::time::sleep(5 * 60 * MINUTE).await;
        assert!(store.is_empty());

        token.cancel();
        handle.await.unwrap();
    }
}
