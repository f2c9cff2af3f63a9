//! DNS lookups used by the SPF, DKIM and DMARC checkers
//!
//! The checkers only talk to the [`DnsResolver`] trait. Production code uses
//! [`TrustDnsResolver`], which caches answers and bounds each query with the
//! configured timeout; [`StaticResolver`] serves a fixed in-memory zone.

use async_trait::async_trait;
use dashmap::DashMap;
use mailgate_common::config::DnsConfig;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::TokioAsyncResolver;

/// DNS lookup failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    /// NXDOMAIN or an empty answer
    #[error("no records found")]
    NotFound,
    #[error("DNS timeout")]
    Timeout,
    #[error("DNS lookup cancelled")]
    Cancelled,
    #[error("DNS failure: {0}")]
    Failure(String),
}

impl DnsError {
    /// Whether the error should be reported as a temporary failure
    pub fn is_transient(&self) -> bool {
        !matches!(self, DnsError::NotFound)
    }
}

/// Resolver capability consumed by the checkers
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// TXT records for `name`, each record's strings concatenated
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError>;

    /// A and AAAA records for `name`
    async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>, DnsError>;

    /// MX records for `name` as (preference, exchange)
    async fn lookup_mx(&self, name: &str) -> Result<Vec<(u16, String)>, DnsError>;
}

/// Resolver backed by trust-dns
pub struct TrustDnsResolver {
    resolver: TokioAsyncResolver,
}

impl TrustDnsResolver {
    /// Create a resolver using the system configuration, falling back to the
    /// trust-dns defaults when it cannot be read
    pub fn new(config: &DnsConfig) -> Self {
        let (resolver_config, opts) = match trust_dns_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                warn!("Failed to read system DNS configuration, using defaults: {}", e);
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Self::with_config(resolver_config, opts, config)
    }

    /// Create a resolver with an explicit upstream configuration
    pub fn with_config(
        resolver_config: ResolverConfig,
        mut opts: ResolverOpts,
        config: &DnsConfig,
    ) -> Self {
        opts.timeout = Duration::from_millis(config.timeout_ms);
        opts.attempts = config.attempts;
        opts.cache_size = config.cache_size;
        let resolver = TokioAsyncResolver::tokio(resolver_config, opts);
        Self { resolver }
    }

    fn classify(e: ResolveError) -> DnsError {
        match e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound,
            ResolveErrorKind::Timeout => DnsError::Timeout,
            _ => DnsError::Failure(e.to_string()),
        }
    }
}

#[async_trait]
impl DnsResolver for TrustDnsResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self.resolver.txt_lookup(name).await.map_err(Self::classify)?;
        Ok(lookup
            .iter()
            .map(|record| {
                record
                    .txt_data()
                    .iter()
                    .map(|d| String::from_utf8_lossy(d))
                    .collect::<String>()
            })
            .collect())
    }

    async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        let lookup = self.resolver.lookup_ip(name).await.map_err(Self::classify)?;
        Ok(lookup.iter().collect())
    }

    async fn lookup_mx(&self, name: &str) -> Result<Vec<(u16, String)>, DnsError> {
        let lookup = self.resolver.mx_lookup(name).await.map_err(Self::classify)?;
        Ok(lookup
            .iter()
            .map(|mx| {
                let exchange = mx.exchange().to_utf8();
                (mx.preference(), exchange.trim_end_matches('.').to_string())
            })
            .collect())
    }
}

/// Fixed in-memory zone
///
/// Names are case-insensitive. A name can be configured to fail with a given
/// error, and an artificial delay can be applied to every answer.
#[derive(Clone, Default)]
pub struct StaticResolver {
    txt: Arc<DashMap<String, Vec<String>>>,
    ip: Arc<DashMap<String, Vec<IpAddr>>>,
    mx: Arc<DashMap<String, Vec<(u16, String)>>>,
    failures: Arc<DashMap<String, DnsError>>,
    delay: Option<Duration>,
    queries: Arc<AtomicUsize>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every answer, used to exercise check deadlines
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn add_txt(&self, name: &str, record: impl Into<String>) {
        self.txt.entry(normalize(name)).or_default().push(record.into());
    }

    pub fn add_ip(&self, name: &str, ip: IpAddr) {
        self.ip.entry(normalize(name)).or_default().push(ip);
    }

    pub fn add_mx(&self, name: &str, preference: u16, exchange: &str) {
        self.mx
            .entry(normalize(name))
            .or_default()
            .push((preference, normalize(exchange)));
    }

    /// Make every lookup of `name` fail with `error`
    pub fn fail(&self, name: &str, error: DnsError) {
        self.failures.insert(normalize(name), error);
    }

    /// Number of lookups served so far
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    async fn answer<T: Clone>(
        &self,
        map: &DashMap<String, Vec<T>>,
        name: &str,
    ) -> Result<Vec<T>, DnsError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let name = normalize(name);
        if let Some(error) = self.failures.get(&name) {
            return Err(error.clone());
        }
        match map.get(&name) {
            Some(records) if !records.is_empty() => Ok(records.clone()),
            _ => {
                debug!("No records for {}", name);
                Err(DnsError::NotFound)
            }
        }
    }
}

#[async_trait]
impl DnsResolver for StaticResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.answer(&self.txt, name).await
    }

    async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.answer(&self.ip, name).await
    }

    async fn lookup_mx(&self, name: &str) -> Result<Vec<(u16, String)>, DnsError> {
        self.answer(&self.mx, name).await
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
