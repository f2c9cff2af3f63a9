//! Configuration for MailGate

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Longest duration any setting may configure (ten years)
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// DNS resolver configuration
    #[serde(default)]
    pub dns: DnsConfig,

    /// SPF evaluation limits
    #[serde(default)]
    pub spf: SpfConfig,

    /// Greylisting
    #[serde(default)]
    pub greylist: GreylistConfig,

    /// Token-bucket rate limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Score weights and decision thresholds
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Outbound DKIM signing (optional)
    pub dkim_signing: Option<DkimSigningSettings>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname used in Authentication-Results
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// DNS resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Per-query timeout in milliseconds
    #[serde(default = "default_dns_timeout")]
    pub timeout_ms: u64,

    /// Attempts per query
    #[serde(default = "default_dns_attempts")]
    pub attempts: usize,

    /// Resolver cache size (entries)
    #[serde(default = "default_dns_cache_size")]
    pub cache_size: usize,

    /// Overall deadline for one engine check in milliseconds
    #[serde(default = "default_check_timeout")]
    pub check_timeout_ms: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_dns_timeout(),
            attempts: default_dns_attempts(),
            cache_size: default_dns_cache_size(),
            check_timeout_ms: default_check_timeout(),
        }
    }
}

fn default_dns_timeout() -> u64 {
    2000
}

fn default_dns_attempts() -> usize {
    2
}

fn default_dns_cache_size() -> usize {
    4096
}

fn default_check_timeout() -> u64 {
    10_000
}

/// SPF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpfConfig {
    /// Maximum number of DNS-querying terms per evaluation (RFC 7208 uses 10)
    #[serde(default = "default_max_dns_lookups")]
    pub max_dns_lookups: usize,
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            max_dns_lookups: default_max_dns_lookups(),
        }
    }
}

fn default_max_dns_lookups() -> usize {
    10
}

/// Greylisting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreylistConfig {
    /// Enable greylisting
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum delay before a retry is accepted
    #[serde(default = "default_min_wait")]
    pub min_wait_secs: u64,

    /// Window after first contact in which a retry must arrive
    #[serde(default = "default_retry_window")]
    pub retry_window_secs: u64,

    /// Inactivity TTL of a passed tuple
    #[serde(default = "default_pass_ttl")]
    pub pass_ttl_secs: u64,

    /// Prefix length grouping IPv4 senders into one block
    #[serde(default = "default_ipv4_prefix")]
    pub ipv4_prefix: u8,

    /// Prefix length grouping IPv6 senders into one block
    #[serde(default = "default_ipv6_prefix")]
    pub ipv6_prefix: u8,

    /// Networks that are never greylisted
    #[serde(default)]
    pub whitelist: Vec<IpNet>,

    /// Interval of the expired-entry sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for GreylistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_wait_secs: default_min_wait(),
            retry_window_secs: default_retry_window(),
            pass_ttl_secs: default_pass_ttl(),
            ipv4_prefix: default_ipv4_prefix(),
            ipv6_prefix: default_ipv6_prefix(),
            whitelist: Vec::new(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_min_wait() -> u64 {
    5 * 60
}

fn default_retry_window() -> u64 {
    4 * 60 * 60
}

fn default_pass_ttl() -> u64 {
    36 * 24 * 60 * 60
}

fn default_ipv4_prefix() -> u8 {
    24
}

fn default_ipv6_prefix() -> u8 {
    64
}

fn default_sweep_interval() -> u64 {
    15 * 60
}

/// Rate limiting configuration, one bucket per key kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Buckets keyed by connecting IP
    #[serde(default)]
    pub ip: BucketConfig,

    /// Buckets keyed by authenticated identity
    #[serde(default = "default_identity_bucket")]
    pub identity: BucketConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ip: BucketConfig::default(),
            identity: default_identity_bucket(),
        }
    }
}

/// Token-bucket parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum tokens
    pub capacity: f64,

    /// Tokens added per second
    pub refill_per_sec: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 60.0,
            refill_per_sec: 1.0,
        }
    }
}

fn default_identity_bucket() -> BucketConfig {
    BucketConfig {
        capacity: 200.0,
        refill_per_sec: 2.0,
    }
}

/// Scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Score at or above which a message is rejected
    #[serde(default = "default_reject_threshold")]
    pub reject_threshold: i32,

    /// Score at or above which a message is quarantined
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: i32,

    /// Score reported when the greylist gate defers
    #[serde(default)]
    pub greylist_score: i32,

    /// Score reported when the rate-limit gate rejects
    #[serde(default = "default_rate_limit_score")]
    pub rate_limit_score: i32,

    /// Weights for the full check
    #[serde(default)]
    pub weights: ScoreWeights,

    /// Weights for the minimal-header compatibility check
    #[serde(default = "ScoreWeights::legacy")]
    pub legacy_weights: ScoreWeights,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            reject_threshold: default_reject_threshold(),
            quarantine_threshold: default_quarantine_threshold(),
            greylist_score: 0,
            rate_limit_score: default_rate_limit_score(),
            weights: ScoreWeights::default(),
            legacy_weights: ScoreWeights::legacy(),
        }
    }
}

fn default_reject_threshold() -> i32 {
    70
}

fn default_quarantine_threshold() -> i32 {
    40
}

fn default_rate_limit_score() -> i32 {
    100
}

/// Score deltas applied per signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub spf_pass: i32,
    pub spf_fail: i32,
    pub spf_softfail: i32,
    pub spf_neutral: i32,
    pub spf_none: i32,
    pub spf_temperror: i32,
    pub spf_permerror: i32,
    pub dkim_pass: i32,
    pub dkim_fail: i32,
    pub dkim_none: i32,
    pub dkim_temperror: i32,
    pub dkim_permerror: i32,
    pub dmarc_pass: i32,
    pub dmarc_fail_none: i32,
    pub dmarc_fail_quarantine: i32,
    pub dmarc_fail_reject: i32,
    pub dmarc_temperror: i32,
    pub dmarc_permerror: i32,
    pub helo_suspicious: i32,
    pub missing_from_header: i32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            spf_pass: 0,
            spf_fail: 20,
            spf_softfail: 10,
            spf_neutral: 0,
            spf_none: 0,
            spf_temperror: 5,
            spf_permerror: 5,
            dkim_pass: 0,
            dkim_fail: 15,
            dkim_none: 0,
            dkim_temperror: 5,
            dkim_permerror: 5,
            dmarc_pass: 0,
            dmarc_fail_none: 5,
            dmarc_fail_quarantine: 30,
            dmarc_fail_reject: 50,
            dmarc_temperror: 3,
            dmarc_permerror: 3,
            helo_suspicious: 5,
            missing_from_header: 10,
        }
    }
}

impl ScoreWeights {
    /// Defaults for callers that only supply a minimal header set: signals
    /// that are absent because the caller never had them weigh nothing.
    pub fn legacy() -> Self {
        Self {
            dkim_temperror: 0,
            dkim_permerror: 0,
            spf_temperror: 0,
            dmarc_temperror: 0,
            missing_from_header: 0,
            ..Self::default()
        }
    }
}

/// Outbound DKIM signing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimSigningSettings {
    /// Signing domain (d=)
    pub domain: String,

    /// Selector (s=)
    pub selector: String,

    /// PEM private key file
    pub private_key_path: PathBuf,

    /// "rsa-sha256" or "ed25519-sha256"
    #[serde(default = "default_dkim_algorithm")]
    pub algorithm: String,

    /// Headers to sign
    #[serde(default = "default_signed_headers")]
    pub headers: Vec<String>,
}

fn default_dkim_algorithm() -> String {
    "rsa-sha256".to_string()
}

fn default_signed_headers() -> Vec<String> {
    ["from", "to", "subject", "date", "message-id", "mime-version", "content-type"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config = Self::from_toml(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default locations, falling back to defaults
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./mailgate.toml"),
            PathBuf::from("/etc/mailgate/mailgate.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        let scoring = &self.scoring;
        if scoring.quarantine_threshold > scoring.reject_threshold {
            return Err(crate::Error::Config(format!(
                "quarantine_threshold ({}) exceeds reject_threshold ({})",
                scoring.quarantine_threshold, scoring.reject_threshold
            )));
        }

        let buckets = [("ip", &self.rate_limit.ip), ("identity", &self.rate_limit.identity)];
        for (name, bucket) in buckets {
            let valid = |v: f64| v.is_finite() && v > 0.0;
            if !valid(bucket.capacity) || !valid(bucket.refill_per_sec) {
                return Err(crate::Error::Config(format!(
                    "rate_limit.{} requires positive capacity and refill_per_sec",
                    name
                )));
            }
        }

        let greylist = &self.greylist;
        if greylist.ipv4_prefix > 32 || greylist.ipv6_prefix > 128 {
            return Err(crate::Error::Config(
                "greylist prefix length out of range".to_string(),
            ));
        }
        for (name, secs) in [
            ("greylist.min_wait_secs", greylist.min_wait_secs),
            ("greylist.retry_window_secs", greylist.retry_window_secs),
            ("greylist.pass_ttl_secs", greylist.pass_ttl_secs),
            ("greylist.sweep_interval_secs", greylist.sweep_interval_secs),
            ("dns.timeout_ms", self.dns.timeout_ms / 1000),
            ("dns.check_timeout_ms", self.dns.check_timeout_ms / 1000),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(crate::Error::Config(format!(
                    "{} exceeds the maximum of {} seconds",
                    name, MAX_DURATION_SECS
                )));
            }
        }
        if greylist.min_wait_secs > greylist.retry_window_secs {
            return Err(crate::Error::Config(
                "greylist min_wait_secs exceeds retry_window_secs".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.hostname, "localhost");
        assert_eq!(config.spf.max_dns_lookups, 10);
        assert_eq!(config.greylist.min_wait_secs, 300);
        assert_eq!(config.scoring.reject_threshold, 70);
        assert_eq!(config.scoring.quarantine_threshold, 40);
        assert!(config.dkim_signing.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "mx.example.com"

[greylist]
min_wait_secs = 60
whitelist = ["192.0.2.0/24", "2001:db8::/32"]

[rate_limit.ip]
capacity = 10
refill_per_sec = 0.5

[scoring]
reject_threshold = 80

[scoring.weights]
spf_fail = 25

[dkim_signing]
domain = "example.com"
selector = "mail"
private_key_path = "/etc/mailgate/dkim.pem"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.hostname, "mx.example.com");
        assert_eq!(config.greylist.min_wait_secs, 60);
        assert_eq!(config.greylist.whitelist.len(), 2);
        assert_eq!(config.rate_limit.ip.capacity, 10.0);
        assert_eq!(config.rate_limit.identity, default_identity_bucket());
        assert_eq!(config.scoring.reject_threshold, 80);
        assert_eq!(config.scoring.weights.spf_fail, 25);
        assert_eq!(config.scoring.weights.spf_softfail, 10);
        let signing = config.dkim_signing.unwrap();
        assert_eq!(signing.algorithm, "rsa-sha256");
        assert!(signing.headers.contains(&"from".to_string()));
    }

    #[test]
    fn test_legacy_weights_drop_absent_signals() {
        let legacy = ScoreWeights::legacy();
        assert_eq!(legacy.missing_from_header, 0);
        assert_eq!(legacy.dkim_permerror, 0);
        assert_eq!(legacy.spf_fail, ScoreWeights::default().spf_fail);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let toml = r#"
[scoring]
reject_threshold = 30
quarantine_threshold = 50
"#;
        assert!(matches!(
            Config::from_toml(toml),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_invalid_bucket_rejected() {
        let toml = r#"
[rate_limit.identity]
capacity = 0
refill_per_sec = 1
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let ttl = "[greylist]\npass_ttl_secs = 9223372036854775807\nmin_wait_secs = 0\n";
        assert!(matches!(Config::from_toml(ttl), Err(crate::Error::Config(_))));

        let window = "[greylist]\nretry_window_secs = 18446744073709551615\n";
        assert!(Config::from_toml(window).is_err());

        let timeout = "[dns]\ncheck_timeout_ms = 18446744073709551615\n";
        assert!(Config::from_toml(timeout).is_err());

        let mut config = Config::default();
        config.greylist.pass_ttl_secs = MAX_DURATION_SECS;
        assert!(config.validate().is_ok());
    }
}
