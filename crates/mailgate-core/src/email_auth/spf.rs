//! SPF (Sender Policy Framework) verification
//!
//! Implements the subset of RFC 7208 needed to decide whether a connecting IP
//! may send for a domain: `ip4`, `ip6`, `a`, `mx`, `include`, `exists`, `ptr`
//! and `all` mechanisms, the `redirect` modifier and macro expansion.

use super::dns::{DnsError, DnsResolver};
use super::domain::normalize;
use crate::context::CheckContext;
use anyhow::{anyhow, bail, Result};
use mailgate_common::EmailAddress;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// SPF verification result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfResult {
    /// The sending IP is authorized
    Pass,
    /// The sending IP is explicitly not authorized
    Fail,
    /// The sending IP is probably not authorized (soft fail)
    SoftFail,
    /// The domain owner has no opinion
    Neutral,
    /// No SPF record found
    None,
    /// Temporary error (DNS timeout, etc.)
    TempError,
    /// Permanent error (invalid SPF record)
    PermError,
}

impl SpfResult {
    /// Convert to header value for Authentication-Results
    pub fn as_header_value(&self) -> &'static str {
        match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        }
    }
}

/// MX hosts resolved per `mx` mechanism (RFC 7208 section 4.6.4)
const MAX_MX_HOSTS: usize = 10;

/// SPF mechanism types
#[derive(Debug, Clone, PartialEq)]
enum SpfMechanism {
    All,
    Include(String),
    A {
        domain: Option<String>,
        cidr4: u8,
        cidr6: u8,
    },
    Mx {
        domain: Option<String>,
        cidr4: u8,
        cidr6: u8,
    },
    Ip4(ipnet::Ipv4Net),
    Ip6(ipnet::Ipv6Net),
    Ptr(Option<String>),
    Exists(String),
}

/// SPF qualifier (prefix)
#[derive(Debug, Clone, Copy, PartialEq)]
enum SpfQualifier {
    Pass,     // + (default)
    Fail,     // -
    SoftFail, // ~
    Neutral,  // ?
}

impl SpfQualifier {
    fn to_result(self) -> SpfResult {
        match self {
            SpfQualifier::Pass => SpfResult::Pass,
            SpfQualifier::Fail => SpfResult::Fail,
            SpfQualifier::SoftFail => SpfResult::SoftFail,
            SpfQualifier::Neutral => SpfResult::Neutral,
        }
    }
}

/// Parsed SPF directive (qualifier + mechanism)
#[derive(Debug, Clone)]
struct SpfDirective {
    qualifier: SpfQualifier,
    mechanism: SpfMechanism,
}

/// Parsed SPF record
#[derive(Debug, Clone)]
struct SpfRecord {
    directives: Vec<SpfDirective>,
    redirect: Option<String>,
}

/// State of one evaluation, shared across include/redirect recursion
struct Evaluation {
    ctx: CheckContext,
    client_ip: IpAddr,
    sender_local: String,
    sender_domain: String,
    helo: String,
    lookups: usize,
    /// Domains on the current include/redirect chain
    chain: Vec<String>,
}

/// Terminal outcome raised while evaluating a term
type Abort = SpfResult;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// SPF verifier
pub struct SpfVerifier {
    resolver: Arc<dyn DnsResolver>,
    max_dns_lookups: usize,
}

impl SpfVerifier {
    /// Create a new SPF verifier
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            resolver,
            max_dns_lookups: 10, // RFC 7208 limit
        }
    }

    pub fn with_max_dns_lookups(mut self, max_dns_lookups: usize) -> Self {
        self.max_dns_lookups = max_dns_lookups;
        self
    }

    /// Evaluate the SPF policy of `domain` for `client_ip`
    ///
    /// `sender` is the full envelope sender used for macro expansion; a
    /// sender without a local part is treated as `postmaster`.
    pub async fn check(
        &self,
        ctx: &CheckContext,
        client_ip: IpAddr,
        domain: &str,
        sender: &str,
        helo: &str,
    ) -> SpfResult {
        let domain = normalize(domain);
        let (local, sender_domain) = match sender.rsplit_once('@') {
            Some((local, d)) if !local.is_empty() => (local.to_string(), normalize(d)),
            Some((_, d)) => ("postmaster".to_string(), normalize(d)),
            None => ("postmaster".to_string(), domain.clone()),
        };
        let mut state = Evaluation {
            ctx: ctx.clone(),
            client_ip: canonical_ip(client_ip),
            sender_local: local,
            sender_domain,
            helo: normalize(helo),
            lookups: 0,
            chain: Vec::new(),
        };
        let result = self.evaluate(&mut state, domain.clone()).await;
        debug!(
            "SPF {} for {} from {} ({} lookups)",
            result.as_header_value(),
            domain,
            client_ip,
            state.lookups
        );
        result
    }

    /// Verify SPF for an SMTP transaction
    ///
    /// The null sender is checked as `postmaster@<helo>`. Returns the result
    /// together with the domain that was evaluated.
    pub async fn verify(
        &self,
        ctx: &CheckContext,
        mail_from: Option<&EmailAddress>,
        helo: &str,
        client_ip: IpAddr,
    ) -> (SpfResult, Option<String>) {
        let helo = normalize(helo);
        let (local, domain) = match mail_from {
            Some(addr) => (addr.local.clone(), normalize(&addr.domain)),
            None => ("postmaster".to_string(), helo.clone()),
        };

        if domain.is_empty() || !domain.contains('.') {
            debug!("No usable SPF identity (mail from {:?}, helo {})", mail_from, helo);
            return (SpfResult::None, None);
        }

        debug!("Checking SPF for domain {} from IP {}", domain, client_ip);

        let sender = format!("{}@{}", local, domain);
        let result = self.check(ctx, client_ip, &domain, &sender, &helo).await;
        (result, Some(domain))
    }

    /// Recursive SPF check of one domain
    fn evaluate<'a>(
        &'a self,
        state: &'a mut Evaluation,
        domain: String,
    ) -> BoxFuture<'a, SpfResult> {
        Box::pin(async move {
            if state.chain.contains(&domain) {
                warn!("SPF include loop detected at {}", domain);
                return SpfResult::PermError;
            }

            let record = match self.get_spf_record(state, &domain).await {
                Ok(Some(record)) => record,
                Ok(None) => return SpfResult::None,
                Err(result) => return result,
            };

            debug!("Found SPF record for {}: {}", domain, record);

            let record = match parse_spf_record(&record) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Failed to parse SPF record for {}: {}", domain, e);
                    return SpfResult::PermError;
                }
            };

            state.chain.push(domain.clone());
            let result = self.evaluate_record(state, &record, &domain).await;
            state.chain.pop();
            result
        })
    }

    async fn evaluate_record(
        &self,
        state: &mut Evaluation,
        record: &SpfRecord,
        domain: &str,
    ) -> SpfResult {
        for directive in &record.directives {
            match self.matches(state, &directive.mechanism, domain).await {
                Ok(true) => return directive.qualifier.to_result(),
                Ok(false) => continue,
                Err(result) => return result,
            }
        }

        // redirect only applies when no mechanism matched
        if let Some(target) = &record.redirect {
            if let Err(result) = self.count_lookup(state) {
                return result;
            }
            let target = match expand_macros(target, state, domain) {
                Ok(t) => t,
                Err(result) => return result,
            };
            return match self.evaluate(state, target).await {
                SpfResult::None => SpfResult::PermError,
                result => result,
            };
        }

        // Default result if no mechanism matches
        SpfResult::Neutral
    }

    /// Get the single SPF TXT record for a domain
    async fn get_spf_record(
        &self,
        state: &Evaluation,
        domain: &str,
    ) -> Result<Option<String>, Abort> {
        let txts = match state.ctx.resolve(self.resolver.lookup_txt(domain)).await {
            Ok(txts) => txts,
            Err(DnsError::NotFound) => return Ok(None),
            Err(e) => {
                warn!("DNS lookup failed for {}: {}", domain, e);
                return Err(SpfResult::TempError);
            }
        };

        let mut records = txts.into_iter().filter(|txt| is_spf_record(txt));
        match (records.next(), records.next()) {
            (None, _) => Ok(None),
            (Some(record), None) => Ok(Some(record)),
            (Some(_), Some(_)) => {
                warn!("Multiple SPF records published for {}", domain);
                Err(SpfResult::PermError)
            }
        }
    }

    fn count_lookup(&self, state: &mut Evaluation) -> Result<(), Abort> {
        state.lookups += 1;
        if state.lookups > self.max_dns_lookups {
            warn!("SPF DNS lookup limit of {} exceeded", self.max_dns_lookups);
            return Err(SpfResult::PermError);
        }
        Ok(())
    }

    /// Evaluate a single SPF mechanism
    async fn matches(
        &self,
        state: &mut Evaluation,
        mechanism: &SpfMechanism,
        domain: &str,
    ) -> Result<bool, Abort> {
        match mechanism {
            SpfMechanism::All => Ok(true),

            SpfMechanism::Ip4(network) => Ok(match state.client_ip {
                IpAddr::V4(ip) => network.contains(&ip),
                IpAddr::V6(_) => false,
            }),

            SpfMechanism::Ip6(network) => Ok(match state.client_ip {
                IpAddr::V6(ip) => network.contains(&ip),
                IpAddr::V4(_) => false,
            }),

            SpfMechanism::A { domain: target, cidr4, cidr6 } => {
                self.count_lookup(state)?;
                let target = self.target_domain(state, target.as_deref(), domain)?;
                let addrs = self.resolve_ips(state, &target).await?;
                Ok(addrs
                    .iter()
                    .any(|addr| ip_in_prefix(state.client_ip, *addr, *cidr4, *cidr6)))
            }

            SpfMechanism::Mx { domain: target, cidr4, cidr6 } => {
                self.count_lookup(state)?;
                let target = self.target_domain(state, target.as_deref(), domain)?;
                let mut hosts = match state.ctx.resolve(self.resolver.lookup_mx(&target)).await {
                    Ok(hosts) => hosts,
                    Err(DnsError::NotFound) => return Ok(false),
                    Err(e) => {
                        warn!("MX lookup failed for {}: {}", target, e);
                        return Err(SpfResult::TempError);
                    }
                };
                if hosts.len() > MAX_MX_HOSTS {
                    warn!("Too many MX hosts for {} ({})", target, hosts.len());
                    return Err(SpfResult::PermError);
                }
                hosts.sort_by_key(|(preference, _)| *preference);
                for (_, host) in hosts {
                    let addrs = self.resolve_ips(state, &host).await?;
                    if addrs
                        .iter()
                        .any(|addr| ip_in_prefix(state.client_ip, *addr, *cidr4, *cidr6))
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            }

            SpfMechanism::Include(included) => {
                self.count_lookup(state)?;
                let target = expand_macros(included, state, domain)?;
                match self.evaluate(state, target).await {
                    SpfResult::Pass => Ok(true),
                    SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => Ok(false),
                    SpfResult::TempError => Err(SpfResult::TempError),
                    SpfResult::PermError | SpfResult::None => Err(SpfResult::PermError),
                }
            }

            SpfMechanism::Ptr(_) => {
                self.count_lookup(state)?;
                // PTR mechanism is deprecated and computationally expensive
                // We treat it as a non-match for security reasons
                warn!("PTR mechanism used but not evaluated (deprecated)");
                Ok(false)
            }

            SpfMechanism::Exists(spec) => {
                self.count_lookup(state)?;
                let target = expand_macros(spec, state, domain)?;
                Ok(!self.resolve_ips(state, &target).await?.is_empty())
            }
        }
    }

    fn target_domain(
        &self,
        state: &Evaluation,
        spec: Option<&str>,
        domain: &str,
    ) -> Result<String, Abort> {
        match spec {
            Some(spec) => expand_macros(spec, state, domain),
            None => Ok(domain.to_string()),
        }
    }

    async fn resolve_ips(&self, state: &Evaluation, name: &str) -> Result<Vec<IpAddr>, Abort> {
        match state.ctx.resolve(self.resolver.lookup_ip(name)).await {
            Ok(addrs) => Ok(addrs),
            Err(DnsError::NotFound) => Ok(Vec::new()),
            Err(e) => {
                warn!("Address lookup failed for {}: {}", name, e);
                Err(SpfResult::TempError)
            }
        }
    }
}

fn is_spf_record(txt: &str) -> bool {
    let txt = txt.trim_start();
    match txt.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("v=spf1") => {
            txt.len() == 6 || txt[6..].starts_with(' ')
        }
        _ => false,
    }
}

/// IPv4-mapped IPv6 clients are evaluated as IPv4
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

fn ip_in_prefix(client: IpAddr, candidate: IpAddr, cidr4: u8, cidr6: u8) -> bool {
    match (client, candidate) {
        (IpAddr::V4(client), IpAddr::V4(candidate)) => ipnet::Ipv4Net::new(candidate, cidr4)
            .map(|net| net.contains(&client))
            .unwrap_or(false),
        (IpAddr::V6(client), IpAddr::V6(candidate)) => ipnet::Ipv6Net::new(candidate, cidr6)
            .map(|net| net.contains(&client))
            .unwrap_or(false),
        _ => false,
    }
}

/// Parse SPF record into directives
fn parse_spf_record(record: &str) -> Result<SpfRecord> {
    let mut directives = Vec::new();
    let mut redirect = None;

    let terms = record
        .trim_start()
        .get(6..)
        .filter(|_| is_spf_record(record))
        .ok_or_else(|| anyhow!("Invalid SPF record: missing v=spf1"))?;

    for term in terms.split_whitespace() {
        // Modifiers are name=value; only redirect affects the result
        if let Some((name, value)) = term.split_once('=') {
            if name.contains(':') || name.contains('/') {
                bail!("Malformed SPF term: {}", term);
            }
            match name.to_ascii_lowercase().as_str() {
                "redirect" => {
                    if redirect.replace(value.to_string()).is_some() {
                        bail!("Duplicate redirect modifier");
                    }
                }
                "exp" => {}
                _ => debug!("Ignoring unknown SPF modifier {}", name),
            }
            continue;
        }

        // Parse qualifier
        let (qualifier, mechanism_str) = match term.chars().next() {
            Some('+') => (SpfQualifier::Pass, &term[1..]),
            Some('-') => (SpfQualifier::Fail, &term[1..]),
            Some('~') => (SpfQualifier::SoftFail, &term[1..]),
            Some('?') => (SpfQualifier::Neutral, &term[1..]),
            _ => (SpfQualifier::Pass, term),
        };

        directives.push(SpfDirective {
            qualifier,
            mechanism: parse_mechanism(mechanism_str)?,
        });
    }

    Ok(SpfRecord { directives, redirect })
}

/// Parse a single SPF mechanism
fn parse_mechanism(s: &str) -> Result<SpfMechanism> {
    let split = s.find([':', '/']).unwrap_or(s.len());
    let (name, rest) = s.split_at(split);

    match name.to_ascii_lowercase().as_str() {
        "all" if rest.is_empty() => Ok(SpfMechanism::All),
        "a" => {
            let (domain, cidr4, cidr6) = parse_domain_cidr(rest)?;
            Ok(SpfMechanism::A { domain, cidr4, cidr6 })
        }
        "mx" => {
            let (domain, cidr4, cidr6) = parse_domain_cidr(rest)?;
            Ok(SpfMechanism::Mx { domain, cidr4, cidr6 })
        }
        "ip4" => {
            let network = rest
                .strip_prefix(':')
                .ok_or_else(|| anyhow!("ip4 requires an address"))?;
            let net = if network.contains('/') {
                network.parse()?
            } else {
                format!("{}/32", network).parse()?
            };
            Ok(SpfMechanism::Ip4(net))
        }
        "ip6" => {
            let network = rest
                .strip_prefix(':')
                .ok_or_else(|| anyhow!("ip6 requires an address"))?;
            let net = if network.contains('/') {
                network.parse()?
            } else {
                format!("{}/128", network).parse()?
            };
            Ok(SpfMechanism::Ip6(net))
        }
        "include" => Ok(SpfMechanism::Include(required_domain(rest)?)),
        "exists" => Ok(SpfMechanism::Exists(required_domain(rest)?)),
        "ptr" => Ok(SpfMechanism::Ptr(
            rest.strip_prefix(':').map(|d| d.to_string()),
        )),
        _ => Err(anyhow!("Unknown SPF mechanism: {}", s)),
    }
}

fn required_domain(rest: &str) -> Result<String> {
    match rest.strip_prefix(':') {
        Some(domain) if !domain.is_empty() => Ok(domain.to_string()),
        _ => Err(anyhow!("Mechanism requires a domain")),
    }
}

/// Parse `[:domain][/cidr4][//cidr6]`
fn parse_domain_cidr(rest: &str) -> Result<(Option<String>, u8, u8)> {
    let (domain_part, cidr_part) = match rest.find('/') {
        Some(pos) => rest.split_at(pos),
        None => (rest, ""),
    };

    let domain = if domain_part.is_empty() {
        None
    } else {
        Some(required_domain(domain_part)?)
    };

    let (v4, v6) = match cidr_part.strip_prefix("//") {
        Some(v6) => ("", v6),
        None => match cidr_part.strip_prefix('/') {
            Some(cidrs) => match cidrs.split_once("//") {
                Some((v4, v6)) => (v4, v6),
                None => (cidrs, ""),
            },
            None => ("", ""),
        },
    };

    let cidr4 = if v4.is_empty() { 32 } else { v4.parse::<u8>()? };
    let cidr6 = if v6.is_empty() { 128 } else { v6.parse::<u8>()? };
    if cidr4 > 32 || cidr6 > 128 {
        bail!("CIDR length out of range");
    }
    Ok((domain, cidr4, cidr6))
}

/// Expand SPF macros (`%{s}`, `%{l}`, `%{o}`, `%{d}`, `%{i}`, `%{h}`, `%{v}`)
fn expand_macros(spec: &str, state: &Evaluation, domain: &str) -> Result<String, Abort> {
    if !spec.contains('%') {
        return Ok(normalize(spec));
    }

    let mut out = String::with_capacity(spec.len());
    let mut chars = spec.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('_') => out.push(' '),
            Some('-') => out.push_str("%20"),
            Some('{') => {
                let mut body = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => body.push(ch),
                        None => return Err(SpfResult::PermError),
                    }
                }
                out.push_str(&expand_macro(&body, state, domain)?);
            }
            _ => return Err(SpfResult::PermError),
        }
    }
    Ok(normalize(&out))
}

fn expand_macro(body: &str, state: &Evaluation, domain: &str) -> Result<String, Abort> {
    let mut chars = body.chars();
    let letter = chars.next().ok_or(SpfResult::PermError)?;
    let rest: String = chars.collect();

    let value = match letter.to_ascii_lowercase() {
        's' => format!("{}@{}", state.sender_local, state.sender_domain),
        'l' => state.sender_local.clone(),
        'o' => state.sender_domain.clone(),
        'd' => domain.to_string(),
        'h' => state.helo.clone(),
        'i' => match state.client_ip {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => ip
                .octets()
                .iter()
                .flat_map(|b| [b >> 4, b & 0x0f])
                .map(|n| format!("{:x}", n))
                .collect::<Vec<_>>()
                .join("."),
        },
        'v' => match state.client_ip {
            IpAddr::V4(_) => "in-addr".to_string(),
            IpAddr::V6(_) => "ip6".to_string(),
        },
        _ => return Err(SpfResult::PermError),
    };

    // Transformers: optional digits, optional 'r', optional delimiters
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let mut tail = &rest[digits.len()..];
    let reverse = tail.starts_with(['r', 'R']);
    if reverse {
        tail = &tail[1..];
    }
    if !tail.chars().all(|c| ".-+,/_=".contains(c)) {
        return Err(SpfResult::PermError);
    }
    let delimiters: Vec<char> = if tail.is_empty() { vec!['.'] } else { tail.chars().collect() };

    let mut parts: Vec<&str> = value.split(|c| delimiters.contains(&c)).collect();
    if reverse {
        parts.reverse();
    }
    if !digits.is_empty() {
        let keep: usize = digits.parse().map_err(|_| SpfResult::PermError)?;
        if keep == 0 {
            return Err(SpfResult::PermError);
        }
        if parts.len() > keep {
            parts = parts.split_off(parts.len() - keep);
        }
    }
    Ok(parts.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email_auth::dns::StaticResolver;
    use std::time::Duration;

    fn verifier(resolver: &StaticResolver) -> SpfVerifier {
        SpfVerifier::new(Arc::new(resolver.clone()))
    }

    fn ctx() -> CheckContext {
        CheckContext::new(Duration::from_secs(5))
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    async fn check(spf: &SpfVerifier, client_ip: IpAddr, domain: &str) -> SpfResult {
        let sender = format!("postmaster@{}", domain);
        spf.check(&ctx(), client_ip, domain, &sender, "mail.example.net")
            .await
    }

    #[test]
    fn test_parse_spf_record() {
        let record = "v=spf1 ip4:192.168.1.0/24 include:_spf.google.com -all";
        let parsed = parse_spf_record(record).unwrap();
        let directives = parsed.directives;

        assert_eq!(directives.len(), 3);
        assert!(matches!(directives[0].mechanism, SpfMechanism::Ip4(_)));
        assert!(matches!(directives[1].mechanism, SpfMechanism::Include(_)));
        assert!(matches!(directives[2].mechanism, SpfMechanism::All));
        assert_eq!(directives[2].qualifier, SpfQualifier::Fail);
        assert!(parsed.redirect.is_none());
    }

    #[test]
    fn test_parse_dual_cidr() {
        assert_eq!(
            parse_mechanism("a:mail.example.com/24//64").unwrap(),
            SpfMechanism::A {
                domain: Some("mail.example.com".to_string()),
                cidr4: 24,
                cidr6: 64
            }
        );
        assert_eq!(
            parse_mechanism("mx//48").unwrap(),
            SpfMechanism::Mx {
                domain: None,
                cidr4: 32,
                cidr6: 48
            }
        );
        assert!(parse_mechanism("a/33").is_err());
        assert!(parse_mechanism("include").is_err());
        assert!(parse_mechanism("bogus:example.com").is_err());
    }

    #[test]
    fn test_parse_redirect_modifier() {
        let parsed = parse_spf_record("v=spf1 mx redirect=_spf.example.com").unwrap();
        assert_eq!(parsed.redirect.as_deref(), Some("_spf.example.com"));
        assert_eq!(parsed.directives.len(), 1);
    }

    #[test]
    fn test_is_spf_record() {
        assert!(is_spf_record("v=spf1 -all"));
        assert!(is_spf_record("V=SPF1"));
        assert!(!is_spf_record("v=spf10 -all"));
        assert!(!is_spf_record("google-site-verification=abc"));
    }

    #[test]
    fn test_spf_result_header_value() {
        assert_eq!(SpfResult::Pass.as_header_value(), "pass");
        assert_eq!(SpfResult::Fail.as_header_value(), "fail");
        assert_eq!(SpfResult::SoftFail.as_header_value(), "softfail");
    }

    #[tokio::test]
    async fn test_no_record_is_none() {
        let resolver = StaticResolver::new();
        let spf = verifier(&resolver);
        assert_eq!(
            check(&spf, ip("203.0.113.5"), "example.com").await,
            SpfResult::None
        );

        resolver.add_txt("example.com", "some unrelated text");
        assert_eq!(
            check(&spf, ip("203.0.113.5"), "example.com").await,
            SpfResult::None
        );
    }

    #[tokio::test]
    async fn test_ip4_range() {
        let resolver = StaticResolver::new();
        resolver.add_txt("example.com", "v=spf1 ip4:203.0.113.0/24 -all");
        let spf = verifier(&resolver);

        assert_eq!(
            check(&spf, ip("203.0.113.5"), "example.com").await,
            SpfResult::Pass
        );
        assert_eq!(
            check(&spf, ip("198.51.100.9"), "example.com").await,
            SpfResult::Fail
        );
        assert_eq!(
            check(&spf, ip("::ffff:203.0.113.7"), "example.com").await,
            SpfResult::Pass
        );
    }

    #[tokio::test]
    async fn test_qualifiers_and_default() {
        let resolver = StaticResolver::new();
        resolver.add_txt("soft.example", "v=spf1 ip4:192.0.2.1 ~all");
        resolver.add_txt("neutral.example", "v=spf1 ?all");
        resolver.add_txt("empty.example", "v=spf1");
        let spf = verifier(&resolver);
        let client = ip("198.51.100.1");

        assert_eq!(check(&spf, client, "soft.example").await, SpfResult::SoftFail);
        assert_eq!(check(&spf, client, "neutral.example").await, SpfResult::Neutral);
        assert_eq!(check(&spf, client, "empty.example").await, SpfResult::Neutral);
    }

    #[tokio::test]
    async fn test_multiple_records_is_permerror() {
        let resolver = StaticResolver::new();
        resolver.add_txt("example.com", "v=spf1 -all");
        resolver.add_txt("example.com", "v=spf1 +all");
        let spf = verifier(&resolver);

        assert_eq!(
            check(&spf, ip("192.0.2.1"), "example.com").await,
            SpfResult::PermError
        );
    }

    #[tokio::test]
    async fn test_a_and_mx_mechanisms() {
        let resolver = StaticResolver::new();
        resolver.add_txt("example.com", "v=spf1 a mx:example.net/24 -all");
        resolver.add_ip("example.com", ip("192.0.2.10"));
        resolver.add_mx("example.net", 10, "mx.example.net");
        resolver.add_ip("mx.example.net", ip("198.51.100.20"));
        let spf = verifier(&resolver);

        assert_eq!(check(&spf, ip("192.0.2.10"), "example.com").await, SpfResult::Pass);
        assert_eq!(check(&spf, ip("198.51.100.77"), "example.com").await, SpfResult::Pass);
        assert_eq!(check(&spf, ip("203.0.113.1"), "example.com").await, SpfResult::Fail);
    }

    #[tokio::test]
    async fn test_include_chain() {
        let resolver = StaticResolver::new();
        resolver.add_txt("example.com", "v=spf1 include:_spf.provider.net -all");
        resolver.add_txt("_spf.provider.net", "v=spf1 ip4:198.51.100.0/24 -all");
        let spf = verifier(&resolver);

        assert_eq!(check(&spf, ip("198.51.100.3"), "example.com").await, SpfResult::Pass);
        assert_eq!(check(&spf, ip("192.0.2.3"), "example.com").await, SpfResult::Fail);
    }

    #[tokio::test]
    async fn test_include_of_missing_record_is_permerror() {
        let resolver = StaticResolver::new();
        resolver.add_txt("example.com", "v=spf1 include:missing.example -all");
        let spf = verifier(&resolver);

        assert_eq!(
            check(&spf, ip("192.0.2.3"), "example.com").await,
            SpfResult::PermError
        );
    }

    #[tokio::test]
    async fn test_self_referential_include_is_permerror() {
        let resolver = StaticResolver::new();
        resolver.add_txt("loop.example", "v=spf1 include:other.example -all");
        resolver.add_txt("other.example", "v=spf1 include:loop.example -all");
        let spf = verifier(&resolver);

        assert_eq!(
            check(&spf, ip("192.0.2.3"), "loop.example").await,
            SpfResult::PermError
        );
    }

    #[tokio::test]
    async fn test_lookup_limit_is_permerror() {
        let resolver = StaticResolver::new();
        let record = format!(
            "v=spf1 {} -all",
            (0..11).map(|i| format!("a:h{}.example", i)).collect::<Vec<_>>().join(" ")
        );
        resolver.add_txt("example.com", record);
        let spf = verifier(&resolver);

        assert_eq!(
            check(&spf, ip("192.0.2.3"), "example.com").await,
            SpfResult::PermError
        );
    }

    #[tokio::test]
    async fn test_dns_failure_is_temperror() {
        let resolver = StaticResolver::new();
        resolver.add_txt("example.com", "v=spf1 a:broken.example -all");
        resolver.fail("broken.example", DnsError::Failure("SERVFAIL".into()));
        let spf = verifier(&resolver);

        assert_eq!(
            check(&spf, ip("192.0.2.3"), "example.com").await,
            SpfResult::TempError
        );

        resolver.fail("example.com", DnsError::Timeout);
        assert_eq!(
            check(&spf, ip("192.0.2.3"), "example.com").await,
            SpfResult::TempError
        );
    }

    #[tokio::test]
    async fn test_redirect() {
        let resolver = StaticResolver::new();
        resolver.add_txt("example.com", "v=spf1 redirect=_spf.example.com");
        resolver.add_txt("_spf.example.com", "v=spf1 ip4:192.0.2.0/28 -all");
        resolver.add_txt("dangling.example", "v=spf1 redirect=nowhere.example");
        let spf = verifier(&resolver);

        assert_eq!(check(&spf, ip("192.0.2.4"), "example.com").await, SpfResult::Pass);
        assert_eq!(check(&spf, ip("192.0.2.99"), "example.com").await, SpfResult::Fail);
        assert_eq!(
            check(&spf, ip("192.0.2.4"), "dangling.example").await,
            SpfResult::PermError
        );
    }

    #[tokio::test]
    async fn test_exists_with_macros() {
        let resolver = StaticResolver::new();
        resolver.add_txt("example.com", "v=spf1 exists:%{ir}.%{l1r-}.allow.example.com -all");
        resolver.add_ip("5.113.0.203.alice.allow.example.com", ip("127.0.0.2"));
        let spf = verifier(&resolver);
        let sender = EmailAddress::new("alice", "example.com");

        let (result, domain) = spf
            .verify(&ctx(), Some(&sender), "mail.example.com", ip("203.0.113.5"))
            .await;
        assert_eq!(result, SpfResult::Pass);
        assert_eq!(domain.as_deref(), Some("example.com"));

        let (result, _) = spf
            .verify(&ctx(), Some(&sender), "mail.example.com", ip("203.0.113.6"))
            .await;
        assert_eq!(result, SpfResult::Fail);
    }

    #[tokio::test]
    async fn test_null_sender_uses_helo() {
        let resolver = StaticResolver::new();
        resolver.add_txt("mx.example.org", "v=spf1 ip4:192.0.2.25 -all");
        let spf = verifier(&resolver);

        let (result, domain) = spf.verify(&ctx(), None, "mx.example.org", ip("192.0.2.25")).await;
        assert_eq!(result, SpfResult::Pass);
        assert_eq!(domain.as_deref(), Some("mx.example.org"));

        let (result, domain) = spf.verify(&ctx(), None, "localhost", ip("192.0.2.25")).await;
        assert_eq!(result, SpfResult::None);
        assert_eq!(domain, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_temperror() {
        let resolver = StaticResolver::new().with_delay(Duration::from_secs(30));
        resolver.add_txt("example.com", "v=spf1 -all");
        let spf = verifier(&resolver);
        let ctx = CheckContext::new(Duration::from_secs(1));

        assert_eq!(
            spf.check(
                &ctx,
                ip("192.0.2.1"),
                "example.com",
                "postmaster@example.com",
                "mx.example.net",
            )
            .await,
            SpfResult::TempError
        );
    }
}
