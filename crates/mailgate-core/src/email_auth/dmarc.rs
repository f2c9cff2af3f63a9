//! DMARC (Domain-based Message Authentication, Reporting, and Conformance) verification
//!
//! Implements RFC 7489 - Domain-based Message Authentication, Reporting, and Conformance

use super::dkim::DkimOutcome;
use super::dns::{DnsError, DnsResolver};
use super::domain::{normalize, organizational_domain};
use super::spf::SpfResult;
use crate::context::CheckContext;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// DMARC policy action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmarcPolicy {
    /// No policy (monitor mode)
    #[default]
    None,
    /// Quarantine messages (move to spam)
    Quarantine,
    /// Reject messages
    Reject,
}

impl DmarcPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmarcPolicy::None => "none",
            DmarcPolicy::Quarantine => "quarantine",
            DmarcPolicy::Reject => "reject",
        }
    }
}

/// DMARC verification result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmarcResult {
    /// DMARC check passed
    Pass,
    /// DMARC check failed with specified policy
    Fail(DmarcPolicy),
    /// No DMARC record found
    None,
    /// Temporary error
    TempError,
    /// Permanent error
    PermError,
}

impl DmarcResult {
    /// Convert to header value for Authentication-Results
    pub fn as_header_value(&self) -> &'static str {
        match self {
            DmarcResult::Pass => "pass",
            DmarcResult::Fail(_) => "fail",
            DmarcResult::None => "none",
            DmarcResult::TempError => "temperror",
            DmarcResult::PermError => "permerror",
        }
    }

    /// Get the policy for failed DMARC
    pub fn policy(&self) -> Option<DmarcPolicy> {
        match self {
            DmarcResult::Fail(policy) => Some(*policy),
            _ => None,
        }
    }
}

/// Result of evaluating a message against the From domain's policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmarcOutcome {
    pub result: DmarcResult,
    /// Policy in force for the From domain (`sp=` for subdomains when set)
    pub policy: DmarcPolicy,
    pub spf_aligned: bool,
    pub dkim_aligned: bool,
}

impl DmarcOutcome {
    fn without_record(result: DmarcResult) -> Self {
        Self {
            result,
            policy: DmarcPolicy::None,
            spf_aligned: false,
            dkim_aligned: false,
        }
    }

    /// Either identifier aligned with the From domain
    pub fn aligned(&self) -> bool {
        self.spf_aligned || self.dkim_aligned
    }
}

/// Parsed DMARC record
#[derive(Debug, Clone)]
pub struct DmarcRecord {
    /// Policy for messages from the domain (p=)
    pub policy: DmarcPolicy,
    /// Policy for subdomains (sp=)
    pub subdomain_policy: Option<DmarcPolicy>,
    /// Percentage of messages to apply policy (pct=)
    pub percentage: u8,
    /// DKIM alignment mode (adkim=)
    pub dkim_alignment: AlignmentMode,
    /// SPF alignment mode (aspf=)
    pub spf_alignment: AlignmentMode,
    /// Aggregate report URI (rua=)
    pub aggregate_report_uri: Option<String>,
    /// Forensic report URI (ruf=)
    pub forensic_report_uri: Option<String>,
    /// Failure reporting options (fo=)
    pub failure_options: String,
    /// Report format (rf=)
    pub report_format: String,
    /// Report interval in seconds (ri=)
    pub report_interval: u32,
}

impl Default for DmarcRecord {
    fn default() -> Self {
        Self {
            policy: DmarcPolicy::None,
            subdomain_policy: None,
            percentage: 100,
            dkim_alignment: AlignmentMode::Relaxed,
            spf_alignment: AlignmentMode::Relaxed,
            aggregate_report_uri: None,
            forensic_report_uri: None,
            failure_options: "0".to_string(),
            report_format: "afrf".to_string(),
            report_interval: 86400,
        }
    }
}

/// Alignment mode for DKIM/SPF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentMode {
    /// Strict: domains must match exactly
    Strict,
    /// Relaxed: organizational domains must match
    #[default]
    Relaxed,
}

/// Where the applicable record was published
enum RecordSource {
    Exact,
    Organizational,
}

/// DMARC verifier
pub struct DmarcVerifier {
    resolver: Arc<dyn DnsResolver>,
}

impl DmarcVerifier {
    /// Create a new DMARC verifier
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self { resolver }
    }

    /// Evaluate DMARC for a message
    ///
    /// # Arguments
    /// * `from_domain` - Domain from the From header
    /// * `spf_result` - Result of the SPF check
    /// * `spf_domain` - Domain the SPF check was evaluated for
    /// * `dkim` - Outcome of DKIM verification
    pub async fn evaluate(
        &self,
        ctx: &CheckContext,
        from_domain: &str,
        spf_result: SpfResult,
        spf_domain: Option<&str>,
        dkim: &DkimOutcome,
    ) -> DmarcOutcome {
        let from_domain = normalize(from_domain);

        let (record, source) = match self.fetch_dmarc_record(ctx, &from_domain).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!("No DMARC record found for {}", from_domain);
                return DmarcOutcome::without_record(DmarcResult::None);
            }
            Err(result) => return DmarcOutcome::without_record(result),
        };

        debug!("Found DMARC record for {}: {:?}", from_domain, record);

        let policy = match source {
            RecordSource::Organizational => record.subdomain_policy.unwrap_or(record.policy),
            RecordSource::Exact => record.policy,
        };

        // Check SPF alignment
        let spf_aligned = spf_result == SpfResult::Pass
            && spf_domain.is_some_and(|d| check_alignment(&from_domain, d, record.spf_alignment));

        // Check DKIM alignment
        let dkim_aligned = dkim.is_valid()
            && dkim
                .domain
                .as_deref()
                .is_some_and(|d| check_alignment(&from_domain, d, record.dkim_alignment));

        // DMARC passes if either SPF or DKIM is aligned
        let result = if spf_aligned || dkim_aligned {
            debug!(
                "DMARC pass for {}: SPF aligned={}, DKIM aligned={}",
                from_domain, spf_aligned, dkim_aligned
            );
            DmarcResult::Pass
        } else {
            debug!(
                "DMARC fail for {}: SPF aligned={}, DKIM aligned={}, policy={:?}",
                from_domain, spf_aligned, dkim_aligned, policy
            );
            DmarcResult::Fail(policy)
        };

        DmarcOutcome {
            result,
            policy,
            spf_aligned,
            dkim_aligned,
        }
    }

    /// Fetch the DMARC record for a domain, falling back to its
    /// organizational domain
    async fn fetch_dmarc_record(
        &self,
        ctx: &CheckContext,
        domain: &str,
    ) -> Result<Option<(DmarcRecord, RecordSource)>, DmarcResult> {
        if let Some(record) = self.lookup_record(ctx, domain).await? {
            return Ok(Some((record, RecordSource::Exact)));
        }

        let org_domain = organizational_domain(domain);
        if org_domain != domain {
            if let Some(record) = self.lookup_record(ctx, &org_domain).await? {
                return Ok(Some((record, RecordSource::Organizational)));
            }
        }

        Ok(None)
    }

    async fn lookup_record(
        &self,
        ctx: &CheckContext,
        domain: &str,
    ) -> Result<Option<DmarcRecord>, DmarcResult> {
        let dmarc_domain = format!("_dmarc.{}", domain);

        let txts = match ctx.resolve(self.resolver.lookup_txt(&dmarc_domain)).await {
            Ok(txts) => txts,
            Err(DnsError::NotFound) => return Ok(None),
            Err(e) => {
                warn!("Failed to fetch DMARC record {}: {}", dmarc_domain, e);
                return Err(DmarcResult::TempError);
            }
        };

        let candidates: Vec<&String> = txts
            .iter()
            .filter(|txt| {
                txt.trim_start()
                    .get(..8)
                    .is_some_and(|v| v.eq_ignore_ascii_case("v=DMARC1"))
            })
            .collect();

        match candidates.as_slice() {
            [] => Ok(None),
            [txt] => parse_dmarc_record(txt).map(Some).map_err(|e| {
                warn!("Malformed DMARC record at {}: {}", dmarc_domain, e);
                DmarcResult::PermError
            }),
            _ => {
                // RFC 7489 6.6.3: multiple records means no policy
                debug!("Multiple DMARC records at {}", dmarc_domain);
                Ok(None)
            }
        }
    }
}

/// Parse DMARC record from TXT value
fn parse_dmarc_record(txt: &str) -> Result<DmarcRecord> {
    let mut record = DmarcRecord::default();

    // Parse tags
    let tags = parse_tags(txt)?;

    // Version (required)
    if tags.get("v").map(String::as_str) != Some("DMARC1") {
        return Err(anyhow!("Invalid DMARC version"));
    }

    // Policy (required)
    if let Some(p) = tags.get("p") {
        record.policy = parse_policy(p)?;
    } else {
        return Err(anyhow!("Missing required p= tag"));
    }

    // Subdomain policy
    if let Some(sp) = tags.get("sp") {
        record.subdomain_policy = Some(parse_policy(sp)?);
    }

    // Percentage
    if let Some(pct) = tags.get("pct") {
        record.percentage = pct
            .parse()
            .ok()
            .filter(|p| *p <= 100)
            .ok_or_else(|| anyhow!("Invalid pct value: {}", pct))?;
    }

    // DKIM alignment
    if let Some(adkim) = tags.get("adkim") {
        record.dkim_alignment = parse_alignment(adkim)?;
    }

    // SPF alignment
    if let Some(aspf) = tags.get("aspf") {
        record.spf_alignment = parse_alignment(aspf)?;
    }

    // Report URIs
    record.aggregate_report_uri = tags.get("rua").cloned();
    record.forensic_report_uri = tags.get("ruf").cloned();

    if let Some(fo) = tags.get("fo") {
        record.failure_options = fo.clone();
    }
    if let Some(rf) = tags.get("rf") {
        record.report_format = rf.clone();
    }

    // Report interval
    if let Some(ri) = tags.get("ri") {
        record.report_interval = ri
            .parse()
            .map_err(|_| anyhow!("Invalid ri value: {}", ri))?;
    }

    Ok(record)
}

/// Parse DMARC tags
fn parse_tags(txt: &str) -> Result<HashMap<String, String>> {
    let mut tags = HashMap::new();

    for part in txt.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, value) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("Malformed DMARC tag: {}", part))?;
        tags.insert(name.trim().to_lowercase(), value.trim().to_string());
    }

    Ok(tags)
}

/// Parse DMARC policy
fn parse_policy(s: &str) -> Result<DmarcPolicy> {
    match s.to_lowercase().as_str() {
        "none" => Ok(DmarcPolicy::None),
        "quarantine" => Ok(DmarcPolicy::Quarantine),
        "reject" => Ok(DmarcPolicy::Reject),
        _ => Err(anyhow!("Invalid policy: {}", s)),
    }
}

/// Parse alignment mode
fn parse_alignment(s: &str) -> Result<AlignmentMode> {
    match s.to_lowercase().as_str() {
        "r" => Ok(AlignmentMode::Relaxed),
        "s" => Ok(AlignmentMode::Strict),
        _ => Err(anyhow!("Invalid alignment mode: {}", s)),
    }
}

/// Check if two domains are aligned
fn check_alignment(from_domain: &str, auth_domain: &str, mode: AlignmentMode) -> bool {
    let from_domain = normalize(from_domain);
    let auth_domain = normalize(auth_domain);

    match mode {
        AlignmentMode::Strict => from_domain == auth_domain,
        AlignmentMode::Relaxed => {
            organizational_domain(&from_domain) == organizational_domain(&auth_domain)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email_auth::dkim::DkimResult;
    use crate::email_auth::dns::StaticResolver;
    use std::time::Duration;

    fn ctx() -> CheckContext {
        CheckContext::new(Duration::from_secs(5))
    }

    fn dkim(result: DkimResult, domain: &str) -> DkimOutcome {
        DkimOutcome {
            result,
            domain: Some(domain.to_string()),
            selector: Some("sel1".to_string()),
        }
    }

    #[test]
    fn test_parse_dmarc_record() {
        let txt = "v=DMARC1; p=reject; sp=quarantine; pct=50; adkim=s; aspf=r; rua=mailto:agg@example.com; ri=3600";
        let record = parse_dmarc_record(txt).unwrap();

        assert_eq!(record.policy, DmarcPolicy::Reject);
        assert_eq!(record.subdomain_policy, Some(DmarcPolicy::Quarantine));
        assert_eq!(record.percentage, 50);
        assert_eq!(record.dkim_alignment, AlignmentMode::Strict);
        assert_eq!(record.spf_alignment, AlignmentMode::Relaxed);
        assert_eq!(record.aggregate_report_uri.as_deref(), Some("mailto:agg@example.com"));
        assert_eq!(record.report_interval, 3600);
    }

    #[test]
    fn test_parse_dmarc_record_errors() {
        assert!(parse_dmarc_record("v=DMARC1").is_err());
        assert!(parse_dmarc_record("v=DMARC2; p=none").is_err());
        assert!(parse_dmarc_record("v=DMARC1; p=block").is_err());
        assert!(parse_dmarc_record("v=DMARC1; p=none; pct=150").is_err());
        assert!(parse_dmarc_record("v=DMARC1; p=none; adkim=x").is_err());
    }

    #[test]
    fn test_check_alignment_strict() {
        assert!(check_alignment(
            "example.com",
            "example.com",
            AlignmentMode::Strict
        ));
        assert!(!check_alignment(
            "mail.example.com",
            "example.com",
            AlignmentMode::Strict
        ));
    }

    #[test]
    fn test_check_alignment_relaxed() {
        assert!(check_alignment(
            "example.com",
            "mail.example.com",
            AlignmentMode::Relaxed
        ));
        assert!(check_alignment(
            "news.example.co.uk",
            "bounce.example.co.uk",
            AlignmentMode::Relaxed
        ));
        assert!(!check_alignment(
            "example.co.uk",
            "other.co.uk",
            AlignmentMode::Relaxed
        ));
    }

    #[tokio::test]
    async fn test_no_record_is_none() {
        let verifier = DmarcVerifier::new(Arc::new(StaticResolver::new()));
        let outcome = verifier
            .evaluate(
                &ctx(),
                "example.com",
                SpfResult::Fail,
                Some("example.com"),
                &DkimOutcome::unsigned(),
            )
            .await;

        assert_eq!(outcome.result, DmarcResult::None);
        assert!(!outcome.aligned());
    }

    #[tokio::test]
    async fn test_spf_alignment_passes() {
        let resolver = StaticResolver::new();
        resolver.add_txt("_dmarc.example.com", "v=DMARC1; p=reject");
        let verifier = DmarcVerifier::new(Arc::new(resolver));

        let outcome = verifier
            .evaluate(
                &ctx(),
                "example.com",
                SpfResult::Pass,
                Some("bounces.example.com"),
                &DkimOutcome::unsigned(),
            )
            .await;
        assert_eq!(outcome.result, DmarcResult::Pass);
        assert!(outcome.spf_aligned);
        assert!(!outcome.dkim_aligned);
        assert_eq!(outcome.policy, DmarcPolicy::Reject);
    }

    #[tokio::test]
    async fn test_dkim_alignment_passes() {
        let resolver = StaticResolver::new();
        resolver.add_txt("_dmarc.example.com", "v=DMARC1; p=quarantine; adkim=s");
        let verifier = DmarcVerifier::new(Arc::new(resolver));

        let outcome = verifier
            .evaluate(
                &ctx(),
                "example.com",
                SpfResult::Fail,
                Some("elsewhere.net"),
                &dkim(DkimResult::Pass, "example.com"),
            )
            .await;
        assert_eq!(outcome.result, DmarcResult::Pass);
        assert!(outcome.dkim_aligned);

        let outcome = verifier
            .evaluate(
                &ctx(),
                "example.com",
                SpfResult::Fail,
                Some("elsewhere.net"),
                &dkim(DkimResult::Pass, "mail.example.com"),
            )
            .await;
        assert_eq!(outcome.result, DmarcResult::Fail(DmarcPolicy::Quarantine));
    }

    #[tokio::test]
    async fn test_unaligned_fails_with_policy() {
        let resolver = StaticResolver::new();
        resolver.add_txt("_dmarc.example.com", "v=DMARC1; p=reject");
        let verifier = DmarcVerifier::new(Arc::new(resolver));

        // A failing DKIM signature from the right domain does not align
        let outcome = verifier
            .evaluate(
                &ctx(),
                "example.com",
                SpfResult::Pass,
                Some("attacker.example"),
                &dkim(DkimResult::Fail, "example.com"),
            )
            .await;
        assert_eq!(outcome.result, DmarcResult::Fail(DmarcPolicy::Reject));
        assert_eq!(outcome.result.policy(), Some(DmarcPolicy::Reject));
    }

    #[tokio::test]
    async fn test_subdomain_policy_from_organizational_record() {
        let resolver = StaticResolver::new();
        resolver.add_txt("_dmarc.example.com", "v=DMARC1; p=reject; sp=quarantine");
        let verifier = DmarcVerifier::new(Arc::new(resolver));

        let outcome = verifier
            .evaluate(&ctx(), "news.example.com", SpfResult::None, None, &DkimOutcome::unsigned())
            .await;
        assert_eq!(outcome.result, DmarcResult::Fail(DmarcPolicy::Quarantine));

        let outcome = verifier
            .evaluate(&ctx(), "example.com", SpfResult::None, None, &DkimOutcome::unsigned())
            .await;
        assert_eq!(outcome.result, DmarcResult::Fail(DmarcPolicy::Reject));
    }

    #[tokio::test]
    async fn test_malformed_record_is_permerror() {
        let resolver = StaticResolver::new();
        resolver.add_txt("_dmarc.example.com", "v=DMARC1; p=sometimes");
        let verifier = DmarcVerifier::new(Arc::new(resolver));

        let outcome = verifier
            .evaluate(
                &ctx(),
                "example.com",
                SpfResult::Pass,
                Some("example.com"),
                &DkimOutcome::unsigned(),
            )
            .await;
        assert_eq!(outcome.result, DmarcResult::PermError);
    }

    #[tokio::test]
    async fn test_dns_failure_is_temperror() {
        let resolver = StaticResolver::new();
        resolver.fail("_dmarc.example.com", DnsError::Failure("SERVFAIL".into()));
        let verifier = DmarcVerifier::new(Arc::new(resolver));

        let outcome = verifier
            .evaluate(
                &ctx(),
                "example.com",
                SpfResult::Pass,
                Some("example.com"),
                &DkimOutcome::unsigned(),
            )
            .await;
        assert_eq!(outcome.result, DmarcResult::TempError);
    }
}
