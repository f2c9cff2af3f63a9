//! Email Authentication Module
//!
//! Provides SPF, DKIM, and DMARC verification for incoming mail
//! and DKIM signing for outgoing mail.

pub mod dkim;
pub mod dmarc;
pub mod dns;
pub mod domain;
pub mod spf;

pub use dkim::{DkimOutcome, DkimResult, DkimSigner, DkimSigningConfig, DkimVerifier};
pub use dmarc::{DmarcOutcome, DmarcPolicy, DmarcResult, DmarcVerifier};
pub use dns::{DnsError, DnsResolver, StaticResolver, TrustDnsResolver};
pub use spf::{SpfResult, SpfVerifier};

use mailgate_common::types::AuthSummary;

/// Authentication outcomes gathered so far during one check
///
/// Filled in as the SPF, DKIM and DMARC contributors run; later
/// contributors read what earlier ones recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationResult {
    pub spf: Option<SpfResult>,
    /// Domain the SPF check was evaluated for
    pub spf_domain: Option<String>,
    pub dkim: Option<DkimOutcome>,
    pub dmarc: Option<DmarcOutcome>,
    /// Domain DMARC was evaluated for
    pub from_domain: Option<String>,
}

impl AuthenticationResult {
    /// Create an empty result
    pub fn new() -> Self {
        Self {
            spf: None,
            spf_domain: None,
            dkim: None,
            dmarc: None,
            from_domain: None,
        }
    }

    pub fn spf_result(&self) -> SpfResult {
        self.spf.unwrap_or(SpfResult::None)
    }

    pub fn dkim_outcome(&self) -> DkimOutcome {
        self.dkim.clone().unwrap_or_else(DkimOutcome::unsigned)
    }

    /// Header tokens for `Authentication-Results`
    pub fn to_summary(&self) -> AuthSummary {
        let dkim = self.dkim_outcome();
        AuthSummary {
            spf: self.spf_result().as_header_value().to_string(),
            spf_domain: self.spf_domain.clone(),
            dkim: dkim.result.as_header_value().to_string(),
            dkim_domain: dkim.domain,
            dmarc: self
                .dmarc
                .map(|d| d.result.as_header_value())
                .unwrap_or("none")
                .to_string(),
            from_domain: self.from_domain.clone(),
        }
    }
}

impl Default for AuthenticationResult {
    fn default() -> Self {
        Self::new()
    }
}
