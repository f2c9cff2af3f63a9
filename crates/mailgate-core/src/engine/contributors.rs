//! Built-in contributors, in the order the engine runs them

use super::contributor::{CheckMode, Contribution, Contributor, Outcomes, Scoring, Signal};
use crate::context::CheckContext;
use crate::email_auth::domain::is_fqdn;
use crate::email_auth::{
    DkimResult, DkimVerifier, DmarcPolicy, DmarcResult, DmarcVerifier, SpfResult, SpfVerifier,
};
use crate::gate::{GreylistDecision, GreylistStore, RateKey, RateLimiter};
use async_trait::async_trait;
use mailgate_common::config::ScoreWeights;
use mailgate_common::{CheckRequest, Decision};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Token buckets per connecting IP, then per authenticated identity
pub struct RateLimitGate {
    limiter: Arc<RateLimiter>,
    score: i32,
}

impl RateLimitGate {
    pub fn new(limiter: Arc<RateLimiter>, score: i32) -> Self {
        Self { limiter, score }
    }
}

#[async_trait]
impl Contributor for RateLimitGate {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn evaluate(
        &self,
        _ctx: &CheckContext,
        req: &CheckRequest,
        _prior: &Outcomes,
        _scoring: Scoring<'_>,
    ) -> Contribution {
        if !self.limiter.consume(RateKey::Ip(req.client_ip), 1.0).allowed {
            return Contribution::hard(
                Decision::Reject,
                self.score,
                "rate limit exceeded for client IP",
            );
        }
        if let Some(identity) = &req.authenticated_as {
            let key = RateKey::Identity(identity.to_lowercase());
            if !self.limiter.consume(key, 1.0).allowed {
                return Contribution::hard(
                    Decision::Reject,
                    self.score,
                    "rate limit exceeded for authenticated sender",
                );
            }
        }
        Contribution::none()
    }
}

/// Defers first attempts of unknown tuples
pub struct GreylistGate {
    store: Arc<GreylistStore>,
    score: i32,
}

impl GreylistGate {
    pub fn new(store: Arc<GreylistStore>, score: i32) -> Self {
        Self { store, score }
    }
}

#[async_trait]
impl Contributor for GreylistGate {
    fn name(&self) -> &'static str {
        "greylist"
    }

    async fn evaluate(
        &self,
        _ctx: &CheckContext,
        req: &CheckRequest,
        _prior: &Outcomes,
        _scoring: Scoring<'_>,
    ) -> Contribution {
        match self.store.check(req) {
            (GreylistDecision::Defer, _) => {
                Contribution::hard(Decision::GreylistDefer, self.score, "greylisted, retry later")
            }
            (GreylistDecision::Pass, _) => Contribution::none(),
        }
    }
}

pub struct SpfContributor {
    verifier: SpfVerifier,
}

impl SpfContributor {
    pub fn new(verifier: SpfVerifier) -> Self {
        Self { verifier }
    }
}

fn spf_weight(result: SpfResult, weights: &ScoreWeights) -> i32 {
    match result {
        SpfResult::Pass => weights.spf_pass,
        SpfResult::Fail => weights.spf_fail,
        SpfResult::SoftFail => weights.spf_softfail,
        SpfResult::Neutral => weights.spf_neutral,
        SpfResult::None => weights.spf_none,
        SpfResult::TempError => weights.spf_temperror,
        SpfResult::PermError => weights.spf_permerror,
    }
}

#[async_trait]
impl Contributor for SpfContributor {
    fn name(&self) -> &'static str {
        "spf"
    }

    async fn evaluate(
        &self,
        ctx: &CheckContext,
        req: &CheckRequest,
        _prior: &Outcomes,
        scoring: Scoring<'_>,
    ) -> Contribution {
        let (result, domain) = self
            .verifier
            .verify(ctx, req.mail_from.as_ref(), &req.helo, req.client_ip)
            .await;

        let reason = match &domain {
            Some(d) => format!("SPF {} for {}", result.as_header_value(), d),
            None => format!("SPF {}", result.as_header_value()),
        };
        Contribution::score(spf_weight(result, scoring.weights), reason)
            .with_signal(Signal::Spf { result, domain })
    }
}

pub struct DkimContributor {
    verifier: DkimVerifier,
}

impl DkimContributor {
    pub fn new(verifier: DkimVerifier) -> Self {
        Self { verifier }
    }
}

fn dkim_weight(result: DkimResult, weights: &ScoreWeights) -> i32 {
    match result {
        DkimResult::Pass => weights.dkim_pass,
        DkimResult::Fail => weights.dkim_fail,
        DkimResult::None => weights.dkim_none,
        DkimResult::TempError => weights.dkim_temperror,
        DkimResult::PermError => weights.dkim_permerror,
    }
}

#[async_trait]
impl Contributor for DkimContributor {
    fn name(&self) -> &'static str {
        "dkim"
    }

    async fn evaluate(
        &self,
        ctx: &CheckContext,
        req: &CheckRequest,
        _prior: &Outcomes,
        scoring: Scoring<'_>,
    ) -> Contribution {
        let outcome = self.verifier.verify(ctx, &req.headers, &req.body).await;
        let reason = match &outcome.domain {
            Some(d) => format!("DKIM {} for {}", outcome.result.as_header_value(), d),
            None => format!("DKIM {}", outcome.result.as_header_value()),
        };
        Contribution::score(dkim_weight(outcome.result, scoring.weights), reason)
            .with_signal(Signal::Dkim(outcome))
    }
}

/// Evaluates the From domain's policy against the SPF and DKIM outcomes
/// recorded before it
pub struct DmarcContributor {
    verifier: DmarcVerifier,
}

impl DmarcContributor {
    pub fn new(verifier: DmarcVerifier) -> Self {
        Self { verifier }
    }
}

fn dmarc_weight(result: DmarcResult, weights: &ScoreWeights) -> i32 {
    match result {
        DmarcResult::Pass => weights.dmarc_pass,
        // No published policy carries no penalty
        DmarcResult::None => 0,
        DmarcResult::Fail(DmarcPolicy::None) => weights.dmarc_fail_none,
        DmarcResult::Fail(DmarcPolicy::Quarantine) => weights.dmarc_fail_quarantine,
        DmarcResult::Fail(DmarcPolicy::Reject) => weights.dmarc_fail_reject,
        DmarcResult::TempError => weights.dmarc_temperror,
        DmarcResult::PermError => weights.dmarc_permerror,
    }
}

#[async_trait]
impl Contributor for DmarcContributor {
    fn name(&self) -> &'static str {
        "dmarc"
    }

    async fn evaluate(
        &self,
        ctx: &CheckContext,
        req: &CheckRequest,
        prior: &Outcomes,
        scoring: Scoring<'_>,
    ) -> Contribution {
        let from_domain = match (req.from_header_domain(), scoring.mode) {
            (Some(domain), _) => domain,
            (None, CheckMode::Legacy) => match &req.mail_from {
                Some(addr) => addr.domain.clone(),
                None => return Contribution::none(),
            },
            (None, CheckMode::Standard) => {
                return Contribution::score(
                    scoring.weights.missing_from_header,
                    "missing From header",
                );
            }
        };

        let dkim = prior.auth.dkim_outcome();
        let outcome = self
            .verifier
            .evaluate(
                ctx,
                &from_domain,
                prior.auth.spf_result(),
                prior.auth.spf_domain.as_deref(),
                &dkim,
            )
            .await;

        let delta = dmarc_weight(outcome.result, scoring.weights);
        let reason = match outcome.result {
            DmarcResult::Fail(policy) => {
                format!("DMARC fail for {} (p={})", from_domain, policy.as_str())
            }
            result => format!("DMARC {} for {}", result.as_header_value(), from_domain),
        };
        Contribution::score(delta, reason).with_signal(Signal::Dmarc { outcome, from_domain })
    }
}

/// HELO/EHLO sanity heuristic
pub struct HeloContributor;

/// Whether the HELO name looks forged or lazy
///
/// Empty names, `localhost`, names without a dot and address literals that
/// do not match the connecting IP are suspicious.
pub fn is_suspicious_helo(helo: &str, client_ip: IpAddr) -> bool {
    let helo = helo.trim().trim_end_matches('.');
    if helo.is_empty()
        || helo.eq_ignore_ascii_case("localhost")
        || helo.eq_ignore_ascii_case("localhost.localdomain")
    {
        return true;
    }

    let literal = helo.strip_prefix('[').and_then(|h| h.strip_suffix(']'));
    if let Some(literal) = literal {
        let literal = literal
            .get(..5)
            .filter(|tag| tag.eq_ignore_ascii_case("ipv6:"))
            .map(|_| &literal[5..])
            .unwrap_or(literal);
        return match literal.parse::<IpAddr>() {
            Ok(ip) => canonical(ip) != canonical(client_ip),
            Err(_) => true,
        };
    }

    if let Ok(ip) = helo.parse::<IpAddr>() {
        return canonical(ip) != canonical(client_ip);
    }

    !is_fqdn(helo)
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

#[async_trait]
impl Contributor for HeloContributor {
    fn name(&self) -> &'static str {
        "helo"
    }

    async fn evaluate(
        &self,
        _ctx: &CheckContext,
        req: &CheckRequest,
        _prior: &Outcomes,
        scoring: Scoring<'_>,
    ) -> Contribution {
        if is_suspicious_helo(&req.helo, req.client_ip) {
            debug!("Suspicious HELO {:?} from {}", req.helo, req.client_ip);
            Contribution::score(
                scoring.weights.helo_suspicious,
                format!("suspicious HELO {:?}", req.helo),
            )
            .with_signal(Signal::SuspiciousHelo)
        } else {
            Contribution::none()
        }
    }
}
