//! Decision engine
//!
//! The engine runs its contributors in a fixed order against one
//! [`CheckRequest`]: the rate-limit and greylist gates first, then SPF, DKIM,
//! DMARC and the HELO heuristic, then any registered extra contributors.
//! Gates may end the check with a hard decision; everything else adds to a
//! score that is clamped into 0..=100 and compared against the configured
//! thresholds.
//!
//! Failures inside a check never surface as errors. A lookup that times out
//! or a record that cannot be parsed degrades into a small score penalty and
//! is counted in the checker error metric.

pub mod contributor;
pub mod contributors;

pub use contributor::{CheckMode, Contribution, Contributor, Outcomes, Scoring, Signal};
pub use contributors::{
    is_suspicious_helo, DkimContributor, DmarcContributor, GreylistGate, HeloContributor,
    RateLimitGate, SpfContributor,
};

use crate::context::CheckContext;
use crate::email_auth::{
    DkimSigner, DkimSigningConfig, DkimVerifier, DmarcVerifier, DnsResolver, SpfVerifier,
    TrustDnsResolver,
};
use crate::gate::{GreylistStore, RateLimiter};
use crate::metrics::EngineMetrics;
use mailgate_common::config::{Config, ScoringConfig};
use mailgate_common::types::clamp_score;
use mailgate_common::{CheckRequest, CheckResult, Decision, Error};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Builder for [`Engine`]
///
/// Stores and the resolver default to fresh instances built from the
/// configuration; tests and embedders inject their own.
pub struct EngineBuilder {
    config: Config,
    resolver: Option<Arc<dyn DnsResolver>>,
    greylist: Option<Arc<GreylistStore>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    metrics: Option<EngineMetrics>,
    extra: Vec<Arc<dyn Contributor>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            resolver: None,
            greylist: None,
            rate_limiter: None,
            metrics: None,
            extra: Vec::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DnsResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_greylist(mut self, store: Arc<GreylistStore>) -> Self {
        self.greylist = Some(store);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a contributor that runs after the built-in ones
    pub fn with_contributor(mut self, contributor: Arc<dyn Contributor>) -> Self {
        self.extra.push(contributor);
        self
    }

    pub fn build(self) -> mailgate_common::Result<Engine> {
        let config = self.config;
        config.validate()?;

        let signer = match &config.dkim_signing {
            Some(settings) => {
                let signer = DkimSigner::new(DkimSigningConfig::from_settings(settings)?)?;
                info!(
                    "DKIM signing enabled for {} with selector {}",
                    signer.domain(),
                    signer.selector()
                );
                Some(signer)
            }
            None => None,
        };

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(TrustDnsResolver::new(&config.dns)) as Arc<dyn DnsResolver>,
        };
        let greylist = self
            .greylist
            .unwrap_or_else(|| Arc::new(GreylistStore::new(&config.greylist)));
        let rate_limiter = self
            .rate_limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::new(&config.rate_limit)));
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => EngineMetrics::new()
                .map_err(|e| Error::Internal(format!("Failed to register metrics: {}", e)))?,
        };

        let scoring = config.scoring;
        let mut contributors: Vec<Arc<dyn Contributor>> = vec![
            Arc::new(RateLimitGate::new(rate_limiter.clone(), scoring.rate_limit_score)),
            Arc::new(GreylistGate::new(greylist.clone(), scoring.greylist_score)),
            Arc::new(SpfContributor::new(
                SpfVerifier::new(resolver.clone()).with_max_dns_lookups(config.spf.max_dns_lookups),
            )),
            Arc::new(DkimContributor::new(DkimVerifier::new(resolver.clone()))),
            Arc::new(DmarcContributor::new(DmarcVerifier::new(resolver))),
            Arc::new(HeloContributor),
        ];
        contributors.extend(self.extra);

        debug!(
            "Engine built with contributors: {}",
            contributors.iter().map(|c| c.name()).collect::<Vec<_>>().join(", ")
        );

        Ok(Engine {
            contributors,
            scoring,
            check_timeout: Duration::from_millis(config.dns.check_timeout_ms),
            hostname: config.server.hostname,
            signer,
            greylist,
            rate_limiter,
            metrics,
        })
    }
}

/// Anti-abuse decision engine
///
/// Shared by every SMTP session; all state lives in the concurrent stores.
pub struct Engine {
    contributors: Vec<Arc<dyn Contributor>>,
    scoring: ScoringConfig,
    check_timeout: Duration,
    hostname: String,
    signer: Option<DkimSigner>,
    greylist: Arc<GreylistStore>,
    rate_limiter: Arc<RateLimiter>,
    metrics: EngineMetrics,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Context carrying the configured per-check deadline
    pub fn new_context(&self) -> CheckContext {
        CheckContext::new(self.check_timeout)
    }

    /// Evaluate a message with the full weight set
    pub async fn check(&self, ctx: &CheckContext, req: &CheckRequest) -> CheckResult {
        self.run(ctx, req, CheckMode::Standard).await
    }

    /// Evaluate a message for callers that only supply a minimal header set
    ///
    /// Uses the legacy weights, and DMARC falls back to the envelope sender
    /// domain when the message has no From header.
    pub async fn check_legacy(&self, ctx: &CheckContext, req: &CheckRequest) -> CheckResult {
        self.run(ctx, req, CheckMode::Legacy).await
    }

    async fn run(&self, ctx: &CheckContext, req: &CheckRequest, mode: CheckMode) -> CheckResult {
        let started = Instant::now();
        let scoring = Scoring {
            mode,
            weights: match mode {
                CheckMode::Standard => &self.scoring.weights,
                CheckMode::Legacy => &self.scoring.legacy_weights,
            },
        };

        let mut outcomes = Outcomes::default();
        let mut score: i32 = 0;
        let mut reasons = Vec::new();
        let mut hard = None;

        for contributor in &self.contributors {
            let contribution = contributor.evaluate(ctx, req, &outcomes, scoring).await;

            if let Some(signal) = contribution.signal {
                if signal.is_degraded() {
                    self.metrics.record_checker_error(contributor.name());
                    warn!(
                        "{} check degraded for {} ({:?})",
                        contributor.name(),
                        req.client_ip,
                        signal
                    );
                }
                outcomes.record(signal);
            }
            if let Some(reason) = contribution.reason {
                reasons.push(reason);
            }

            if let Some(decision) = contribution.hard {
                debug!("{} ended the check with {}", contributor.name(), decision);
                score = contribution.delta;
                hard = Some(decision);
                break;
            }
            score = score.saturating_add(contribution.delta);
        }

        let decision = hard.unwrap_or_else(|| self.decide(score));
        let mut result = CheckResult::new(decision, score, reasons);
        result.auth = outcomes.auth.to_summary();

        self.metrics.record_decision(decision, started.elapsed());
        info!(
            "Check {} for {} from {}: {} (score {})",
            result.check_id,
            req.rcpt_to,
            req.client_ip,
            result.decision,
            result.score
        );

        result
    }

    /// Map a raw score onto a decision
    pub fn decide(&self, score: i32) -> Decision {
        let score = i32::from(clamp_score(score));
        if score >= self.scoring.reject_threshold {
            Decision::Reject
        } else if score >= self.scoring.quarantine_threshold {
            Decision::Quarantine
        } else {
            Decision::Accept
        }
    }

    /// Outbound DKIM signer, when `[dkim_signing]` is configured
    pub fn signer(&self) -> Option<&DkimSigner> {
        self.signer.as_ref()
    }

    pub fn greylist(&self) -> &Arc<GreylistStore> {
        &self.greylist
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Host name used as the authserv-id in Authentication-Results
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}
