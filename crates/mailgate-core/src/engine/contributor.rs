//! Scoring contributor capability
//!
//! Every check the engine runs, from the stateful gates to an external virus
//! scanner, implements [`Contributor`]. Contributors run in a fixed order and
//! may read the authentication outcomes recorded by those before them.

use crate::context::CheckContext;
use crate::email_auth::{
    AuthenticationResult, DkimOutcome, DkimResult, DmarcOutcome, DmarcResult, SpfResult,
};
use async_trait::async_trait;
use mailgate_common::config::ScoreWeights;
use mailgate_common::{CheckRequest, Decision};

/// Which scoring profile a check runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    Standard,
    /// Callers that only provide a minimal header set
    Legacy,
}

/// Scoring parameters of the running check
#[derive(Debug, Clone, Copy)]
pub struct Scoring<'a> {
    pub mode: CheckMode,
    pub weights: &'a ScoreWeights,
}

/// Authentication signal a contributor hands to later contributors
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Spf {
        result: SpfResult,
        domain: Option<String>,
    },
    Dkim(DkimOutcome),
    Dmarc {
        outcome: DmarcOutcome,
        from_domain: String,
    },
    SuspiciousHelo,
}

impl Signal {
    /// Whether the underlying check could not complete
    pub fn is_degraded(&self) -> bool {
        match self {
            Signal::Spf { result, .. } => {
                matches!(result, SpfResult::TempError | SpfResult::PermError)
            }
            Signal::Dkim(outcome) => {
                matches!(outcome.result, DkimResult::TempError | DkimResult::PermError)
            }
            Signal::Dmarc { outcome, .. } => {
                matches!(outcome.result, DmarcResult::TempError | DmarcResult::PermError)
            }
            Signal::SuspiciousHelo => false,
        }
    }
}

/// Outcomes recorded so far during one check
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcomes {
    pub auth: AuthenticationResult,
    pub helo_suspicious: bool,
}

impl Outcomes {
    pub fn record(&mut self, signal: Signal) {
        match signal {
            Signal::Spf { result, domain } => {
                self.auth.spf = Some(result);
                self.auth.spf_domain = domain;
            }
            Signal::Dkim(outcome) => self.auth.dkim = Some(outcome),
            Signal::Dmarc { outcome, from_domain } => {
                self.auth.dmarc = Some(outcome);
                self.auth.from_domain = Some(from_domain);
            }
            Signal::SuspiciousHelo => self.helo_suspicious = true,
        }
    }
}

/// What one contributor adds to a check
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contribution {
    /// Score delta; for a hard decision, the score reported with it
    pub delta: i32,
    /// Decision that ends the check immediately
    pub hard: Option<Decision>,
    pub reason: Option<String>,
    pub signal: Option<Signal>,
}

impl Contribution {
    /// Nothing to add
    pub fn none() -> Self {
        Self::default()
    }

    /// Soft score delta; zero deltas carry no reason
    pub fn score(delta: i32, reason: impl Into<String>) -> Self {
        Self {
            delta,
            reason: (delta != 0).then(|| reason.into()),
            ..Self::default()
        }
    }

    /// Short-circuit the check with `decision` reported at `score`
    pub fn hard(decision: Decision, score: i32, reason: impl Into<String>) -> Self {
        Self {
            delta: score,
            hard: Some(decision),
            reason: Some(reason.into()),
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// A scoring step of the engine
#[async_trait]
pub trait Contributor: Send + Sync {
    /// Short name used in logs and metrics labels
    fn name(&self) -> &'static str;

    async fn evaluate(
        &self,
        ctx: &CheckContext,
        req: &CheckRequest,
        prior: &Outcomes,
        scoring: Scoring<'_>,
    ) -> Contribution;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_score_has_no_reason() {
        assert_eq!(Contribution::score(0, "SPF pass"), Contribution::none());
        assert_eq!(
            Contribution::score(10, "SPF softfail").reason.as_deref(),
            Some("SPF softfail")
        );
    }

    #[test]
    fn test_outcomes_record_signals() {
        let mut outcomes = Outcomes::default();
        outcomes.record(Signal::Spf {
            result: SpfResult::Pass,
            domain: Some("example.com".to_string()),
        });
        outcomes.record(Signal::SuspiciousHelo);

        assert_eq!(outcomes.auth.spf, Some(SpfResult::Pass));
        assert_eq!(outcomes.auth.spf_domain.as_deref(), Some("example.com"));
        assert!(outcomes.helo_suspicious);
    }

    #[test]
    fn test_degraded_signals() {
        assert!(Signal::Spf {
            result: SpfResult::TempError,
            domain: None
        }
        .is_degraded());
        assert!(!Signal::Dkim(DkimOutcome::unsigned()).is_degraded());
    }
}
