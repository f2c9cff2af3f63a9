//! Per-check execution context

use crate::email_auth::dns::DnsError;
use mailgate_common::config::MAX_DURATION_SECS;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation shared by every lookup of one check
#[derive(Debug, Clone)]
pub struct CheckContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl CheckContext {
    /// Context expiring `timeout` from now
    ///
    /// Timeouts too large to represent are capped at the maximum configurable
    /// duration.
    pub fn new(timeout: Duration) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(MAX_DURATION_SECS));
        Self::with_deadline(deadline)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the context to an externally owned token, e.g. the SMTP session's
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Run a DNS lookup, giving up at the deadline or on cancellation
    pub async fn resolve<T, F>(&self, lookup: F) -> Result<T, DnsError>
    where
        F: Future<Output = Result<T, DnsError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(DnsError::Cancelled);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(DnsError::Cancelled),
            result = tokio::time::timeout_at(self.deadline, lookup) => {
                result.unwrap_or(Err(DnsError::Timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_resolve_times_out_at_deadline() {
        let ctx = CheckContext::new(Duration::from_millis(100));
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, DnsError>(1)
        };
        assert_eq!(ctx.resolve(slow).await, Err(DnsError::Timeout));
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_resolve_cancelled() {
        let token = CancellationToken::new();
        let ctx = CheckContext::new(Duration::from_secs(5)).with_cancellation(token.clone());
        token.cancel();
        assert_eq!(
            ctx.resolve(async { Ok::<_, DnsError>(1) }).await,
            Err(DnsError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_huge_timeout_does_not_overflow() {
        let ctx = CheckContext::new(Duration::MAX);
        assert!(!ctx.is_done());
        assert_eq!(ctx.resolve(async { Ok::<_, DnsError>(3) }).await, Ok(3));
    }

    #[tokio::test]
    async fn test_resolve_passes_through() {
        let ctx = CheckContext::new(Duration::from_secs(5));
        assert_eq!(ctx.resolve(async { Ok::<_, DnsError>(7) }).await, Ok(7));
    }
}
