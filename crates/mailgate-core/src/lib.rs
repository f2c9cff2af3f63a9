//! MailGate Core - Inbound anti-abuse decision engine
//!
//! This crate provides the SPF, DKIM and DMARC checkers, the greylist and
//! rate-limit stores, and the engine that combines them into a single
//! accept/defer/quarantine/reject decision per message.

pub mod context;
pub mod email_auth;
pub mod engine;
pub mod gate;
pub mod metrics;

pub use context::CheckContext;
pub use email_auth::{
    AuthenticationResult, DkimResult, DkimSigner, DkimVerifier, DmarcResult, DmarcVerifier,
    DnsResolver, SpfResult, SpfVerifier, StaticResolver, TrustDnsResolver,
};
pub use engine::{CheckMode, Contribution, Contributor, Engine, EngineBuilder, Outcomes, Scoring};
pub use gate::{GreylistStore, RateLimiter};
pub use metrics::EngineMetrics;
