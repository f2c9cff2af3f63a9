//! MailGate Common - Shared types and configuration
//!
//! This crate provides the request/result data contract exchanged between
//! the SMTP layer and the decision engine, together with configuration and
//! the shared error type.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{CheckRequest, CheckResult, Decision, EmailAddress, Headers, SmtpReply};
