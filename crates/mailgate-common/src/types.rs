//! Request/result data contract shared by the SMTP layer and the engine

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into().to_ascii_lowercase(),
        }
    }

    /// Parse an email address from a string, accepting `<user@domain>`
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches('<').trim_end_matches('>');
        let (local, domain) = s.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() || domain.contains(char::is_whitespace) {
            return None;
        }
        Some(Self::new(local, domain.trim_end_matches('.')))
    }

    /// Extract the mailbox from a header value such as `"Alice" <alice@example.com>`
    pub fn from_header_value(value: &str) -> Option<Self> {
        if let (Some(start), Some(end)) = (value.rfind('<'), value.rfind('>')) {
            if start < end {
                return Self::parse(&value[start + 1..end]);
            }
        }
        // Bare address, possibly followed by a comment
        value.split_whitespace().find_map(Self::parse)
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid email address".to_string()))
    }
}

/// Message header fields
///
/// Names are matched case-insensitively. `get` returns the last value for a
/// name; `get_all` exposes every value for multi-valued fields such as
/// `DKIM-Signature`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header field
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Builder-style append
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Last value for a header name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for a header name, in message order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Split a raw RFC 5322 message into unfolded headers and body bytes
    pub fn parse_message(raw: &[u8]) -> (Headers, Vec<u8>) {
        let (header_end, body_start) = find_header_end(raw);
        let header_section = String::from_utf8_lossy(&raw[..header_end]);
        let mut headers = Headers::new();

        let mut current: Option<(String, String)> = None;
        for line in header_section.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.starts_with(' ') || line.starts_with('\t') {
                // Continuation of previous header
                if let Some((_, value)) = current.as_mut() {
                    value.push_str("\r\n");
                    value.push_str(line);
                }
            } else if let Some(colon_pos) = line.find(':') {
                if let Some((name, value)) = current.take() {
                    headers.insert(name, value);
                }
                let value = &line[colon_pos + 1..];
                current = Some((
                    line[..colon_pos].trim().to_string(),
                    value.strip_prefix(' ').unwrap_or(value).to_string(),
                ));
            }
        }
        if let Some((name, value)) = current.take() {
            headers.insert(name, value);
        }

        let body = raw.get(body_start..).unwrap_or_default().to_vec();
        (headers, body)
    }
}

/// Locate the blank line separating headers from body
fn find_header_end(raw: &[u8]) -> (usize, usize) {
    // No header block at all
    if raw.starts_with(b"\r\n") {
        return (0, 2);
    }
    if raw.starts_with(b"\n") {
        return (0, 1);
    }

    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\n' {
            if raw.get(i + 1) == Some(&b'\n') {
                return (i, i + 2);
            }
            if raw.get(i + 1) == Some(&b'\r') && raw.get(i + 2) == Some(&b'\n') {
                return (i, i + 3);
            }
        }
        i += 1;
    }
    (raw.len(), raw.len())
}

/// Everything the engine needs to know about one inbound message
///
/// Built by the SMTP layer from the live transaction and left untouched for
/// the duration of a single check.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    /// Connecting client IP
    pub client_ip: IpAddr,
    /// HELO/EHLO argument
    pub helo: String,
    /// Envelope sender (MAIL FROM), `None` for the null sender `<>`
    pub mail_from: Option<EmailAddress>,
    /// Envelope recipient (RCPT TO)
    pub rcpt_to: EmailAddress,
    /// Identity established through SMTP AUTH, if any
    pub authenticated_as: Option<String>,
    /// Message headers
    pub headers: Headers,
    /// Raw body bytes
    pub body: Vec<u8>,
}

impl CheckRequest {
    pub fn new(
        client_ip: IpAddr,
        helo: impl Into<String>,
        mail_from: Option<EmailAddress>,
        rcpt_to: EmailAddress,
    ) -> Self {
        Self {
            client_ip,
            helo: helo.into(),
            mail_from,
            rcpt_to,
            authenticated_as: None,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Attach a raw RFC 5322 message
    pub fn with_message(mut self, raw: &[u8]) -> Self {
        let (headers, body) = Headers::parse_message(raw);
        self.headers = headers;
        self.body = body;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn authenticated(mut self, identity: impl Into<String>) -> Self {
        self.authenticated_as = Some(identity.into());
        self
    }

    /// Recipient domain
    pub fn recipient_domain(&self) -> &str {
        &self.rcpt_to.domain
    }

    /// Domain of the visible From header
    pub fn from_header_domain(&self) -> Option<String> {
        self.headers
            .get("from")
            .and_then(EmailAddress::from_header_value)
            .map(|addr| addr.domain)
    }
}

/// Final verdict for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    GreylistDefer,
    Quarantine,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accept => "accept",
            Decision::GreylistDefer => "greylist_defer",
            Decision::Quarantine => "quarantine",
            Decision::Reject => "reject",
        }
    }

    /// SMTP reply the protocol layer sends for this decision
    ///
    /// Texts are deliberately generic so the remote peer learns nothing about
    /// which check fired.
    pub fn smtp_reply(&self) -> SmtpReply {
        match self {
            Decision::Accept | Decision::Quarantine => SmtpReply {
                code: 250,
                enhanced: "2.0.0",
                text: "OK",
            },
            Decision::GreylistDefer => SmtpReply {
                code: 451,
                enhanced: "4.7.1",
                text: "Please try again later",
            },
            Decision::Reject => SmtpReply {
                code: 550,
                enhanced: "5.7.1",
                text: "Message rejected",
            },
        }
    }

    /// Whether the message should be filed into quarantine rather than the inbox
    pub fn is_quarantine(&self) -> bool {
        matches!(self, Decision::Quarantine)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SMTP reply line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub enhanced: &'static str,
    pub text: &'static str,
}

impl SmtpReply {
    pub fn is_permanent(&self) -> bool {
        self.code >= 500
    }

    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }
}

impl std::fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.code, self.enhanced, self.text)
    }
}

/// Authentication outcomes attached to a result, as header tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSummary {
    pub spf: String,
    pub spf_domain: Option<String>,
    pub dkim: String,
    pub dkim_domain: Option<String>,
    pub dmarc: String,
    pub from_domain: Option<String>,
}

impl Default for AuthSummary {
    fn default() -> Self {
        Self {
            spf: "none".to_string(),
            spf_domain: None,
            dkim: "none".to_string(),
            dkim_domain: None,
            dmarc: "none".to_string(),
            from_domain: None,
        }
    }
}

/// Outcome of one engine check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// Correlation id for audit logs
    pub check_id: Uuid,
    pub decision: Decision,
    /// Always within 0..=100
    pub score: u8,
    /// Human-readable reasons, in evaluation order
    pub reasons: Vec<String>,
    #[serde(default)]
    pub auth: AuthSummary,
}

impl CheckResult {
    pub fn new(decision: Decision, score: i32, reasons: Vec<String>) -> Self {
        Self {
            check_id: Uuid::now_v7(),
            decision,
            score: clamp_score(score),
            reasons,
            auth: AuthSummary::default(),
        }
    }

    /// Generate Authentication-Results header value
    pub fn authentication_results(&self, hostname: &str) -> String {
        let mut value = format!("{}; spf={}", hostname, self.auth.spf);
        if let Some(domain) = &self.auth.spf_domain {
            value.push_str(&format!(" smtp.mailfrom={}", domain));
        }
        value.push_str(&format!("; dkim={}", self.auth.dkim));
        if let Some(domain) = &self.auth.dkim_domain {
            value.push_str(&format!(" header.d={}", domain));
        }
        value.push_str(&format!("; dmarc={}", self.auth.dmarc));
        if let Some(domain) = &self.auth.from_domain {
            value.push_str(&format!(" header.from={}", domain));
        }
        value
    }
}

/// Clamp an aggregated score into 0..=100
pub fn clamp_score(score: i32) -> u8 {
    score.clamp(0, 100) as u8
}
