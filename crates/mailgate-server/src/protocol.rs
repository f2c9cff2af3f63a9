//! JSON-lines check protocol
//!
//! One request object per input line, one [`CheckResult`] (or error object)
//! per output line, in input order.

use mailgate_common::{CheckRequest, CheckResult, EmailAddress, Error};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// One check request as read from the input stream
#[derive(Debug, Deserialize)]
pub struct CheckLine {
    pub ip: IpAddr,
    #[serde(default)]
    pub helo: String,
    /// Envelope sender; empty or `<>` for the null sender
    #[serde(default)]
    pub mail_from: String,
    pub rcpt_to: String,
    #[serde(default)]
    pub auth_user: Option<String>,
    /// Raw RFC 5322 message
    #[serde(default)]
    pub message: String,
    /// Evaluate with the minimal-header profile
    #[serde(default)]
    pub legacy: bool,
}

impl CheckLine {
    pub fn parse(line: &str) -> mailgate_common::Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::Validation(format!("Invalid request: {}", e)))
    }

    pub fn into_request(self) -> mailgate_common::Result<CheckRequest> {
        let mail_from = match self.mail_from.trim() {
            "" | "<>" => None,
            addr => Some(
                EmailAddress::parse(addr)
                    .ok_or_else(|| Error::Validation(format!("Invalid mail_from: {}", addr)))?,
            ),
        };
        let rcpt_to = EmailAddress::parse(&self.rcpt_to)
            .ok_or_else(|| Error::Validation(format!("Invalid rcpt_to: {}", self.rcpt_to)))?;

        let mut req = CheckRequest::new(self.ip, self.helo, mail_from, rcpt_to)
            .with_message(self.message.as_bytes());
        if let Some(user) = self.auth_user.filter(|u| !u.is_empty()) {
            req = req.authenticated(user);
        }
        Ok(req)
    }
}

/// Output line
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Result(Box<CheckResult>),
    Error { error: String, code: &'static str },
}

impl Reply {
    pub fn error(err: &Error) -> Self {
        Reply::Error {
            error: err.to_string(),
            code: err.code(),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"error\":\"serialization failed: {}\",\"code\":\"INTERNAL_ERROR\"}}", e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailgate_common::Decision;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full_line() {
        let line = r#"{"ip":"192.0.2.10","helo":"mail.example.com","mail_from":"alice@example.com","rcpt_to":"bob@example.org","auth_user":"alice","message":"From: alice@example.com\r\nSubject: hi\r\n\r\nhello\r\n"}"#;
        let req = CheckLine::parse(line).unwrap().into_request().unwrap();

        assert_eq!(req.client_ip, "192.0.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(req.mail_from, Some(EmailAddress::new("alice", "example.com")));
        assert_eq!(req.rcpt_to, EmailAddress::new("bob", "example.org"));
        assert_eq!(req.authenticated_as.as_deref(), Some("alice"));
        assert_eq!(req.from_header_domain().as_deref(), Some("example.com"));
        assert_eq!(req.body, b"hello\r\n".to_vec());
    }

    #[test]
    fn test_null_sender() {
        let line = r#"{"ip":"192.0.2.10","mail_from":"<>","rcpt_to":"<bob@example.org>"}"#;
        let req = CheckLine::parse(line).unwrap().into_request().unwrap();
        assert_eq!(req.mail_from, None);
        assert!(req.authenticated_as.is_none());
    }

    #[test]
    fn test_invalid_lines() {
        let err = CheckLine::parse("not json").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let bad_ip = r#"{"ip":"not-an-ip","rcpt_to":"bob@example.org"}"#;
        assert!(CheckLine::parse(bad_ip).is_err());

        let bad_rcpt = r#"{"ip":"192.0.2.10","rcpt_to":"nobody"}"#;
        let err = CheckLine::parse(bad_rcpt).unwrap().into_request().unwrap_err();
        assert!(err.to_string().contains("rcpt_to"));
    }

    #[test]
    fn test_reply_lines() {
        let reasons = vec!["SPF fail for example.com".to_string()];
        let result = CheckResult::new(Decision::Quarantine, 55, reasons);
        let line = Reply::Result(Box::new(result)).to_line();
        assert!(line.contains("\"decision\":\"quarantine\""));
        assert!(line.contains("\"score\":55"));

        let line = Reply::error(&Error::Validation("Invalid request".to_string())).to_line();
        assert_eq!(
            line,
            r#"{"error":"Validation error: Invalid request","code":"VALIDATION_ERROR"}"#
        );
    }
}
