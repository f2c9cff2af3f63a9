//! DKIM (DomainKeys Identified Mail) signing and verification
//!
//! Implements RFC 6376 - DomainKeys Identified Mail (DKIM) Signatures, with
//! the `rsa-sha256` and `ed25519-sha256` (RFC 8463) algorithms.

use super::dns::{DnsError, DnsResolver};
use super::domain::normalize;
use crate::context::CheckContext;
use anyhow::{anyhow, bail, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mailgate_common::config::DkimSigningSettings;
use mailgate_common::{Error, Headers};
use rsa::pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Signatures evaluated per message
const MAX_SIGNATURES: usize = 5;

/// DKIM verification result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DkimResult {
    /// Signature is valid
    Pass,
    /// Signature verification failed
    Fail,
    /// No signature present
    None,
    /// Temporary error (DNS timeout, etc.)
    TempError,
    /// Permanent error (invalid signature format)
    PermError,
}

impl DkimResult {
    /// Convert to header value for Authentication-Results
    pub fn as_header_value(&self) -> &'static str {
        match self {
            DkimResult::Pass => "pass",
            DkimResult::Fail => "fail",
            DkimResult::None => "none",
            DkimResult::TempError => "temperror",
            DkimResult::PermError => "permerror",
        }
    }

    /// Preference when several signatures fail
    fn rank(&self) -> u8 {
        match self {
            DkimResult::Pass => 4,
            DkimResult::Fail => 3,
            DkimResult::TempError => 2,
            DkimResult::PermError => 1,
            DkimResult::None => 0,
        }
    }
}

/// Outcome of verifying a message's signatures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimOutcome {
    pub result: DkimResult,
    /// Signing domain (`d=`) of the reported signature
    pub domain: Option<String>,
    /// Selector (`s=`) of the reported signature
    pub selector: Option<String>,
}

impl DkimOutcome {
    /// Message carried no signature
    pub fn unsigned() -> Self {
        Self {
            result: DkimResult::None,
            domain: None,
            selector: None,
        }
    }

    fn new(result: DkimResult, domain: Option<&str>, selector: Option<&str>) -> Self {
        Self {
            result,
            domain: domain.map(normalize),
            selector: selector.map(str::to_string),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.result == DkimResult::Pass
    }

    pub fn is_signed(&self) -> bool {
        self.result != DkimResult::None
    }
}

/// DKIM canonicalization algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Canonicalization {
    /// Simple canonicalization
    Simple,
    /// Relaxed canonicalization
    #[default]
    Relaxed,
}

impl Canonicalization {
    fn as_str(&self) -> &'static str {
        match self {
            Canonicalization::Simple => "simple",
            Canonicalization::Relaxed => "relaxed",
        }
    }
}

/// DKIM signing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigningAlgorithm {
    /// RSA-SHA256
    #[default]
    RsaSha256,
    /// Ed25519-SHA256
    Ed25519Sha256,
}

impl SigningAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::RsaSha256 => "rsa-sha256",
            SigningAlgorithm::Ed25519Sha256 => "ed25519-sha256",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rsa-sha256" => Some(SigningAlgorithm::RsaSha256),
            "ed25519-sha256" => Some(SigningAlgorithm::Ed25519Sha256),
            _ => None,
        }
    }

    /// Key type (`k=`) expected in the selector record
    fn key_type(&self) -> &'static str {
        match self {
            SigningAlgorithm::RsaSha256 => "rsa",
            SigningAlgorithm::Ed25519Sha256 => "ed25519",
        }
    }
}

/// DKIM signing configuration
#[derive(Debug, Clone)]
pub struct DkimSigningConfig {
    /// Domain name (d= tag)
    pub domain: String,
    /// Selector (s= tag)
    pub selector: String,
    /// Private key (PEM format)
    pub private_key_pem: String,
    /// Signing algorithm
    pub algorithm: SigningAlgorithm,
    /// Header canonicalization
    pub header_canon: Canonicalization,
    /// Body canonicalization
    pub body_canon: Canonicalization,
    /// Headers to sign
    pub headers_to_sign: Vec<String>,
}

impl Default for DkimSigningConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            selector: String::new(),
            private_key_pem: String::new(),
            algorithm: SigningAlgorithm::RsaSha256,
            header_canon: Canonicalization::Relaxed,
            body_canon: Canonicalization::Relaxed,
            headers_to_sign: vec![
                "from".to_string(),
                "to".to_string(),
                "subject".to_string(),
                "date".to_string(),
                "message-id".to_string(),
                "mime-version".to_string(),
                "content-type".to_string(),
            ],
        }
    }
}

impl DkimSigningConfig {
    /// Build from the `[dkim_signing]` section, reading the key file
    pub fn from_settings(settings: &DkimSigningSettings) -> mailgate_common::Result<Self> {
        let algorithm = SigningAlgorithm::parse(&settings.algorithm).ok_or_else(|| {
            Error::Config(format!("Unsupported DKIM algorithm: {}", settings.algorithm))
        })?;
        let private_key_pem = std::fs::read_to_string(&settings.private_key_path).map_err(|e| {
            Error::Config(format!(
                "Failed to read DKIM key {}: {}",
                settings.private_key_path.display(),
                e
            ))
        })?;

        let mut config = Self {
            domain: normalize(&settings.domain),
            selector: settings.selector.clone(),
            private_key_pem,
            algorithm,
            ..Default::default()
        };
        if !settings.headers.is_empty() {
            config.headers_to_sign =
                settings.headers.iter().map(|h| h.to_ascii_lowercase()).collect();
        }
        Ok(config)
    }
}

enum SignerKey {
    Rsa {
        key: SigningKey<Sha256>,
        public: RsaPublicKey,
    },
    Ed25519(ed25519_dalek::SigningKey),
}

/// DKIM signer for outgoing mail
pub struct DkimSigner {
    config: DkimSigningConfig,
    key: SignerKey,
}

impl DkimSigner {
    /// Create a new DKIM signer
    pub fn new(config: DkimSigningConfig) -> mailgate_common::Result<Self> {
        if config.domain.is_empty() || config.selector.is_empty() {
            return Err(Error::Config("DKIM signing requires a domain and selector".to_string()));
        }

        let key = match config.algorithm {
            SigningAlgorithm::RsaSha256 => {
                let private_key = parse_rsa_private_key(&config.private_key_pem)
                    .map_err(|e| Error::Key(e.to_string()))?;
                SignerKey::Rsa {
                    public: private_key.to_public_key(),
                    key: SigningKey::<Sha256>::new(private_key),
                }
            }
            SigningAlgorithm::Ed25519Sha256 => {
                use ed25519_dalek::pkcs8::DecodePrivateKey;
                let key = ed25519_dalek::SigningKey::from_pkcs8_pem(&config.private_key_pem)
                    .map_err(|e| {
                        Error::Key(format!("Failed to parse Ed25519 private key: {}", e))
                    })?;
                SignerKey::Ed25519(key)
            }
        };

        Ok(Self { config, key })
    }

    /// Create a DKIM signer from an RSA private key directly
    pub fn from_private_key(mut config: DkimSigningConfig, private_key: RsaPrivateKey) -> Self {
        config.algorithm = SigningAlgorithm::RsaSha256;
        Self {
            key: SignerKey::Rsa {
                public: private_key.to_public_key(),
                key: SigningKey::<Sha256>::new(private_key),
            },
            config,
        }
    }

    /// Create a DKIM signer from an Ed25519 key directly
    pub fn from_ed25519_key(mut config: DkimSigningConfig, key: ed25519_dalek::SigningKey) -> Self {
        config.algorithm = SigningAlgorithm::Ed25519Sha256;
        Self {
            key: SignerKey::Ed25519(key),
            config,
        }
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    pub fn selector(&self) -> &str {
        &self.config.selector
    }

    /// TXT record to publish at `<selector>._domainkey.<domain>`
    pub fn public_key_record(&self) -> String {
        let (k, p) = match &self.key {
            SignerKey::Rsa { public, .. } => {
                use rsa::pkcs8::EncodePublicKey;
                let der = public
                    .to_public_key_der()
                    .map(|doc| doc.as_bytes().to_vec())
                    .unwrap_or_default();
                ("rsa", BASE64.encode(der))
            }
            SignerKey::Ed25519(key) => ("ed25519", BASE64.encode(key.verifying_key().to_bytes())),
        };
        format!("v=DKIM1; k={}; p={}", k, p)
    }

    /// Sign a message and return the DKIM-Signature header value
    pub fn sign(&self, headers: &Headers, body: &[u8]) -> String {
        // Canonicalize body and compute body hash
        let canon_body = canonicalize_body(body, self.config.body_canon);
        let body_hash_b64 = BASE64.encode(Sha256::digest(&canon_body));

        let timestamp = chrono::Utc::now().timestamp();

        // Only headers present in the message are listed in h=
        let signed_headers: Vec<String> = self
            .config
            .headers_to_sign
            .iter()
            .filter(|h| headers.contains(h))
            .map(|h| h.to_ascii_lowercase())
            .collect();

        let mut dkim_header = format!(
            "v=1; a={}; c={}/{}; d={}; s={}; t={}; h={}; bh={}; b=",
            self.config.algorithm.as_str(),
            self.config.header_canon.as_str(),
            self.config.body_canon.as_str(),
            self.config.domain,
            self.config.selector,
            timestamp,
            signed_headers.join(":"),
            body_hash_b64
        );

        let data = canonicalize_headers(
            headers,
            &signed_headers,
            &dkim_header,
            self.config.header_canon,
        );

        let signature = match &self.key {
            SignerKey::Rsa { key, .. } => key.sign(&data).to_vec(),
            SignerKey::Ed25519(key) => {
                let digest = Sha256::digest(&data);
                ed25519_dalek::Signer::sign(key, digest.as_slice())
                    .to_bytes()
                    .to_vec()
            }
        };

        // Append signature to header
        dkim_header.push_str(&BASE64.encode(signature));

        debug!(
            "Signed message for {} with selector {}",
            self.config.domain, self.config.selector
        );

        dkim_header
    }

    /// Sign a raw RFC 5322 message
    pub fn sign_message(&self, message: &[u8]) -> String {
        let (headers, body) = Headers::parse_message(message);
        self.sign(&headers, &body)
    }
}

/// Public key published in a selector record
enum PublicKey {
    Rsa(RsaPublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

/// DKIM verifier for incoming mail
pub struct DkimVerifier {
    resolver: Arc<dyn DnsResolver>,
}

impl DkimVerifier {
    /// Create a new DKIM verifier
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self { resolver }
    }

    /// Verify the DKIM signatures of a message
    ///
    /// The first passing signature wins; otherwise the most informative
    /// failure is reported.
    pub async fn verify(&self, ctx: &CheckContext, headers: &Headers, body: &[u8]) -> DkimOutcome {
        let signatures = headers.get_all("dkim-signature");
        if signatures.is_empty() {
            debug!("No DKIM-Signature header found");
            return DkimOutcome::unsigned();
        }
        if signatures.len() > MAX_SIGNATURES {
            debug!(
                "Evaluating {} of {} DKIM signatures",
                MAX_SIGNATURES,
                signatures.len()
            );
        }

        let mut reported: Option<DkimOutcome> = None;
        for signature in signatures.into_iter().take(MAX_SIGNATURES) {
            let outcome = self.verify_signature(ctx, headers, body, signature).await;
            if outcome.is_valid() {
                return outcome;
            }
            reported = match reported {
                Some(prev) if prev.result.rank() >= outcome.result.rank() => Some(prev),
                _ => Some(outcome),
            };
        }

        reported.unwrap_or_else(DkimOutcome::unsigned)
    }

    /// Verify one DKIM-Signature header value
    async fn verify_signature(
        &self,
        ctx: &CheckContext,
        headers: &Headers,
        body: &[u8],
        dkim_sig: &str,
    ) -> DkimOutcome {
        // Parse DKIM-Signature tags
        let tags = match parse_dkim_tags(dkim_sig) {
            Ok(t) => t,
            Err(e) => {
                warn!("Failed to parse DKIM-Signature: {}", e);
                return DkimOutcome::new(DkimResult::PermError, None, None);
            }
        };

        let domain = tags.get("d").map(String::as_str);
        let selector = tags.get("s").map(String::as_str);
        let perm_error = || DkimOutcome::new(DkimResult::PermError, domain, selector);
        let fail = || DkimOutcome::new(DkimResult::Fail, domain, selector);

        // Extract required fields
        let (Some(domain_name), Some(selector_name)) = (domain, selector) else {
            return perm_error();
        };
        if tags.get("v").map(String::as_str) != Some("1") {
            warn!("Unsupported DKIM-Signature version for {}", domain_name);
            return perm_error();
        }
        let (Some(body_hash), Some(signed_headers), Some(signature_b64)) =
            (tags.get("bh"), tags.get("h"), tags.get("b"))
        else {
            return perm_error();
        };
        let Some(algorithm) = tags.get("a").and_then(|a| SigningAlgorithm::parse(a)) else {
            warn!("Unsupported DKIM algorithm: {:?}", tags.get("a"));
            return perm_error();
        };

        let signed_headers: Vec<String> = signed_headers
            .split(':')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if !signed_headers.iter().any(|h| h == "from") {
            warn!("DKIM signature for {} does not cover From", domain_name);
            return perm_error();
        }

        if let Some(identity) = tags.get("i") {
            let identity_domain = identity.rsplit_once('@').map(|(_, d)| normalize(d));
            let d = normalize(domain_name);
            match identity_domain {
                Some(id) if id == d || id.ends_with(&format!(".{}", d)) => {}
                _ => return perm_error(),
            }
        }

        if let Some(expiry) = tags.get("x") {
            match expiry.parse::<i64>() {
                Ok(x) if x < chrono::Utc::now().timestamp() => {
                    debug!("DKIM signature for {} expired at {}", domain_name, x);
                    return fail();
                }
                Ok(_) => {}
                Err(_) => return perm_error(),
            }
        }

        let (Ok(expected_body_hash), Ok(signature_bytes)) =
            (decode_base64(body_hash), decode_base64(signature_b64))
        else {
            warn!("Invalid base64 in DKIM-Signature for {}", domain_name);
            return perm_error();
        };
        if signature_bytes.is_empty() {
            return perm_error();
        }

        let canon = tags.get("c").map(|s| s.as_str()).unwrap_or("simple/simple");
        let Some((header_canon, body_canon)) = parse_canonicalization(canon) else {
            return perm_error();
        };

        // Fetch public key from DNS
        let dns_name = format!("{}._domainkey.{}", selector_name, domain_name);
        let public_key = match self.fetch_public_key(ctx, &dns_name, algorithm).await {
            Ok(key) => key,
            Err(result) => return DkimOutcome::new(result, domain, selector),
        };

        // Verify body hash
        let mut canon_body = canonicalize_body(body, body_canon);
        if let Some(length) = tags.get("l") {
            match length.parse::<usize>() {
                Ok(l) if l <= canon_body.len() => canon_body.truncate(l),
                _ => return perm_error(),
            }
        }
        if Sha256::digest(&canon_body).as_slice() != expected_body_hash.as_slice() {
            debug!("DKIM body hash mismatch for {}", domain_name);
            return fail();
        }

        let dkim_header_without_sig = match strip_dkim_signature_value(dkim_sig) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to strip DKIM b= value: {}", e);
                return perm_error();
            }
        };
        let data = canonicalize_headers(
            headers,
            &signed_headers,
            &dkim_header_without_sig,
            header_canon,
        );

        let verified = match public_key {
            PublicKey::Rsa(key) => RsaSignature::try_from(signature_bytes.as_slice())
                .map_err(|e| e.to_string())
                .and_then(|sig| {
                    VerifyingKey::<Sha256>::new(key)
                        .verify(&data, &sig)
                        .map_err(|e| e.to_string())
                }),
            PublicKey::Ed25519(key) => ed25519_dalek::Signature::from_slice(&signature_bytes)
                .map_err(|e| e.to_string())
                .and_then(|sig| {
                    key.verify_strict(Sha256::digest(&data).as_slice(), &sig)
                        .map_err(|e| e.to_string())
                }),
        };

        if let Err(e) = verified {
            debug!(
                "DKIM signature verification failed for domain {}: {}",
                domain_name, e
            );
            return fail();
        }

        debug!("DKIM signature verified for domain {}", domain_name);

        DkimOutcome::new(DkimResult::Pass, domain, selector)
    }

    /// Fetch DKIM public key from DNS
    async fn fetch_public_key(
        &self,
        ctx: &CheckContext,
        dns_name: &str,
        algorithm: SigningAlgorithm,
    ) -> Result<PublicKey, DkimResult> {
        let records = match ctx.resolve(self.resolver.lookup_txt(dns_name)).await {
            Ok(records) => records,
            Err(DnsError::NotFound) => {
                debug!("No DKIM public key found for {}", dns_name);
                return Err(DkimResult::PermError);
            }
            Err(e) => {
                warn!("Failed to fetch DKIM public key {}: {}", dns_name, e);
                return Err(DkimResult::TempError);
            }
        };

        let Some(tags) = records
            .iter()
            .filter_map(|txt| parse_dkim_tags(txt).ok())
            .find(|tags| tags.contains_key("p"))
        else {
            return Err(DkimResult::PermError);
        };

        if tags.get("v").is_some_and(|v| v != "DKIM1") {
            return Err(DkimResult::PermError);
        }
        let key_type = tags.get("k").map(|k| k.to_ascii_lowercase());
        if key_type.as_deref().unwrap_or("rsa") != algorithm.key_type() {
            warn!("DKIM key type mismatch at {}", dns_name);
            return Err(DkimResult::PermError);
        }

        let p = tags.get("p").map(String::as_str).unwrap_or_default();
        if p.is_empty() {
            debug!("DKIM key at {} has been revoked", dns_name);
            return Err(DkimResult::PermError);
        }

        let parsed = match algorithm {
            SigningAlgorithm::RsaSha256 => parse_rsa_public_key(p).map(PublicKey::Rsa),
            SigningAlgorithm::Ed25519Sha256 => parse_ed25519_public_key(p).map(PublicKey::Ed25519),
        };
        parsed.map_err(|e| {
            warn!("Failed to parse DKIM public key at {}: {}", dns_name, e);
            DkimResult::PermError
        })
    }
}

/// Parse RSA private key from PEM format (PKCS#8 or PKCS#1)
fn parse_rsa_private_key(pem: &str) -> Result<RsaPrivateKey> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| anyhow!("Failed to parse RSA private key: {}", e))
}

/// Parse DKIM tag=value pairs
fn parse_dkim_tags(s: &str) -> Result<HashMap<String, String>> {
    let mut tags = HashMap::new();

    for part in s.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((name, value)) = part.split_once('=') else {
            bail!("Malformed tag: {}", part);
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();
        if tags.insert(name.clone(), value).is_some() {
            bail!("Duplicate tag: {}", name);
        }
    }

    Ok(tags)
}

/// Decode base64 that may contain folding whitespace
fn decode_base64(value: &str) -> Result<Vec<u8>> {
    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(BASE64.decode(compact)?)
}

fn parse_canonicalization(value: &str) -> Option<(Canonicalization, Canonicalization)> {
    let parse = |s: &str| match s.trim().to_ascii_lowercase().as_str() {
        "relaxed" => Some(Canonicalization::Relaxed),
        "simple" => Some(Canonicalization::Simple),
        _ => None,
    };
    let mut parts = value.splitn(2, '/');
    let header = parse(parts.next().unwrap_or("simple"))?;
    let body = parse(parts.next().unwrap_or("simple"))?;
    Some((header, body))
}

fn strip_dkim_signature_value(dkim_signature_header: &str) -> Result<String> {
    let lower = dkim_signature_header.to_ascii_lowercase();
    let mut search_from = 0usize;

    while let Some(rel_idx) = lower[search_from..].find("b=") {
        let idx = search_from + rel_idx;
        let valid_tag_start = lower[..idx]
            .rsplit(';')
            .next()
            .map(|s| s.trim().is_empty())
            .unwrap_or(true);

        if valid_tag_start {
            let value_start = idx + 2;
            let value_end = dkim_signature_header[value_start..]
                .find(';')
                .map(|end| value_start + end)
                .unwrap_or(dkim_signature_header.len());

            let mut result = String::with_capacity(dkim_signature_header.len());
            result.push_str(&dkim_signature_header[..value_start]);
            result.push_str(&dkim_signature_header[value_end..]);
            return Ok(result);
        }

        search_from = idx + 2;
    }

    Err(anyhow!("DKIM-Signature header does not contain b= tag"))
}

/// Split a body into lines without their line terminators
fn body_lines(body: &[u8]) -> Vec<&[u8]> {
    if body.is_empty() {
        return Vec::new();
    }
    let body = body.strip_suffix(b"\n").unwrap_or(body);
    body.split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect()
}

/// Collapse runs of WSP to one space and drop trailing WSP
fn relax_line(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut in_space = false;
    for &b in line {
        if b == b' ' || b == b'\t' {
            in_space = true;
        } else {
            if in_space {
                out.push(b' ');
                in_space = false;
            }
            out.push(b);
        }
    }
    out
}

/// Canonicalize message body
fn canonicalize_body(body: &[u8], canon: Canonicalization) -> Vec<u8> {
    let mut lines: Vec<Vec<u8>> = body_lines(body)
        .into_iter()
        .map(|line| match canon {
            Canonicalization::Simple => line.to_vec(),
            Canonicalization::Relaxed => relax_line(line),
        })
        .collect();

    // Remove trailing empty lines
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    if lines.is_empty() {
        return match canon {
            Canonicalization::Simple => b"\r\n".to_vec(),
            Canonicalization::Relaxed => Vec::new(),
        };
    }

    let mut result = lines.join(&b"\r\n"[..]);
    result.extend_from_slice(b"\r\n");
    result
}

fn relax_header_value(value: &str) -> String {
    let unfolded = value.replace("\r\n", "");
    String::from_utf8_lossy(&relax_line(unfolded.trim().as_bytes())).into_owned()
}

fn canonicalize_header(name: &str, value: &str, canon: Canonicalization, out: &mut Vec<u8>) {
    match canon {
        Canonicalization::Simple => {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
        }
        Canonicalization::Relaxed => {
            out.extend_from_slice(name.trim().to_ascii_lowercase().as_bytes());
            out.push(b':');
            out.extend_from_slice(relax_header_value(value).as_bytes());
        }
    }
}

/// Build the signed header data
///
/// Each name in `signed_headers` consumes the next instance of that header
/// from the bottom of the message; names without a remaining instance
/// contribute nothing. The DKIM-Signature value is appended last, without a
/// trailing CRLF.
fn canonicalize_headers(
    headers: &Headers,
    signed_headers: &[String],
    dkim_header: &str,
    canon: Canonicalization,
) -> Vec<u8> {
    let mut result = Vec::new();
    let mut consumed: HashMap<&str, usize> = HashMap::new();

    for header_name in signed_headers {
        let instances: Vec<(&str, &str)> = headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(header_name))
            .collect();
        let used = consumed.entry(header_name.as_str()).or_insert(0);
        if *used < instances.len() {
            let (name, value) = instances[instances.len() - 1 - *used];
            *used += 1;
            canonicalize_header(name, value, canon, &mut result);
            result.extend_from_slice(b"\r\n");
        }
    }

    canonicalize_header("DKIM-Signature", dkim_header, canon, &mut result);
    result
}

fn parse_rsa_public_key(public_key_b64: &str) -> Result<RsaPublicKey> {
    use rsa::pkcs1::DecodeRsaPublicKey;
    use rsa::pkcs8::DecodePublicKey;

    let der = decode_base64(public_key_b64)
        .map_err(|e| anyhow!("Failed to decode DKIM public key: {}", e))?;

    if let Ok(key) = RsaPublicKey::from_public_key_der(&der) {
        return Ok(key);
    }

    RsaPublicKey::from_pkcs1_der(&der)
        .map_err(|e| anyhow!("Failed to parse DKIM RSA public key DER: {}", e))
}

fn parse_ed25519_public_key(public_key_b64: &str) -> Result<ed25519_dalek::VerifyingKey> {
    let raw = decode_base64(public_key_b64)?;
    let bytes: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("Ed25519 public key must be 32 bytes, got {}", raw.len()))?;
    Ok(ed25519_dalek::VerifyingKey::from_bytes(&bytes)?)
}
