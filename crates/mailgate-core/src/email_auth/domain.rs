//! Domain name helpers shared by the checkers

/// Lowercase and strip the trailing root dot
pub fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Extract domain from email address
pub fn extract_domain(email: &str) -> Option<String> {
    // Handle <user@domain> format
    let email = email.trim().trim_start_matches('<').trim_end_matches('>');

    let (_, domain) = email.rsplit_once('@')?;
    if domain.is_empty() {
        return None;
    }
    Some(normalize(domain))
}

/// Organizational domain: the public suffix plus one label
///
/// `mail.example.com` gives `example.com`, `foo.bar.co.uk` gives `bar.co.uk`.
/// Names that are themselves public suffixes are returned unchanged.
pub fn organizational_domain(domain: &str) -> String {
    let normalized = normalize(domain);
    match psl::domain_str(&normalized) {
        Some(org) => org.to_string(),
        None => normalized,
    }
}

/// Whether `name` looks like a fully qualified host name
pub fn is_fqdn(name: &str) -> bool {
    let name = name.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 || !name.contains('.') {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}
