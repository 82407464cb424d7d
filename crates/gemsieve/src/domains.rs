//! Sender domain normalization.
//!
//! All cross-table joins key on the organizational root domain (the
//! registered domain under the public suffix), so `notification.intuit.com`
//! and `mail.intuit.com` collapse into one sender. The raw host is preserved
//! separately as `sender_subdomain`.

/// Reduce a host to its organizational root using the public suffix list.
///
/// Hosts that are themselves a public suffix, bare labels, or unparseable
/// input are returned lowercased as-is.
pub fn organizational_root(host: &str) -> String {
    let trimmed = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if trimmed.is_empty() {
        return trimmed;
    }
    match psl::domain_str(&trimmed) {
        Some(root) => root.to_string(),
        None => trimmed,
    }
}

/// Extract the host from an email address, empty when there is none.
pub fn address_host(address: &str) -> String {
    match address.rsplit_once('@') {
        Some((_, host)) => host.trim().trim_matches('>').to_ascii_lowercase(),
        None => String::new(),
    }
}

/// Organizational root of an email address's host.
pub fn address_root(address: &str) -> String {
    let host = address_host(address);
    if host.is_empty() {
        return host;
    }
    organizational_root(&host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_subdomains_to_registered_domain() {
        assert_eq!(organizational_root("notification.intuit.com"), "intuit.com");
        assert_eq!(organizational_root("mail.em.acme.io"), "acme.io");
        assert_eq!(organizational_root("acme.com"), "acme.com");
    }

    #[test]
    fn honours_multi_part_public_suffixes() {
        assert_eq!(organizational_root("a.b.co.uk"), "b.co.uk");
        assert_eq!(organizational_root("shop.example.com.au"), "example.com.au");
    }

    #[test]
    fn address_root_handles_plain_and_bracketed_forms() {
        assert_eq!(address_root("alice@news.acme.com"), "acme.com");
        assert_eq!(address_root("no-at-sign"), "");
        assert_eq!(address_host("Bob <bob@acme.com>"), "acme.com");
    }

    #[test]
    fn normalizes_case_and_trailing_dots() {
        assert_eq!(organizational_root("Mail.Acme.COM."), "acme.com");
    }
}
