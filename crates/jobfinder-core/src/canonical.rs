//! Canonical identity for postings gathered from heterogeneous sources.

use url::Url;
use uuid::Uuid;

use crate::RawPosting;

fn collapse_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn normalize_title(title: &str) -> String {
    collapse_fragment(title)
}

pub fn normalize_company(company: &str) -> String {
    collapse_fragment(company)
}

/// Coarse URL identity: lower-cased host (plus any non-default port) and
/// dot-segment-resolved path. Scheme, credentials, query and fragment are
/// dropped. Strings that do not parse as URLs are compared trimmed and
/// lower-cased.
pub fn url_fingerprint(url: &str) -> String {
    let trimmed = url.trim();
    let parsed = Url::parse(trimmed).or_else(|_| Url::parse(&format!("https://{trimmed}")));
    let Ok(parsed) = parsed else {
        return trimmed.to_ascii_lowercase();
    };
    let Some(host) = parsed.host_str() else {
        return trimmed.to_ascii_lowercase();
    };

    let host = host.strip_prefix("www.").unwrap_or(host);
    let path = parsed.path().trim_end_matches('/').to_ascii_lowercase();
    match parsed.port() {
        Some(port) => format!("{host}:{port}{path}"),
        None => format!("{host}{path}"),
    }
}

pub fn canonical_key(company: &str, title: &str, url: &str) -> String {
    format!(
        "{}|{}|{}",
        normalize_company(company),
        normalize_title(title),
        url_fingerprint(url)
    )
}

pub fn canonical_id(canonical_key: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, canonical_key.as_bytes())
}

/// Canonical id a raw posting resolves to.
pub fn canonicalize(raw: &RawPosting) -> Uuid {
    canonical_id(&canonical_key(&raw.company, &raw.title, &raw.url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_normalization_collapses_punctuation_and_whitespace() {
        assert_eq!(
            normalize_title("  Senior  Backend-Engineer (Remote)! "),
            "senior backend engineer remote"
        );
    }

    #[test]
    fn url_fingerprint_strips_query_scheme_and_www() {
        assert_eq!(
            url_fingerprint("https://www.Example.com/jobs/42/?utm_source=feed#apply"),
            "example.com/jobs/42"
        );
        assert_eq!(
            url_fingerprint("http://example.com:80/jobs/42"),
            "example.com/jobs/42"
        );
        assert_eq!(url_fingerprint("example.com"), "example.com");
    }

    #[test]
    fn url_fingerprint_resolves_dot_segments_and_keeps_custom_ports() {
        assert_eq!(
            url_fingerprint("https://a.example/jobs/../x"),
            url_fingerprint("https://a.example/x")
        );
        assert_eq!(
            url_fingerprint("https://user:pw@a.example:8443/jobs/7"),
            "a.example:8443/jobs/7"
        );
        assert_ne!(
            url_fingerprint("https://a.example:8443/jobs/7"),
            url_fingerprint("https://a.example/jobs/7")
        );
    }

    #[test]
    fn equivalent_postings_share_canonical_key() {
        let a = canonical_key(
            "ACME Inc.",
            "Backend Engineer",
            "https://boards.example.com/acme/1?src=a",
        );
        let b = canonical_key(
            "acme inc",
            "backend   engineer",
            "http://boards.example.com/acme/1/",
        );
        assert_eq!(a, b);
        assert_eq!(canonical_id(&a), canonical_id(&b));
    }

    #[test]
    fn different_paths_yield_different_ids() {
        let a = canonical_key("Acme", "Backend Engineer", "https://example.com/jobs/1");
        let b = canonical_key("Acme", "Backend Engineer", "https://example.com/jobs/2");
        assert_ne!(canonical_id(&a), canonical_id(&b));
    }
}
