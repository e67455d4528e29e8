//! Canonical SURT key normalization.
//!
//! A canonical surt key is a byte-comparable, deduplication-friendly form of
//! a URL: `com,example,)/path?a=1`. Two policy-equivalent URLs (scheme and
//! host case, default ports, fragments, query-parameter order) map to the
//! same key, and keys for the same host share a lexicographic prefix, which
//! is what the capture index range queries rely on.

use url::Url;

use crate::error::CrawlError;

/// Captures are indexed by the first 150 bytes of the key, which keeps the
/// index entry bounded while preserving enough prefix for range scans.
pub const ABBR_KEY_LEN: usize = 150;

/// Normalize a URL into its canonical surt key.
///
/// Total and deterministic for any syntactically parseable http(s) URL.
/// Anything else is an `InvalidUrl`, which callers treat as "skip, do not
/// enqueue".
pub fn canonical_surt(url: &str) -> Result<String, CrawlError> {
    let parsed = Url::parse(url.trim()).map_err(|e| CrawlError::invalid_url(url, e))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CrawlError::invalid_url(
                url,
                format!("unsupported scheme {other:?}"),
            ))
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| CrawlError::invalid_url(url, "no host"))?
        .to_ascii_lowercase();

    let mut key = String::with_capacity(url.len());

    // Reverse dotted host labels: example.com -> com,example,
    for label in host.trim_matches('.').rsplit('.') {
        key.push_str(label);
        key.push(',');
    }

    // Non-default port stays part of the authority.
    if let Some(port) = parsed.port() {
        let default = match parsed.scheme() {
            "http" => 80,
            _ => 443,
        };
        if port != default {
            key.push(':');
            key.push_str(&port.to_string());
        }
    }

    key.push(')');

    let path = parsed.path();
    if path.is_empty() {
        key.push('/');
    } else {
        key.push_str(path);
    }

    // Sort query parameters so ?b=2&a=1 and ?a=1&b=2 collapse to one key.
    if let Some(query) = parsed.query() {
        if !query.is_empty() {
            let mut params: Vec<&str> = query.split('&').collect();
            params.sort_unstable();
            key.push('?');
            key.push_str(&params.join("&"));
        }
    }

    // Fragment is dropped: not significant for resource identity.

    Ok(key)
}

/// Truncate a canonical surt key for the capture secondary index.
pub fn abbreviated(key: &str) -> String {
    if key.len() <= ABBR_KEY_LEN {
        return key.to_string();
    }
    // Truncate on a char boundary at or below the byte limit.
    let mut end = ABBR_KEY_LEN;
    while !key.is_char_boundary(end) {
        end -= 1;
    }
    key[..end].to_string()
}

/// Upper bound for a prefix range scan: the smallest key greater than every
/// key starting with `prefix`.
pub fn prefix_upper_bound(prefix: &str) -> String {
    let mut upper = prefix.to_string();
    upper.push('\u{10FFFD}');
    upper
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_scheme_case_insensitive() {
        assert_eq!(
            canonical_surt("http://Example.com/a").unwrap(),
            canonical_surt("http://example.com/a").unwrap(),
        );
        assert_eq!(
            canonical_surt("HTTP://EXAMPLE.COM/a").unwrap(),
            "com,example,)/a"
        );
    }

    #[test]
    fn host_labels_reversed_for_prefix_grouping() {
        let key = canonical_surt("https://sub.example.com/x/y").unwrap();
        assert_eq!(key, "com,example,sub,)/x/y");

        // All pages of one host share a prefix.
        let a = canonical_surt("https://example.com/a").unwrap();
        let b = canonical_surt("https://example.com/b/c").unwrap();
        assert!(a.starts_with("com,example,)/"));
        assert!(b.starts_with("com,example,)/"));
    }

    #[test]
    fn default_ports_dropped_custom_kept() {
        assert_eq!(
            canonical_surt("http://example.com:80/p").unwrap(),
            canonical_surt("http://example.com/p").unwrap(),
        );
        assert_eq!(
            canonical_surt("https://example.com:8443/p").unwrap(),
            "com,example,:8443)/p"
        );
    }

    #[test]
    fn query_sorted_fragment_dropped() {
        assert_eq!(
            canonical_surt("http://example.com/p?b=2&a=1").unwrap(),
            canonical_surt("http://example.com/p?a=1&b=2").unwrap(),
        );
        assert_eq!(
            canonical_surt("http://example.com/p#frag").unwrap(),
            "com,example,)/p"
        );
    }

    #[test]
    fn malformed_and_non_http_rejected() {
        assert!(canonical_surt("not a url").is_err());
        assert!(canonical_surt("mailto:foo@example.com").is_err());
        assert!(canonical_surt("javascript:void(0)").is_err());
    }

    #[test]
    fn deterministic() {
        let a = canonical_surt("https://example.com/path?x=1").unwrap();
        let b = canonical_surt("https://example.com/path?x=1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn abbreviation_bounded() {
        let long = format!("http://example.com/{}", "a".repeat(400));
        let key = canonical_surt(&long).unwrap();
        let abbr = abbreviated(&key);
        assert!(abbr.len() <= ABBR_KEY_LEN);
        assert!(key.starts_with(&abbr));
    }

    #[test]
    fn prefix_upper_bound_sorts_after_prefixed_keys() {
        let prefix = "com,example,)/";
        let upper = prefix_upper_bound(prefix);
        assert!(upper.as_str() > "com,example,)/zzz");
        assert!(upper.as_str() > prefix);
    }
}
