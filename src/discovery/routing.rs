//! Request routing: which intercepted requests become snapshot resources.

use url::Url;

/// Outcome of the routing table for one request URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// The snapshot's own document request.
    Root,
    /// Continue and capture the response.
    Capture,
    /// Continue, never capture (non-network scheme, prefetch, external).
    Skip,
    /// Abort at the browser (disallowed hostname).
    Abort,
}

/// Apply the routing table for request `url` against the snapshot root.
pub fn route(
    url: &str,
    root_url: &Url,
    is_prefetch: bool,
    allowed_hostnames: &[String],
    disallowed_hostnames: &[String],
) -> Routing {
    let Ok(parsed) = Url::parse(url) else {
        return Routing::Skip;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return Routing::Skip;
    }
    if is_prefetch {
        return Routing::Skip;
    }
    if urls_equal(&parsed, root_url) {
        return Routing::Root;
    }
    // Same-origin and explicitly-allowed hosts capture even when a
    // disallowed pattern also happens to match them.
    let host = parsed.host_str().unwrap_or_default();
    if root_url.host_str() == Some(host) {
        return Routing::Capture;
    }
    if allowed_hostnames.iter().any(|p| hostname_matches(p, host)) {
        return Routing::Capture;
    }
    if disallowed_hostnames
        .iter()
        .any(|p| hostname_matches(p, host))
    {
        return Routing::Abort;
    }
    Routing::Skip
}

/// Hostname glob match: bare `*` matches everything, a leading `*.` matches
/// any subdomain chain of the suffix, and `*` inside a pattern matches
/// exactly one label.
pub fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let hostname = hostname.to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return hostname
            .strip_suffix(suffix)
            .is_some_and(|head| head.ends_with('.') && head.len() > 1);
    }
    let pattern_labels: Vec<&str> = pattern.split('.').collect();
    let host_labels: Vec<&str> = hostname.split('.').collect();
    pattern_labels.len() == host_labels.len()
        && pattern_labels
            .iter()
            .zip(&host_labels)
            .all(|(p, h)| *p == "*" || p == h)
}

/// URL equality modulo fragment.
pub fn urls_equal(a: &Url, b: &Url) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.set_fragment(None);
    b.set_fragment(None);
    a == b
}

/// Mimetypes accepted as snapshot resources. The root bypasses this filter.
pub fn accepted_mimetype(mimetype: &str) -> bool {
    let essence = mimetype
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("text/")
        || essence.starts_with("image/")
        || essence.starts_with("font/")
        || matches!(
            essence.as_str(),
            "application/javascript"
                | "application/json"
                | "application/octet-stream"
        )
}
