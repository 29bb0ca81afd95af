//! URL canonicalization for archive lookups.
//!
//! Captures are indexed under a SURT-style key so that different spellings of
//! the same resource (scheme, `www.` prefix, userinfo, default port, host case)
//! resolve to the same set of captures:
//!
//! ```text
//! http://test@www.Example.com:80/Path?b=2&a=1  ->  com,example)/path?a=1&b=2
//! ```
//!
//! The original URL string is never rewritten: it is kept verbatim in the
//! capture so percent-encoded segments survive replay unchanged.

use std::net::IpAddr;

use http::Uri;

/// Computes the canonical index key for a URL.
///
/// Falls back to the lowercased input when the URL cannot be parsed.
pub fn canonical_key(url: &str) -> String {
    let trimmed = url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);

    let uri: Uri = match without_fragment.parse() {
        Ok(uri) => uri,
        Err(_) => return without_fragment.to_ascii_lowercase(),
    };

    let Some(host) = uri.host() else {
        return without_fragment.to_ascii_lowercase();
    };

    let mut key = surt_host(host);

    if let Some(port) = uri.port_u16() {
        if Some(port) != default_port(uri.scheme_str()) {
            key.push(':');
            key.push_str(&port.to_string());
        }
    }

    key.push(')');

    let path = uri.path();
    if path.is_empty() {
        key.push('/');
    } else {
        key.push_str(&path.to_ascii_lowercase());
    }

    if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
        let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        params.sort_unstable();
        key.push('?');
        key.push_str(&params.join("&").to_ascii_lowercase());
    }

    key
}

/// Builds the absolute URL a proxied request targets.
///
/// The default port for the scheme is dropped, everything after the authority
/// is copied verbatim. Returns `None` for origin-form URIs without a host.
pub fn target_url(uri: &Uri) -> Option<String> {
    let host = uri.host()?;
    let scheme = uri.scheme_str().unwrap_or("http");

    let mut url = format!("{}://{}", scheme, host);
    if let Some(port) = uri.port_u16() {
        if Some(port) != default_port(Some(scheme)) {
            url.push(':');
            url.push_str(&port.to_string());
        }
    }

    match uri.path_and_query() {
        Some(pq) if !pq.as_str().is_empty() => url.push_str(pq.as_str()),
        _ => url.push('/'),
    }

    Some(url)
}

fn surt_host(host: &str) -> String {
    let host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();

    if host.parse::<IpAddr>().is_ok() {
        return host;
    }

    let host = host.strip_prefix("www.").unwrap_or(&host);
    host.split('.').rev().collect::<Vec<_>>().join(",")
}

fn default_port(scheme: Option<&str>) -> Option<u16> {
    match scheme {
        Some("https") => Some(443),
        Some("http") | None => Some(80),
        _ => None,
    }
}
