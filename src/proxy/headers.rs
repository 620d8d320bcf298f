//! Header handling for forwarded requests and relayed responses.
//!
//! Hop-by-hop headers describe a single connection and are never forwarded
//! in either direction. Neither is any header the sender listed in its own
//! `Connection` header.

use std::net::IpAddr;

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

/// Connection-scoped headers, lowercase
pub const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "keep-alive",
    "host",
];

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Lowercased names listed in the `Connection` header(s)
fn connection_tokens<'a, I>(values: I) -> Vec<String>
where
    I: Iterator<Item = &'a [u8]>,
{
    values
        .filter_map(|v| std::str::from_utf8(v).ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn is_hop_by_hop(name: &str, tokens: &[String]) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) || tokens.iter().any(|t| name.eq_ignore_ascii_case(t))
}

/// Inbound headers minus hop-by-hop headers
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let tokens = connection_tokens(headers.get_all("connection").iter().map(|v| v.as_bytes()));

    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str(), &tokens) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// Upstream response headers minus hop-by-hop headers and `Content-Length`.
///
/// The body is buffered before relaying, so the outbound length is computed
/// again when the response is written.
pub fn filter_response_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let tokens = connection_tokens(headers.get_all("connection").iter().map(|v| v.as_bytes()));

    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = name.as_str();
        if is_hop_by_hop(name, &tokens) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_bytes(value.as_bytes())) {
            (Ok(name), Ok(value)) => {
                filtered.append(name, value);
            }
            _ => debug!(header = %name, "Dropping unrepresentable response header"),
        }
    }
    filtered
}

/// Add `X-Forwarded-For` / `-Proto` / `-Host`
pub fn apply_forwarded_headers(headers: &mut HeaderMap, client: Option<IpAddr>, proto: &str, host: Option<&HeaderValue>) {
    if let Some(client) = client {
        let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing.trim(), client),
            _ => client.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(proto) {
        headers.insert(X_FORWARDED_PROTO, value);
    }

    if let Some(host) = host {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
}

/// Set each configured header, then strip the denylist
pub fn apply_header_rules<'a, A>(headers: &mut HeaderMap, add: A, remove: &[String])
where
    A: IntoIterator<Item = (&'a String, &'a String)>,
{
    for (name, value) in add {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!(header = %name, "Skipping invalid configured header"),
        }
    }

    for name in remove {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(name);
        }
    }
}

/// Convert to the header map type `reqwest` sends
pub fn to_reqwest_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut converted = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            converted.append(name, value);
        }
    }
    converted
}
