//! Canonical string and payload hash construction.
//!
//! Both strings are order- and whitespace-sensitive; any change here breaks
//! every deployed client.

use base64::Engine;
use hmac::{Hmac, Mac};
use http::header::{CONTENT_TYPE, HOST};
use http::request::Parts;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const HEADER_PREFIX: &str = "hawk.1.header";
const PAYLOAD_PREFIX: &str = "hawk.1.payload";

/// Content type hashed when the request carries none.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Request attributes that enter the canonical string, taken from the live
/// request and never from client-declared values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFacts {
    /// Upper-cased HTTP method.
    pub method: String,
    /// Path plus `?query` when a query is present.
    pub path: String,
    /// Lower-cased host without port.
    pub host: String,
    pub port: String,
    /// Content type with any `;` parameters stripped.
    pub content_type: String,
}

impl RequestFacts {
    pub fn from_parts(parts: &Parts, override_port: bool) -> Self {
        let raw_host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.as_str().to_string()))
            .unwrap_or_default();
        let (host, port) = split_host_port(&raw_host);
        let https = parts.uri.scheme_str() == Some("https");
        let port = match port {
            Some(p) if !override_port => p.to_string(),
            _ => default_port(https).to_string(),
        };

        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        Self {
            method: parts.method.as_str().to_ascii_uppercase(),
            path: full_path(&parts.uri),
            host: host.to_ascii_lowercase(),
            port,
            content_type: normalize_content_type(content_type),
        }
    }
}

fn default_port(https: bool) -> &'static str {
    if https {
        "443"
    } else {
        "80"
    }
}

/// Path and non-empty query. Fragments never reach the server.
pub fn full_path(uri: &http::Uri) -> String {
    let mut path = uri.path().to_string();
    if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
        path.push('?');
        path.push_str(query);
    }
    path
}

/// Split `host[:port]`, accepting the bracketed IPv6 form.
pub fn split_host_port(raw: &str) -> (&str, Option<&str>) {
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &raw[..end + 2];
            let port = rest[end + 1..]
                .strip_prefix(':')
                .filter(|p| !p.is_empty());
            return (host, port);
        }
    }
    match raw.split_once(':') {
        Some((host, port)) if !port.is_empty() => (host, Some(port)),
        Some((host, _)) => (host, None),
        None => (raw, None),
    }
}

/// Drop `;charset=...` style suffixes; empty becomes `text/plain`.
pub fn normalize_content_type(content_type: &str) -> String {
    let base = content_type.split(';').next().unwrap_or("").trim();
    if base.is_empty() {
        DEFAULT_CONTENT_TYPE.to_string()
    } else {
        base.to_string()
    }
}

/// Escape backslashes and newlines so the body fits on one line.
pub fn escape_body(body: &str) -> String {
    body.replace('\\', "\\\\").replace('\n', "\\n")
}

/// The string hashed into the payload hash.
pub fn payload_string(content_type: &str, body: &str) -> String {
    format!(
        "{PAYLOAD_PREFIX}\n{}\n{}\n",
        normalize_content_type(content_type),
        escape_body(body)
    )
}

/// Base64 SHA-256 over [`payload_string`].
pub fn payload_hash(content_type: &str, body: &str) -> String {
    let digest = Sha256::digest(payload_string(content_type, body).as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// The string fed into the MAC.
pub fn canonical_string(facts: &RequestFacts, ts: &str, nonce: &str, hash: &str, ext: &str) -> String {
    format!(
        "{HEADER_PREFIX}\n{ts}\n{nonce}\n{}\n{}\n{}\n{}\n{hash}\n{ext}\n",
        facts.method.to_ascii_uppercase(),
        facts.path,
        facts.host.to_ascii_lowercase(),
        facts.port,
    )
}

/// Base64 HMAC-SHA256 of `canonical` under `secret`.
pub fn mac(secret: &str, canonical: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can accept any key length");
    mac.update(canonical.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}
