//! AWS Signature Version 4 primitives.
//!
//! Everything here is a pure function of its inputs; [`super::Signer`] wires
//! them to a request, a clock and a credential source.

use std::borrow::Cow;

use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use sha2::{Digest, Sha256};

use crate::http::headers::Headers;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// SHA-256 of the empty string, used when a request has no body.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Headers that are sent but never signed. Intermediaries may rewrite them.
const UNSIGNED_HEADERS: &[&str] = &[
    "authorization",
    "user-agent",
    "x-amzn-trace-id",
    "content-length",
    "connection",
    "expect",
];

/// RFC 3986 unreserved characters stay, everything else is encoded.
const URI_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const URI_ENCODE_PATH: &AsciiSet = &URI_ENCODE.remove(b'/');

pub fn hash_payload(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Makes the on-the-wire form of a request path explicit.
///
/// Bytes that may not appear in an HTTP path are percent-encoded. Valid
/// `%XX` escapes are kept exactly as received, so an escaped delimiter such as
/// `%2C` is sent as `%2C` and never turned back into a literal comma. A `%`
/// that does not start an escape is itself encoded as `%25`.
pub fn escape_wire_path(raw: &str) -> Cow<'_, str> {
    let bytes = raw.as_bytes();
    let needs_escape = bytes
        .iter()
        .enumerate()
        .any(|(i, &b)| !is_path_byte(b) || (b == b'%' && !is_escape_at(bytes, i)));
    if !needs_escape {
        return Cow::Borrowed(raw);
    }

    let mut out = String::with_capacity(raw.len() + 8);
    for (i, &b) in bytes.iter().enumerate() {
        if is_path_byte(b) && (b != b'%' || is_escape_at(bytes, i)) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    Cow::Owned(out)
}

/// Makes the on-the-wire form of a query string explicit.
///
/// A literal `+` is form-encoded space, so it is sent as `%20`; the signature
/// then covers the same bytes whichever way the upstream reads `+`. Other
/// bytes follow the path rules, with `?` also allowed.
pub fn escape_wire_query(raw: &str) -> Cow<'_, str> {
    let bytes = raw.as_bytes();
    let keep = |i: usize, b: u8| {
        b != b'+' && (is_path_byte(b) || b == b'?') && (b != b'%' || is_escape_at(bytes, i))
    };
    if bytes.iter().enumerate().all(|(i, &b)| keep(i, b)) {
        return Cow::Borrowed(raw);
    }

    let mut out = String::with_capacity(raw.len() + 8);
    for (i, &b) in bytes.iter().enumerate() {
        if keep(i, b) {
            out.push(b as char);
        } else if b == b'+' {
            out.push_str("%20");
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    Cow::Owned(out)
}

fn is_path_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"-._~!$&'()*+,;=:@/%".contains(&b)
}

fn is_escape_at(bytes: &[u8], i: usize) -> bool {
    bytes.len() > i + 2 && bytes[i + 1].is_ascii_hexdigit() && bytes[i + 2].is_ascii_hexdigit()
}

/// Canonical URI for non-S3 services: the wire path URI-encoded once more.
pub fn canonical_uri(wire_path: &str) -> String {
    if wire_path.is_empty() {
        return "/".to_string();
    }
    utf8_percent_encode(wire_path, URI_ENCODE_PATH).to_string()
}

/// Canonical query string: each name and value decoded, strictly re-encoded,
/// then sorted by name and value.
pub fn canonical_query(query: Option<&str>) -> String {
    let Some(query) = query else {
        return String::new();
    };

    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (uri_encode(name), uri_encode(value))
        })
        .collect();
    pairs.sort();

    pairs
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("&")
}

fn uri_encode(component: &str) -> String {
    let decoded = percent_decode_str(component).decode_utf8_lossy();
    utf8_percent_encode(&decoded, URI_ENCODE).to_string()
}

/// The canonical form of a request, over which the signature is computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    pub method: String,
    pub uri: String,
    pub query: String,
    /// `name:value\n` lines, sorted by name.
    pub headers: String,
    /// Semicolon-separated lowercase header names.
    pub signed_headers: String,
    pub payload_hash: String,
}

impl CanonicalRequest {
    pub fn new(
        method: &str,
        wire_path: &str,
        query: Option<&str>,
        headers: &Headers,
        payload_hash: &str,
    ) -> Self {
        let (headers, signed_headers) = canonical_headers(headers);
        Self {
            method: method.to_string(),
            uri: canonical_uri(wire_path),
            query: canonical_query(query),
            headers,
            signed_headers,
            payload_hash: payload_hash.to_string(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method, self.uri, self.query, self.headers, self.signed_headers, self.payload_hash
        )
    }

    pub fn hash(&self) -> String {
        hash_payload(self.render().as_bytes())
    }
}

/// Returns the canonical header block and the signed-headers list.
fn canonical_headers(headers: &Headers) -> (String, String) {
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();

    for (name, value) in headers.iter() {
        let name = name.to_ascii_lowercase();
        if UNSIGNED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
        match grouped.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => grouped.push((name, vec![value])),
        }
    }
    grouped.sort_by(|a, b| a.0.cmp(&b.0));

    let block = grouped
        .iter()
        .map(|(name, values)| format!("{}:{}\n", name, values.join(",")))
        .collect();
    let signed = grouped
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    (block, signed)
}

/// `<yyyymmdd>/<region>/<service>/aws4_request`
pub fn credential_scope(date: &str, region: &str, service: &str) -> String {
    format!("{}/{}/{}/aws4_request", date, region, service)
}

pub fn string_to_sign(amz_date: &str, scope: &str, canonical_request_hash: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM, amz_date, scope, canonical_request_hash
    )
}

/// Derives the signing key with the `AWS4` HMAC chain.
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> [u8; 32] {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

pub fn sign_string(key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac(key, string_to_sign.as_bytes()))
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}
