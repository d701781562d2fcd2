//! Request fingerprinting for duplicate detection.
//!
//! A fingerprint is a SHA-256 digest over the method, the canonical URL, the
//! semantically relevant headers (sorted, case-folded) and the body. Header
//! order, header-name casing and non-semantic headers such as `Date` never
//! influence the result.

use crate::request::Request;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use url::{form_urlencoded, Url};

/// Headers excluded from fingerprints unless configured otherwise.
pub const DEFAULT_IGNORED_HEADERS: &[&str] = &[
    "date",
    "user-agent",
    "referer",
    "cookie",
    "proxy-authorization",
    "accept-encoding",
    "cache-control",
    "if-modified-since",
    "if-none-match",
];

/// Fixed-length request digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// Computes fingerprints under a configurable set of ignored headers.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    ignored_headers: HashSet<String>,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::with_ignored_headers(DEFAULT_IGNORED_HEADERS.iter().copied())
    }
}

impl Fingerprinter {
    pub fn with_ignored_headers<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Fingerprinter {
            ignored_headers: headers
                .into_iter()
                .map(|h| h.as_ref().trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    pub fn fingerprint(&self, request: &Request) -> Fingerprint {
        let mut hasher = Sha256::new();

        write_field(&mut hasher, request.method.as_str().to_ascii_uppercase().as_bytes());
        write_field(&mut hasher, canonicalize_url(&request.url).as_bytes());

        let mut headers: Vec<(String, &str)> = request
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
            .filter(|(k, _)| !self.ignored_headers.contains(k))
            .collect();
        headers.sort();
        hasher.update((headers.len() as u64).to_be_bytes());
        for (name, value) in headers {
            write_field(&mut hasher, name.as_bytes());
            write_field(&mut hasher, value.as_bytes());
        }

        write_field(&mut hasher, request.body.as_deref().unwrap_or_default());

        Fingerprint(hasher.finalize().into())
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Canonical URL form: fragment dropped, query pairs sorted.
///
/// Scheme and host case and default ports are already normalized by `Url`.
/// Query components are compared as raw bytes, so escapes that are not valid
/// UTF-8 stay distinct.
pub fn canonicalize_url(url: &Url) -> String {
    let mut canonical = url.clone();
    canonical.set_fragment(None);

    if let Some(query) = url.query() {
        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = query
            .split('&')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                let (key, value) = segment.split_once('=').unwrap_or((segment, ""));
                (decode_component(key), decode_component(value))
            })
            .collect();
        pairs.sort();
        if pairs.is_empty() {
            canonical.set_query(None);
        } else {
            let query = pairs
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}={}",
                        form_urlencoded::byte_serialize(k).collect::<String>(),
                        form_urlencoded::byte_serialize(v).collect::<String>()
                    )
                })
                .collect::<Vec<_>>()
                .join("&");
            canonical.set_query(Some(&query));
        }
    }

    canonical.into()
}

fn decode_component(raw: &str) -> Vec<u8> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).collect()
}
