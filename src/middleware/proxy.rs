//! Proxy selection.
//!
//! The chosen proxy is written to the `proxy` meta key, which the downloader
//! reads. A `proxy` already present in meta wins; otherwise proxies from the
//! configured list are used round-robin, and without a list the
//! `HTTP_PROXY`/`HTTPS_PROXY` environment variables apply per scheme.
//! Credentials in a proxy URL become a `Proxy-Authorization` header and are
//! removed from the meta value.

use super::{Middleware, MiddlewareAction};
use crate::error::SpiderError;
use crate::request::Request;
use async_trait::async_trait;
use base64::prelude::*;
use log::{debug, warn};
use percent_encoding::percent_decode_str;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

pub struct ProxyMiddleware {
    rotation: Vec<Url>,
    by_scheme: HashMap<String, Url>,
    cursor: AtomicUsize,
}

fn parse_proxy(raw: &str) -> Result<Url, SpiderError> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };
    Url::parse(&with_scheme)
        .map_err(|e| SpiderError::ConfigurationError(format!("invalid proxy URL '{}': {}", raw, e)))
}

impl ProxyMiddleware {
    /// Round-robin over `proxies`.
    pub fn new<I, S>(proxies: I) -> Result<Self, SpiderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rotation = proxies
            .into_iter()
            .filter(|p| !p.as_ref().trim().is_empty())
            .map(|p| parse_proxy(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProxyMiddleware {
            rotation,
            by_scheme: HashMap::new(),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Reads `HTTP_PROXY`/`HTTPS_PROXY` (either case) as scheme defaults.
    pub fn with_env_proxies(mut self) -> Self {
        for scheme in ["http", "https"] {
            let var = format!("{}_proxy", scheme);
            let value = std::env::var(var.to_ascii_uppercase()).or_else(|_| std::env::var(&var));
            if let Ok(value) = value {
                match parse_proxy(&value) {
                    Ok(url) => {
                        self.by_scheme.insert(scheme.to_string(), url);
                    }
                    Err(e) => warn!("Ignoring {}: {}", var.to_ascii_uppercase(), e),
                }
            }
        }
        self
    }

    pub fn with_scheme_proxy(mut self, scheme: &str, proxy: &str) -> Result<Self, SpiderError> {
        self.by_scheme.insert(scheme.to_ascii_lowercase(), parse_proxy(proxy)?);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.rotation.is_empty() && self.by_scheme.is_empty()
    }

    fn choose(&self, request: &Request) -> Option<Url> {
        if !self.rotation.is_empty() {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.rotation.len();
            return Some(self.rotation[idx].clone());
        }
        self.by_scheme.get(request.url.scheme()).cloned()
    }
}

/// Splits credentials out of `proxy`, returning the header value if there were any.
fn take_credentials(proxy: &mut Url) -> Option<String> {
    if proxy.username().is_empty() {
        return None;
    }
    let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
    let user = decode(proxy.username());
    let pass = proxy.password().map(decode).unwrap_or_default();
    let _ = proxy.set_username("");
    let _ = proxy.set_password(None);
    Some(format!("Basic {}", BASE64_STANDARD.encode(format!("{}:{}", user, pass))))
}

#[async_trait]
impl Middleware for ProxyMiddleware {
    fn name(&self) -> &str {
        "ProxyMiddleware"
    }

    async fn process_request(
        &self,
        mut request: Request,
    ) -> Result<MiddlewareAction<Request>, SpiderError> {
        let explicit = match request.meta.get("proxy").cloned() {
            Some(Value::Null) => {
                // Explicitly no proxy.
                request.meta.remove("proxy");
                request.headers.remove("proxy-authorization");
                return Ok(MiddlewareAction::Continue(request));
            }
            Some(Value::String(s)) => Some(parse_proxy(&s).map_err(|e| SpiderError::Middleware {
                middleware: self.name().to_string(),
                message: e.to_string(),
            })?),
            _ => None,
        };

        let Some(mut proxy) = explicit.or_else(|| self.choose(&request)) else {
            return Ok(MiddlewareAction::Continue(request));
        };

        if let Some(auth) = take_credentials(&mut proxy) {
            request.headers.insert("Proxy-Authorization", auth);
        }
        debug!("Using proxy {} for {}", proxy, request.url);
        request.meta.insert("proxy".into(), Value::String(proxy.to_string()));
        Ok(MiddlewareAction::Continue(request))
    }
}
