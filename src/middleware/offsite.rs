//! Offsite filtering.
//!
//! `OffsitePolicy` is shared between the scheduler, which drops offsite
//! requests before they are queued, and `OffsiteMiddleware`, which catches
//! requests substituted inside the middleware chain.

use super::{Middleware, MiddlewareAction};
use crate::error::SpiderError;
use crate::request::Request;
use crate::stats::StatCollector;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use url::Url;

/// Allowed-domain check. Subdomains of an allowed domain are allowed.
#[derive(Debug, Clone, Default)]
pub struct OffsitePolicy {
    allowed: Vec<String>,
}

impl OffsitePolicy {
    /// An empty list allows every host.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = domains
            .into_iter()
            .filter_map(|d| normalize_domain(d.as_ref()))
            .collect();
        OffsitePolicy { allowed }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed
    }

    pub fn allows(&self, url: &Url) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.allowed.iter().any(|domain| {
            host == *domain
                || (host.len() > domain.len()
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        })
    }

    /// True when `request` must be dropped as offsite.
    pub fn rejects(&self, request: &Request) -> bool {
        !request.dont_filter && !self.allows(&request.url)
    }
}

fn normalize_domain(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.contains("://") {
        warn!("allowed domains accept domains, not URLs; using the host of '{}'", raw);
        return Url::parse(raw)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()));
    }
    let host = match raw.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            warn!("allowed domains accept domains without ports; ignoring the port of '{}'", raw);
            host
        }
        _ => raw,
    };
    Some(host.trim_start_matches('.').to_ascii_lowercase())
}

pub struct OffsiteMiddleware {
    policy: Arc<OffsitePolicy>,
    stats: Arc<StatCollector>,
}

impl OffsiteMiddleware {
    pub fn new(policy: Arc<OffsitePolicy>, stats: Arc<StatCollector>) -> Self {
        OffsiteMiddleware { policy, stats }
    }
}

#[async_trait]
impl Middleware for OffsiteMiddleware {
    fn name(&self) -> &str {
        "OffsiteMiddleware"
    }

    async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, SpiderError> {
        if !self.policy.rejects(&request) {
            return Ok(MiddlewareAction::Continue(request));
        }
        let domain = request.domain().unwrap_or_default();
        if self.stats.record_offsite(&domain) {
            debug!("Filtered offsite request to '{}': {}", domain, request.url);
        }
        Ok(MiddlewareAction::Drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn subdomains_are_allowed() {
        let policy = OffsitePolicy::new(["example.com"]);
        assert!(policy.allows(&url("http://example.com/")));
        assert!(policy.allows(&url("https://www.Example.com/a")));
        assert!(!policy.allows(&url("http://notexample.com/")));
        assert!(!policy.allows(&url("http://example.com.evil.org/")));
    }

    #[test]
    fn urls_and_ports_are_normalized() {
        let policy = OffsitePolicy::new(["https://shop.example.com/path", "api.example.org:8080"]);
        assert_eq!(policy.allowed_domains(), &["shop.example.com", "api.example.org"]);
        assert!(policy.allows(&url("http://api.example.org:9000/")));
    }

    #[test]
    fn empty_policy_allows_everything() {
        let policy = OffsitePolicy::new(Vec::<String>::new());
        assert!(policy.is_unrestricted());
        assert!(policy.allows(&url("http://anything.net/")));
    }

    #[tokio::test]
    async fn middleware_drops_and_counts() {
        let stats = Arc::new(StatCollector::new());
        let mw = OffsiteMiddleware::new(Arc::new(OffsitePolicy::new(["a.com"])), stats.clone());

        let onsite = Request::get("http://a.com/x").unwrap();
        assert!(matches!(mw.process_request(onsite).await.unwrap(), MiddlewareAction::Continue(_)));

        let offsite = Request::get("http://b.com/x").unwrap();
        assert!(matches!(mw.process_request(offsite).await.unwrap(), MiddlewareAction::Drop));

        let forced = Request::get("http://b.com/y").unwrap().with_dont_filter(true);
        assert!(matches!(mw.process_request(forced).await.unwrap(), MiddlewareAction::Continue(_)));

        assert_eq!(stats.offsite_count("b.com"), 1);
    }
}
