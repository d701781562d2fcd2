//! Follows HTTP redirects as new requests.
//!
//! The downloader never follows redirects itself. A redirect response is
//! turned into a follow-up request that re-enters the scheduler, so it is
//! deduplicated and rate limited like any other request.

use super::retry::RETRY_DONT_FILTER_META;
use super::{Middleware, MiddlewareAction};
use crate::error::SpiderError;
use crate::request::Request;
use crate::response::Response;
use crate::stats::StatCollector;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;

pub const DEFAULT_REDIRECT_MAX_TIMES: u64 = 20;
pub const DEFAULT_REDIRECT_PRIORITY_ADJUST: i32 = 2;

/// Headers describing a request body; dropped when a redirect switches to GET.
const BODY_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "content-encoding",
    "content-language",
    "content-location",
];

pub struct RedirectMiddleware {
    max_redirect_times: u64,
    priority_adjust: i32,
    stats: Arc<StatCollector>,
}

impl RedirectMiddleware {
    pub fn new(stats: Arc<StatCollector>) -> Self {
        RedirectMiddleware {
            max_redirect_times: DEFAULT_REDIRECT_MAX_TIMES,
            priority_adjust: DEFAULT_REDIRECT_PRIORITY_ADJUST,
            stats,
        }
    }

    pub fn with_max_redirect_times(mut self, times: u64) -> Self {
        self.max_redirect_times = times;
        self
    }

    pub fn with_priority_adjust(mut self, adjust: i32) -> Self {
        self.priority_adjust = adjust;
        self
    }

    fn follow(&self, response: &Response, location: url::Url) -> Result<Request, SpiderError> {
        let source = &response.request;
        let status = response.status.as_u16();
        let redirects = source.meta_u64("redirect_times").unwrap_or(0) + 1;

        if redirects > self.max_redirect_times {
            debug!(
                "Discarding {} {}: max redirections ({}) reached",
                source.method, source.url, self.max_redirect_times
            );
            return Err(SpiderError::PermanentRejection {
                url: source.url.to_string(),
                reason: format!("max redirections ({}) reached", self.max_redirect_times),
            });
        }

        let mut next = source.clone();
        next.url = location;
        next.priority = source.priority.saturating_add(self.priority_adjust);

        if matches!(status, 301..=303) && source.method != Method::HEAD {
            next.method = Method::GET;
            next.body = None;
            for header in BODY_HEADERS {
                next.headers.remove(header);
            }
        }

        if next.url.host_str() != source.url.host_str() || next.url.scheme() != source.url.scheme() {
            next.headers.remove("cookie");
            next.headers.remove("authorization");
        }

        let mut trail = match source.meta.get("redirect_urls") {
            Some(Value::Array(urls)) => urls.clone(),
            _ => Vec::new(),
        };
        trail.push(Value::String(source.url.to_string()));
        next.meta.insert("redirect_urls".into(), Value::Array(trail));
        next.meta.insert("redirect_times".into(), redirects.into());
        next.meta.remove("retry_times");
        if let Some(flag) = next.meta.remove(RETRY_DONT_FILTER_META) {
            next.dont_filter = flag.as_bool().unwrap_or(false);
        }

        debug!("Redirecting ({}) to {} from {}", status, next.url, source.url);
        StatCollector::increment(&self.stats.requests_redirected);
        Ok(next)
    }
}

#[async_trait]
impl Middleware for RedirectMiddleware {
    fn name(&self) -> &str {
        "RedirectMiddleware"
    }

    async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, SpiderError> {
        let status = response.status.as_u16();
        if response.request.meta_bool("dont_redirect")
            || !matches!(status, 301 | 302 | 303 | 307 | 308)
        {
            return Ok(MiddlewareAction::Continue(response));
        }

        let Some(location) = response.headers.get("location") else {
            return Ok(MiddlewareAction::Continue(response));
        };
        let location = match response.urljoin(location.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            Ok(url) => {
                debug!("Not following redirect to {} scheme: {}", url.scheme(), url);
                return Ok(MiddlewareAction::Continue(response));
            }
            Err(e) => {
                warn!("Invalid redirect location '{}' from {}: {}", location, response.url, e);
                return Ok(MiddlewareAction::Continue(response));
            }
        };

        let next = self.follow(&response, location)?;
        Ok(MiddlewareAction::Reschedule(Box::new(next)))
    }
}
