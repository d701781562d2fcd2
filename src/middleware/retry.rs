//! Retries failed downloads and retryable status codes.
//!
//! A retry is a new request: a copy of the original with the `retry_times`
//! meta bumped, `dont_filter` set and the priority adjusted. The flag the
//! request had before its first retry is kept in the `retry_dont_filter` meta
//! so a later redirect can restore it. It goes back
//! through the scheduler, so it waits for the same per-domain delay and
//! concurrency as any other request. Once the budget is spent the request is
//! permanently rejected.

use super::{Middleware, MiddlewareAction};
use crate::error::SpiderError;
use crate::request::Request;
use crate::response::Response;
use crate::stats::StatCollector;
use async_trait::async_trait;
use log::debug;
use std::collections::HashSet;
use std::sync::Arc;

pub const DEFAULT_RETRY_HTTP_CODES: &[u16] = &[500, 502, 503, 504, 522, 524, 408, 429];
pub const DEFAULT_RETRY_TIMES: u64 = 2;
pub const DEFAULT_RETRY_PRIORITY_ADJUST: i32 = -1;

/// Meta key holding the `dont_filter` flag a request had before it was retried.
pub const RETRY_DONT_FILTER_META: &str = "retry_dont_filter";

pub struct RetryMiddleware {
    max_retry_times: u64,
    http_codes: HashSet<u16>,
    priority_adjust: i32,
    stats: Arc<StatCollector>,
}

impl RetryMiddleware {
    pub fn new(stats: Arc<StatCollector>) -> Self {
        RetryMiddleware {
            max_retry_times: DEFAULT_RETRY_TIMES,
            http_codes: DEFAULT_RETRY_HTTP_CODES.iter().copied().collect(),
            priority_adjust: DEFAULT_RETRY_PRIORITY_ADJUST,
            stats,
        }
    }

    pub fn with_max_retry_times(mut self, times: u64) -> Self {
        self.max_retry_times = times;
        self
    }

    pub fn with_http_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.http_codes = codes.into_iter().collect();
        self
    }

    pub fn with_priority_adjust(mut self, adjust: i32) -> Self {
        self.priority_adjust = adjust;
        self
    }

    /// Builds the retry request, or the permanent rejection once the budget is spent.
    fn retry(&self, request: &Request, reason: &str) -> Result<Request, SpiderError> {
        let retries = request.meta_u64("retry_times").unwrap_or(0) + 1;
        let max = request
            .meta_u64("max_retry_times")
            .unwrap_or(self.max_retry_times);

        if retries > max {
            debug!(
                "Gave up retrying {} {} (failed {} times): {}",
                request.method,
                request.url,
                retries,
                reason
            );
            return Err(SpiderError::PermanentRejection {
                url: request.url.to_string(),
                reason: format!("retry budget of {} exhausted: {}", max, reason),
            });
        }

        debug!(
            "Retrying {} {} (failed {} times): {}",
            request.method, request.url, retries, reason
        );
        StatCollector::increment(&self.stats.requests_retried);

        let mut retry = request.clone();
        retry.meta.insert("retry_times".into(), retries.into());
        retry
            .meta
            .entry(RETRY_DONT_FILTER_META)
            .or_insert_with(|| request.dont_filter.into());
        retry.dont_filter = true;
        retry.priority = request.priority.saturating_add(self.priority_adjust);
        Ok(retry)
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "RetryMiddleware"
    }

    async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, SpiderError> {
        if response.request.meta_bool("dont_retry")
            || !self.http_codes.contains(&response.status.as_u16())
        {
            return Ok(MiddlewareAction::Continue(response));
        }
        let reason = response.status.to_string();
        let retry = self.retry(&response.request, &reason)?;
        Ok(MiddlewareAction::Reschedule(Box::new(retry)))
    }

    async fn process_exception(
        &self,
        request: &Request,
        error: SpiderError,
    ) -> Result<MiddlewareAction<SpiderError>, SpiderError> {
        if request.meta_bool("dont_retry") || !error.is_retryable() {
            return Ok(MiddlewareAction::Continue(error));
        }
        let retry = self.retry(request, &error.to_string())?;
        Ok(MiddlewareAction::Reschedule(Box::new(retry)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Headers;
    use reqwest::StatusCode;

    fn response(request: Request, status: u16) -> Response {
        Response::new(
            request,
            StatusCode::from_u16(status).unwrap(),
            Headers::new(),
            Vec::new(),
        )
    }

    fn middleware() -> RetryMiddleware {
        RetryMiddleware::new(Arc::new(StatCollector::new()))
    }

    #[tokio::test]
    async fn retries_until_budget_then_rejects() {
        let mw = middleware().with_max_retry_times(2);
        let mut request = Request::get("http://a.com/").unwrap().with_priority(10);

        for attempt in 1..=2u64 {
            match mw.process_response(response(request.clone(), 503)).await.unwrap() {
                MiddlewareAction::Reschedule(next) => {
                    assert_eq!(next.meta_u64("retry_times"), Some(attempt));
                    assert!(next.dont_filter);
                    assert_eq!(next.meta[RETRY_DONT_FILTER_META], false);
                    assert_eq!(next.priority, 10 - attempt as i32);
                    request = *next;
                }
                other => panic!("expected reschedule, got {:?}", other),
            }
        }

        let err = mw.process_response(response(request, 503)).await.unwrap_err();
        assert!(err.is_permanent_rejection());
        assert_eq!(mw.stats.snapshot().requests_retried, 2);
    }

    #[tokio::test]
    async fn non_retry_codes_pass_through() {
        let mw = middleware();
        let request = Request::get("http://a.com/").unwrap();
        assert!(matches!(
            mw.process_response(response(request, 404)).await.unwrap(),
            MiddlewareAction::Continue(_)
        ));
    }

    #[tokio::test]
    async fn meta_overrides() {
        let mw = middleware();
        let no_retry = Request::get("http://a.com/").unwrap().with_meta("dont_retry", true);
        assert!(matches!(
            mw.process_response(response(no_retry, 500)).await.unwrap(),
            MiddlewareAction::Continue(_)
        ));

        let zero_budget = Request::get("http://a.com/").unwrap().with_meta("max_retry_times", 0);
        assert!(mw.process_response(response(zero_budget, 500)).await.is_err());
    }

    #[tokio::test]
    async fn transport_errors_are_retried_others_pass() {
        let mw = middleware();
        let request = Request::get("http://a.com/").unwrap();

        let action = mw
            .process_exception(&request, SpiderError::timeout("http://a.com/", "elapsed"))
            .await
            .unwrap();
        assert!(matches!(action, MiddlewareAction::Reschedule(_)));

        let action = mw
            .process_exception(&request, SpiderError::GeneralError("boom".into()))
            .await
            .unwrap();
        assert!(matches!(action, MiddlewareAction::Continue(_)));
    }
}
