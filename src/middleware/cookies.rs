//! Session cookies.
//!
//! Cookies live in named jars; the `cookiejar` meta key selects one, and
//! requests without it share the default jar. Domain, path, expiry and
//! secure-flag matching is delegated to `cookie_store`.

use super::{Middleware, MiddlewareAction};
use crate::error::SpiderError;
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use cookie_store::CookieStore;
use dashmap::DashMap;
use log::{debug, trace};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Meta key remembering the `Cookie` header this middleware attached, so a
/// retried or redirected copy gets a fresh one instead of a stale one.
const ATTACHED_META: &str = "_cookie_header";

/// Session-scoped cookie jars keyed by the `cookiejar` meta value.
#[derive(Default)]
pub struct CookieJars {
    jars: DashMap<String, Arc<RwLock<CookieStore>>>,
}

impl CookieJars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jar(&self, key: &str) -> Arc<RwLock<CookieStore>> {
        self.jars
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(CookieStore::default())))
            .clone()
    }

    /// Jar key of `request`; the empty string is the default jar.
    pub fn key_for(request: &Request) -> String {
        match request.meta.get("cookiejar") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    /// `Cookie` header value for `url` from jar `key`, if any cookie matches.
    pub fn header_for(&self, key: &str, url: &Url) -> Option<String> {
        let jar = self.jar(key);
        let store = jar.read();
        let header = store
            .get_request_values(url)
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        (!header.is_empty()).then_some(header)
    }

    /// Stores one `Set-Cookie` value received from `url`.
    pub fn store(&self, key: &str, set_cookie: &str, url: &Url) {
        let jar = self.jar(key);
        let mut store = jar.write();
        if let Err(e) = store.parse(set_cookie, url) {
            debug!("Ignoring invalid cookie from {}: {} ({})", url, set_cookie, e);
        }
    }

    pub fn len(&self) -> usize {
        self.jars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jars.is_empty()
    }
}

pub struct CookiesMiddleware {
    jars: Arc<CookieJars>,
    debug: bool,
}

impl CookiesMiddleware {
    pub fn new(jars: Arc<CookieJars>) -> Self {
        CookiesMiddleware { jars, debug: false }
    }

    /// Logs every `Cookie` sent and `Set-Cookie` received.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn jars(&self) -> &Arc<CookieJars> {
        &self.jars
    }
}

#[async_trait]
impl Middleware for CookiesMiddleware {
    fn name(&self) -> &str {
        "CookiesMiddleware"
    }

    async fn process_request(
        &self,
        mut request: Request,
    ) -> Result<MiddlewareAction<Request>, SpiderError> {
        if request.meta_bool("dont_merge_cookies") {
            return Ok(MiddlewareAction::Continue(request));
        }

        if let Some(Value::String(attached)) = request.meta.remove(ATTACHED_META) {
            if request.headers.get("cookie") == Some(attached.as_str()) {
                request.headers.remove("cookie");
            }
        }
        if request.headers.contains("cookie") {
            trace!("Request {} carries its own Cookie header", request.url);
            return Ok(MiddlewareAction::Continue(request));
        }

        let key = CookieJars::key_for(&request);
        if let Some(header) = self.jars.header_for(&key, &request.url) {
            if self.debug {
                debug!("Sending cookies to: {}\nCookie: {}", request.url, header);
            }
            request.headers.insert("Cookie", header.clone());
            request.meta.insert(ATTACHED_META.into(), Value::String(header));
        }
        Ok(MiddlewareAction::Continue(request))
    }

    async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, SpiderError> {
        if response.request.meta_bool("dont_merge_cookies") {
            return Ok(MiddlewareAction::Continue(response));
        }

        let key = CookieJars::key_for(&response.request);
        let received: Vec<&str> = response.headers.get_all("set-cookie").collect();
        if self.debug && !received.is_empty() {
            debug!(
                "Received cookies from: {}\n{}",
                response.url,
                received
                    .iter()
                    .map(|c| format!("Set-Cookie: {}", c))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
        }
        for set_cookie in received {
            self.jars.store(&key, set_cookie, &response.url);
        }
        Ok(MiddlewareAction::Continue(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Headers;
    use reqwest::StatusCode;

    fn set_cookie_response(url: &str, cookies: &[&str], jar: Option<&str>) -> Response {
        let mut request = Request::get(url).unwrap();
        if let Some(jar) = jar {
            request = request.with_meta("cookiejar", jar);
        }
        let headers: Headers = cookies.iter().map(|c| ("Set-Cookie", *c)).collect();
        Response::new(request, StatusCode::OK, headers, Vec::new())
    }

    async fn outgoing(mw: &CookiesMiddleware, request: Request) -> Request {
        match mw.process_request(request).await.unwrap() {
            MiddlewareAction::Continue(r) => r,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn cookies_stay_on_their_domain() {
        let mw = CookiesMiddleware::new(Arc::new(CookieJars::new()));
        mw.process_response(set_cookie_response("http://d.com/login", &["sid=abc; Path=/"], None))
            .await
            .unwrap();

        let same = outgoing(&mw, Request::get("http://d.com/account").unwrap()).await;
        assert_eq!(same.headers.get("cookie"), Some("sid=abc"));

        let other = outgoing(&mw, Request::get("http://other.com/").unwrap()).await;
        assert!(!other.headers.contains("cookie"));
    }

    #[tokio::test]
    async fn jars_are_isolated_by_meta() {
        let mw = CookiesMiddleware::new(Arc::new(CookieJars::new()));
        mw.process_response(set_cookie_response("http://d.com/", &["user=one"], Some("a")))
            .await
            .unwrap();
        mw.process_response(set_cookie_response("http://d.com/", &["user=two"], Some("b")))
            .await
            .unwrap();

        let a = outgoing(&mw, Request::get("http://d.com/").unwrap().with_meta("cookiejar", "a")).await;
        let b = outgoing(&mw, Request::get("http://d.com/").unwrap().with_meta("cookiejar", "b")).await;
        let default = outgoing(&mw, Request::get("http://d.com/").unwrap()).await;

        assert_eq!(a.headers.get("cookie"), Some("user=one"));
        assert_eq!(b.headers.get("cookie"), Some("user=two"));
        assert!(!default.headers.contains("cookie"));
        assert_eq!(mw.jars().len(), 3);
    }

    #[tokio::test]
    async fn stale_attached_header_is_refreshed() {
        let mw = CookiesMiddleware::new(Arc::new(CookieJars::new()));
        mw.process_response(set_cookie_response("http://d.com/", &["v=1"], None))
            .await
            .unwrap();
        let first = outgoing(&mw, Request::get("http://d.com/").unwrap()).await;
        assert_eq!(first.headers.get("cookie"), Some("v=1"));

        mw.process_response(set_cookie_response("http://d.com/", &["v=2"], None))
            .await
            .unwrap();
        let retried = outgoing(&mw, first.clone()).await;
        assert_eq!(retried.headers.get("cookie"), Some("v=2"));
    }

    #[tokio::test]
    async fn dont_merge_cookies_skips_the_jar() {
        let mw = CookiesMiddleware::new(Arc::new(CookieJars::new()));
        let mut response = set_cookie_response("http://d.com/", &["x=1"], None);
        response.request = response.request.with_meta("dont_merge_cookies", true);
        mw.process_response(response).await.unwrap();

        let next = outgoing(&mw, Request::get("http://d.com/").unwrap()).await;
        assert!(!next.headers.contains("cookie"));
    }
}
