//! The `Response` type handed from the downloader through the middleware chain
//! to spider callbacks.

use crate::request::{Headers, Request};
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL of the response.
    pub url: Url,
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// The request this response answers.
    pub request: Request,
    /// Time spent downloading.
    pub elapsed: Duration,
    /// Set when a middleware produced the response without a network fetch.
    pub cached: bool,
}

impl Response {
    pub fn new(request: Request, status: StatusCode, headers: Headers, body: Vec<u8>) -> Self {
        Response {
            url: request.url.clone(),
            status,
            headers,
            body,
            request,
            elapsed: Duration::ZERO,
            cached: false,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    /// The request that produced this response.
    pub fn request_from_response(&self) -> &Request {
        &self.request
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Resolves `href` against the response URL.
    pub fn urljoin(&self, href: &str) -> Result<Url, url::ParseError> {
        self.url.join(href)
    }

    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection()
    }
}
