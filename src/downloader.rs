//! The downloader: turns a `Request` into a `Response`.
//!
//! Redirects and cookies are left to the middleware chain, so the underlying
//! clients never follow redirects and keep no cookie store. One client is
//! built per distinct proxy (and proxy credentials) and reused.

use crate::error::{SpiderError, TransportErrorKind};
use crate::request::{Headers, Request};
use crate::response::Response;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, Proxy};
use std::time::{Duration, Instant};

pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_USER_AGENT: &str = concat!("spider-engine/", env!("CARGO_PKG_VERSION"));

#[async_trait]
pub trait Downloader: Send + Sync + 'static {
    async fn download(&self, request: Request) -> Result<Response, SpiderError>;
}

pub struct ReqwestClientDownloader {
    direct: Client,
    proxied: DashMap<(String, Option<String>), Client>,
    user_agent: String,
    timeout: Duration,
}

impl Default for ReqwestClientDownloader {
    fn default() -> Self {
        Self::new(DEFAULT_USER_AGENT, DEFAULT_DOWNLOAD_TIMEOUT)
    }
}

fn client_builder(user_agent: &str) -> reqwest::ClientBuilder {
    Client::builder()
        .user_agent(user_agent)
        .redirect(reqwest::redirect::Policy::none())
        .pool_idle_timeout(Duration::from_secs(90))
}

impl ReqwestClientDownloader {
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        let direct = client_builder(user_agent).build().unwrap_or_else(|e| {
            log::warn!("Falling back to a default HTTP client: {}", e);
            Client::new()
        });
        ReqwestClientDownloader {
            direct,
            proxied: DashMap::new(),
            user_agent: user_agent.to_string(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn client_for(&self, proxy: Option<&str>, auth: Option<&str>) -> Result<Client, SpiderError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let key = (proxy.to_string(), auth.map(str::to_string));
        if let Some(client) = self.proxied.get(&key) {
            return Ok(client.clone());
        }

        let config_error =
            |e: reqwest::Error| SpiderError::ConfigurationError(format!("proxy {}: {}", proxy, e));
        let mut reqwest_proxy = Proxy::all(proxy).map_err(config_error)?;
        if let Some(auth) = auth {
            let value = HeaderValue::from_str(auth).map_err(|e| {
                SpiderError::ConfigurationError(format!("proxy credentials for {}: {}", proxy, e))
            })?;
            reqwest_proxy = reqwest_proxy.custom_http_auth(value);
        }
        let client = client_builder(&self.user_agent)
            .proxy(reqwest_proxy)
            .build()
            .map_err(config_error)?;
        debug!("Built HTTP client for proxy {}", proxy);
        self.proxied.insert(key, client.clone());
        Ok(client)
    }

    fn request_timeout(&self, request: &Request) -> Duration {
        request
            .meta
            .get("download_timeout")
            .and_then(|v| v.as_f64())
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(self.timeout)
    }

    async fn fetch(&self, client: Client, request: &Request, headers: &Headers) -> Result<Response, SpiderError> {
        let url = request.url.to_string();
        let mut builder = client.request(request.method.clone(), request.url.clone());
        for (name, value) in headers.iter() {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                return Err(SpiderError::Protocol {
                    url,
                    message: format!("invalid header {}: {}", name, value),
                });
            };
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| classify(&url, e))?;
        let status = response.status();
        let final_url = response.url().clone();
        let response_headers = Headers::from(response.headers());
        let body = response.bytes().await.map_err(|e| classify(&url, e))?;

        Ok(Response::new(request.clone(), status, response_headers, body.to_vec()).with_url(final_url))
    }
}

/// Maps a reqwest failure onto the crawl's error taxonomy.
fn classify(url: &str, error: reqwest::Error) -> SpiderError {
    let kind = if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if error.is_connect() {
        TransportErrorKind::Connect
    } else if error.is_body() || error.is_decode() {
        return SpiderError::Protocol {
            url: url.to_string(),
            message: error.to_string(),
        };
    } else {
        TransportErrorKind::Other
    };
    SpiderError::Transport {
        url: url.to_string(),
        kind,
        message: error.to_string(),
    }
}

#[async_trait]
impl Downloader for ReqwestClientDownloader {
    async fn download(&self, request: Request) -> Result<Response, SpiderError> {
        let mut headers = request.headers.clone();
        let proxy_auth = headers.get("proxy-authorization").map(str::to_string);
        headers.remove("proxy-authorization");
        let client = self.client_for(request.meta_str("proxy"), proxy_auth.as_deref())?;

        let timeout = self.request_timeout(&request);
        trace!("Downloading {} {} (timeout {:?})", request.method, request.url, timeout);
        let started = Instant::now();
        let response = tokio::time::timeout(timeout, self.fetch(client, &request, &headers))
            .await
            .map_err(|_| {
                SpiderError::timeout(
                    request.url.to_string(),
                    format!("no response within {:?}", timeout),
                )
            })??;
        Ok(response.with_elapsed(started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn downloads_without_following_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/moved"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/target"))
            .mount(&server)
            .await;

        let downloader = ReqwestClientDownloader::default();
        let request = Request::get(&format!("{}/moved", server.uri())).unwrap();
        let response = downloader.download(request).await.unwrap();

        assert_eq!(response.status.as_u16(), 302);
        assert_eq!(response.headers.get("location"), Some("/target"));
    }

    #[tokio::test]
    async fn sends_request_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/form"))
            .and(header("x-token", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let downloader = ReqwestClientDownloader::default();
        let request = Request::post(&format!("{}/form", server.uri()), "a=1")
            .unwrap()
            .with_header("X-Token", "abc");
        let response = downloader.download(request).await.unwrap();
        assert_eq!(response.status.as_u16(), 200);
        assert_eq!(response.text(), "ok");
    }

    #[tokio::test]
    async fn meta_timeout_yields_transport_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let downloader = ReqwestClientDownloader::default();
        let request = Request::get(&server.uri())
            .unwrap()
            .with_meta("download_timeout", 0.2);
        let err = downloader.download(request).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.label(), "transport/timeout");
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let downloader = ReqwestClientDownloader::new("test", Duration::from_secs(5));
        let err = downloader
            .download(Request::get("http://127.0.0.1:1/").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SpiderError::Transport { .. }));
    }
}
