//! # Spider Module
//!
//! The `Spider` trait is the user-facing extension point: it supplies the
//! seed requests and turns each downloaded response into items and further
//! requests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! #[derive(Debug, Clone, serde::Serialize)]
//! struct Title {
//!     url: String,
//!     title: String,
//! }
//!
//! struct TitleSpider;
//!
//! #[async_trait]
//! impl Spider for TitleSpider {
//!     type Item = Title;
//!
//!     fn name(&self) -> &str {
//!         "titles"
//!     }
//!
//!     fn start_urls(&self) -> Vec<String> {
//!         vec!["https://example.com/".into()]
//!     }
//!
//!     async fn parse(&self, response: Response) -> Result<ParseOutput<Self::Item>, SpiderError> {
//!         let mut output = ParseOutput::new();
//!         output.add_item(Title { url: response.url.to_string(), title: response.text() });
//!         Ok(output)
//!     }
//! }
//! ```

use crate::error::SpiderError;
use crate::item::{ParseOutput, ScrapedItem};
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use url::Url;

#[async_trait]
pub trait Spider: Send + Sync + 'static {
    type Item: ScrapedItem;

    /// Name used in logs and for `%(name)s` in feed URIs.
    fn name(&self) -> &str;

    fn start_urls(&self) -> Vec<String> {
        Vec::new()
    }

    /// Seed requests. Defaults to a GET for every start URL.
    fn start_requests(&self) -> Result<Vec<Request>, SpiderError> {
        self.start_urls()
            .iter()
            .map(|u| Ok(Request::new(Url::parse(u)?)))
            .collect()
    }

    /// Hosts the crawl may visit, subdomains included. Empty allows every host.
    fn allowed_domains(&self) -> Vec<String> {
        Vec::new()
    }

    /// Extracts items and follow-up requests from `response`.
    ///
    /// `response.request.callback` names the callback the request was
    /// created for; spiders with several page kinds dispatch on it.
    async fn parse(&self, response: Response) -> Result<ParseOutput<Self::Item>, SpiderError>;

    /// Called when a request fails permanently.
    async fn on_failure(&self, _request: &Request, _error: &SpiderError) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Seeds;

    #[async_trait]
    impl Spider for Seeds {
        type Item = String;

        fn name(&self) -> &str {
            "seeds"
        }

        fn start_urls(&self) -> Vec<String> {
            vec!["http://a.com/".into(), "http://b.com/x".into()]
        }

        async fn parse(&self, _response: Response) -> Result<ParseOutput<String>, SpiderError> {
            Ok(ParseOutput::new())
        }
    }

    #[test]
    fn start_requests_follow_start_urls() {
        let requests = Seeds.start_requests().unwrap();
        let urls: Vec<_> = requests.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["http://a.com/", "http://b.com/x"]);
        assert!(Seeds.allowed_domains().is_empty());
    }
}
