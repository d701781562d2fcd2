//! HTTP Basic authentication for one domain and its subdomains.

use super::{Middleware, MiddlewareAction};
use crate::error::SpiderError;
use crate::request::Request;
use async_trait::async_trait;
use base64::prelude::*;

pub struct HttpAuthMiddleware {
    header: String,
    domain: String,
}

impl HttpAuthMiddleware {
    pub fn new(user: &str, pass: &str, domain: &str) -> Self {
        HttpAuthMiddleware {
            header: format!("Basic {}", BASE64_STANDARD.encode(format!("{}:{}", user, pass))),
            domain: domain.trim().trim_start_matches('.').to_ascii_lowercase(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn applies_to(&self, request: &Request) -> bool {
        match request.domain() {
            Some(host) => {
                host == self.domain || host.ends_with(&format!(".{}", self.domain))
            }
            None => false,
        }
    }
}

#[async_trait]
impl Middleware for HttpAuthMiddleware {
    fn name(&self) -> &str {
        "HttpAuthMiddleware"
    }

    async fn process_request(
        &self,
        mut request: Request,
    ) -> Result<MiddlewareAction<Request>, SpiderError> {
        if self.applies_to(&request) && !request.headers.contains("authorization") {
            request.headers.insert("Authorization", self.header.clone());
        }
        Ok(MiddlewareAction::Continue(request))
    }
}
