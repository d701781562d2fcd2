//! Downloader middlewares.
//!
//! A middleware sees every request on its way to the downloader and every
//! response or download error on the way back. Stages run in ascending
//! priority on the request side and descending priority on the response and
//! exception sides (see `crawler::MiddlewareManager`).
//!
//! Middlewares take `&self`; any per-session state they keep is behind
//! interior mutability so a single chain is shared by all download tasks.

pub mod auth;
pub mod cookies;
pub mod offsite;
pub mod proxy;
pub mod redirect;
pub mod retry;

pub use auth::HttpAuthMiddleware;
pub use cookies::CookiesMiddleware;
pub use offsite::{OffsiteMiddleware, OffsitePolicy};
pub use proxy::ProxyMiddleware;
pub use redirect::RedirectMiddleware;
pub use retry::RetryMiddleware;

use crate::error::SpiderError;
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;

/// Default chain position of each built-in middleware.
pub mod priorities {
    pub const OFFSITE: i32 = 50;
    pub const HTTP_AUTH: i32 = 300;
    pub const RETRY: i32 = 550;
    pub const REDIRECT: i32 = 600;
    pub const COOKIES: i32 = 700;
    pub const PROXY: i32 = 750;
}

/// What a middleware stage wants done with the value it was handed.
#[derive(Debug)]
pub enum MiddlewareAction<T> {
    /// Pass the (possibly replaced) value to the next stage.
    Continue(T),
    /// Produce a response without a network fetch, or recover from an error.
    ReturnResponse(Response),
    /// Replace the in-flight request with a new one.
    Reschedule(Box<Request>),
    /// Discard the request.
    Drop,
}

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, SpiderError> {
        Ok(MiddlewareAction::Continue(request))
    }

    async fn process_response(
        &self,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, SpiderError> {
        Ok(MiddlewareAction::Continue(response))
    }

    /// Called when the download, or a later request stage, failed.
    async fn process_exception(
        &self,
        _request: &Request,
        error: SpiderError,
    ) -> Result<MiddlewareAction<SpiderError>, SpiderError> {
        Ok(MiddlewareAction::Continue(error))
    }
}
