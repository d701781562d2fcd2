//! Runs a request through the downloader middleware chain and the downloader.
//!
//! Middlewares are kept sorted by ascending priority, stable on ties so equal
//! priorities keep registration order. The request side walks the chain
//! upwards, the response and exception sides walk it downwards.

use crate::downloader::Downloader;
use crate::error::SpiderError;
use crate::middleware::{Middleware, MiddlewareAction};
use crate::request::Request;
use crate::response::Response;
use log::{debug, trace};

/// Upper bound on request-side `Reschedule` restarts for a single request.
pub const MAX_CHAIN_RESTARTS: usize = 16;

/// Where a request ended up after the chain.
#[derive(Debug)]
pub enum Disposition {
    /// Hand the response to the spider.
    Response(Response),
    /// A replacement request must go back through the scheduler.
    Reschedule(Request),
    /// A stage discarded the request or its response.
    Dropped { by: String },
}

enum RequestSide {
    Fetch(Request),
    Respond(Response),
    Dropped(String),
    Failed(Request, SpiderError),
}

#[derive(Default)]
pub struct MiddlewareManager {
    middlewares: Vec<(i32, Box<dyn Middleware>)>,
}

impl MiddlewareManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `middleware` at `priority`.
    pub fn add(&mut self, priority: i32, middleware: Box<dyn Middleware>) {
        self.middlewares.push((priority, middleware));
        self.middlewares.sort_by_key(|(priority, _)| *priority);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Middleware names in request-side order.
    pub fn names(&self) -> Vec<String> {
        self.middlewares
            .iter()
            .map(|(priority, mw)| format!("{}({})", mw.name(), priority))
            .collect()
    }

    /// Takes `request` through the request side, the downloader and the
    /// response or exception side.
    ///
    /// `Err` is either a `PermanentRejection`, an unrecovered download
    /// error, or a `SpiderError::Middleware` describing an internal stage
    /// failure that aborts only this request.
    pub async fn execute(
        &self,
        request: Request,
        downloader: &dyn Downloader,
    ) -> Result<Disposition, SpiderError> {
        match self.process_request(request).await? {
            RequestSide::Dropped(by) => Ok(Disposition::Dropped { by }),
            RequestSide::Respond(response) => self.process_response(response, self.len()).await,
            RequestSide::Failed(request, error) => self.process_exception(&request, error).await,
            RequestSide::Fetch(request) => {
                let original = request.clone();
                match downloader.download(request).await {
                    Ok(response) => self.process_response(response, self.len()).await,
                    Err(error) => self.process_exception(&original, error).await,
                }
            }
        }
    }

    async fn process_request(&self, request: Request) -> Result<RequestSide, SpiderError> {
        let mut current = request;
        let mut restarts = 0;

        'chain: loop {
            for (_, middleware) in &self.middlewares {
                let snapshot = current.clone();
                match middleware.process_request(current).await {
                    Ok(MiddlewareAction::Continue(next)) => current = next,
                    Ok(MiddlewareAction::ReturnResponse(response)) => {
                        trace!("{} answered {} without a fetch", middleware.name(), snapshot.url);
                        return Ok(RequestSide::Respond(response));
                    }
                    Ok(MiddlewareAction::Reschedule(replacement)) => {
                        restarts += 1;
                        if restarts > MAX_CHAIN_RESTARTS {
                            return Err(SpiderError::Middleware {
                                middleware: middleware.name().to_string(),
                                message: format!(
                                    "request chain restarted more than {} times for {}",
                                    MAX_CHAIN_RESTARTS, snapshot.url
                                ),
                            });
                        }
                        debug!(
                            "{} replaced {} with {}; restarting chain",
                            middleware.name(),
                            snapshot.url,
                            replacement.url
                        );
                        current = *replacement;
                        continue 'chain;
                    }
                    Ok(MiddlewareAction::Drop) => {
                        return Ok(RequestSide::Dropped(middleware.name().to_string()));
                    }
                    Err(error) => return Ok(RequestSide::Failed(snapshot, error)),
                }
            }
            return Ok(RequestSide::Fetch(current));
        }
    }

    /// Runs response stages below index `from`, highest priority first.
    async fn process_response(
        &self,
        response: Response,
        from: usize,
    ) -> Result<Disposition, SpiderError> {
        let mut current = response;
        for (_, middleware) in self.middlewares[..from].iter().rev() {
            match middleware.process_response(current).await {
                Ok(MiddlewareAction::Continue(next)) => current = next,
                Ok(MiddlewareAction::ReturnResponse(replacement)) => current = replacement,
                Ok(MiddlewareAction::Reschedule(request)) => {
                    return Ok(Disposition::Reschedule(*request))
                }
                Ok(MiddlewareAction::Drop) => {
                    return Ok(Disposition::Dropped {
                        by: middleware.name().to_string(),
                    })
                }
                Err(error) => return Err(stage_error(middleware.as_ref(), error)),
            }
        }
        Ok(Disposition::Response(current))
    }

    async fn process_exception(
        &self,
        request: &Request,
        error: SpiderError,
    ) -> Result<Disposition, SpiderError> {
        let mut current = error;
        for (idx, (_, middleware)) in self.middlewares.iter().enumerate().rev() {
            match middleware.process_exception(request, current).await {
                Ok(MiddlewareAction::Continue(next)) => current = next,
                Ok(MiddlewareAction::ReturnResponse(response)) => {
                    trace!("{} recovered {}", middleware.name(), request.url);
                    return self.process_response(response, idx).await;
                }
                Ok(MiddlewareAction::Reschedule(replacement)) => {
                    return Ok(Disposition::Reschedule(*replacement))
                }
                Ok(MiddlewareAction::Drop) => {
                    return Ok(Disposition::Dropped {
                        by: middleware.name().to_string(),
                    })
                }
                Err(error) => return Err(stage_error(middleware.as_ref(), error)),
            }
        }
        Err(current)
    }
}

/// Keeps rejections and state corruption as they are; anything else a stage
/// raises is an internal failure of that stage.
fn stage_error(middleware: &dyn Middleware, error: SpiderError) -> SpiderError {
    match error {
        SpiderError::PermanentRejection { .. }
        | SpiderError::CorruptedState(_)
        | SpiderError::Middleware { .. } => error,
        other => SpiderError::Middleware {
            middleware: middleware.name().to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Headers;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: String,
        log: Log,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process_request(
            &self,
            request: Request,
        ) -> Result<MiddlewareAction<Request>, SpiderError> {
            self.log.lock().push(format!("req:{}", self.name));
            Ok(MiddlewareAction::Continue(request))
        }

        async fn process_response(
            &self,
            response: Response,
        ) -> Result<MiddlewareAction<Response>, SpiderError> {
            self.log.lock().push(format!("resp:{}", self.name));
            Ok(MiddlewareAction::Continue(response))
        }

        async fn process_exception(
            &self,
            _request: &Request,
            error: SpiderError,
        ) -> Result<MiddlewareAction<SpiderError>, SpiderError> {
            self.log.lock().push(format!("exc:{}", self.name));
            Ok(MiddlewareAction::Continue(error))
        }
    }

    struct StaticDownloader {
        status: Option<u16>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Downloader for StaticDownloader {
        async fn download(&self, request: Request) -> Result<Response, SpiderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.status {
                Some(code) => Ok(Response::new(
                    request,
                    StatusCode::from_u16(code).unwrap(),
                    Headers::new(),
                    Vec::new(),
                )),
                None => Err(SpiderError::timeout(request.url.as_str(), "elapsed")),
            }
        }
    }

    fn downloader(status: Option<u16>) -> StaticDownloader {
        StaticDownloader {
            status,
            calls: AtomicUsize::new(0),
        }
    }

    fn recorder(name: &str, log: &Log) -> Box<dyn Middleware> {
        Box::new(Recorder {
            name: name.to_string(),
            log: Arc::clone(log),
        })
    }

    fn request() -> Request {
        Request::get("http://a.com/").unwrap()
    }

    #[tokio::test]
    async fn ordering_is_ascending_then_descending_and_stable() {
        let log: Log = Arc::default();
        let mut manager = MiddlewareManager::new();
        manager.add(700, recorder("c", &log));
        manager.add(100, recorder("a", &log));
        manager.add(100, recorder("b", &log));

        let disposition = manager.execute(request(), &downloader(Some(200))).await.unwrap();
        assert!(matches!(disposition, Disposition::Response(_)));
        assert_eq!(
            *log.lock(),
            vec!["req:a", "req:b", "req:c", "resp:c", "resp:b", "resp:a"]
        );
    }

    #[tokio::test]
    async fn unrecovered_download_error_reaches_caller() {
        let log: Log = Arc::default();
        let mut manager = MiddlewareManager::new();
        manager.add(1, recorder("a", &log));
        manager.add(2, recorder("b", &log));

        let err = manager.execute(request(), &downloader(None)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(*log.lock(), vec!["req:a", "req:b", "exc:b", "exc:a"]);
    }

    struct Answer;

    #[async_trait]
    impl Middleware for Answer {
        fn name(&self) -> &str {
            "answer"
        }

        async fn process_request(
            &self,
            request: Request,
        ) -> Result<MiddlewareAction<Request>, SpiderError> {
            Ok(MiddlewareAction::ReturnResponse(Response::new(
                request,
                StatusCode::OK,
                Headers::new(),
                b"cached".to_vec(),
            )))
        }

        async fn process_exception(
            &self,
            request: &Request,
            _error: SpiderError,
        ) -> Result<MiddlewareAction<SpiderError>, SpiderError> {
            Ok(MiddlewareAction::ReturnResponse(Response::new(
                request.clone(),
                StatusCode::OK,
                Headers::new(),
                b"fallback".to_vec(),
            )))
        }
    }

    #[tokio::test]
    async fn short_circuit_skips_fetch_but_runs_response_side() {
        let log: Log = Arc::default();
        let mut manager = MiddlewareManager::new();
        manager.add(1, recorder("a", &log));
        manager.add(2, Box::new(Answer));
        manager.add(3, recorder("c", &log));

        let dl = downloader(Some(500));
        let disposition = manager.execute(request(), &dl).await.unwrap();
        match disposition {
            Disposition::Response(r) => assert_eq!(r.body, b"cached"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dl.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock(), vec!["req:a", "resp:c", "resp:a"]);
    }

    struct Recover;

    #[async_trait]
    impl Middleware for Recover {
        fn name(&self) -> &str {
            "recover"
        }

        async fn process_exception(
            &self,
            request: &Request,
            error: SpiderError,
        ) -> Result<MiddlewareAction<SpiderError>, SpiderError> {
            Answer.process_exception(request, error).await
        }
    }

    #[tokio::test]
    async fn recovery_continues_below_the_recovering_stage() {
        let log: Log = Arc::default();
        let mut manager = MiddlewareManager::new();
        manager.add(1, recorder("a", &log));
        manager.add(2, Box::new(Recover));
        manager.add(3, recorder("c", &log));

        let disposition = manager.execute(request(), &downloader(None)).await.unwrap();
        match disposition {
            Disposition::Response(r) => assert_eq!(r.body, b"fallback"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(*log.lock(), vec!["req:a", "req:c", "exc:c", "resp:a"]);
    }

    struct Loop;

    #[async_trait]
    impl Middleware for Loop {
        fn name(&self) -> &str {
            "loop"
        }

        async fn process_request(
            &self,
            request: Request,
        ) -> Result<MiddlewareAction<Request>, SpiderError> {
            Ok(MiddlewareAction::Reschedule(Box::new(request)))
        }
    }

    #[tokio::test]
    async fn endless_request_reschedule_is_an_internal_error() {
        let mut manager = MiddlewareManager::new();
        manager.add(1, Box::new(Loop));
        let err = manager.execute(request(), &downloader(Some(200))).await.unwrap_err();
        assert!(matches!(err, SpiderError::Middleware { .. }));
    }

    struct Dropper;

    #[async_trait]
    impl Middleware for Dropper {
        fn name(&self) -> &str {
            "dropper"
        }

        async fn process_request(
            &self,
            _request: Request,
        ) -> Result<MiddlewareAction<Request>, SpiderError> {
            Ok(MiddlewareAction::Drop)
        }
    }

    #[tokio::test]
    async fn drop_is_reported_with_stage_name() {
        let mut manager = MiddlewareManager::new();
        manager.add(1, Box::new(Dropper));
        let dl = downloader(Some(200));
        match manager.execute(request(), &dl).await.unwrap() {
            Disposition::Dropped { by } => assert_eq!(by, "dropper"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dl.calls.load(Ordering::SeqCst), 0);
    }
}
