//! The dispatch loop and download tasks.
//!
//! The loop pulls eligible requests from the scheduler while a global permit
//! is available and spawns one task per request. Each task runs the
//! middleware chain around the downloader and settles the outcome: the
//! response goes to the parsers, a replacement request goes back to the
//! scheduler, and failures are logged and counted. When nothing is eligible
//! the loop sleeps on the scheduler's readiness signal, bounded by the time
//! until the next delay-gated domain opens.

use crate::crawler::{Disposition, MiddlewareManager};
use crate::downloader::Downloader;
use crate::error::SpiderError;
use crate::request::Request;
use crate::response::Response;
use crate::scheduler::{EnqueueOutcome, Scheduler, SchedulerState};
use crate::spider::Spider;
use crate::state::CrawlerState;
use crate::stats::StatCollector;
use async_trait::async_trait;
use kanal::AsyncSender;
use log::{debug, error, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const MIN_IDLE_BACKOFF: Duration = Duration::from_millis(5);
const MAX_IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Counts fetches and received responses around the real downloader.
pub(crate) struct MeteredDownloader {
    inner: Arc<dyn Downloader>,
    stats: Arc<StatCollector>,
}

impl MeteredDownloader {
    pub(crate) fn new(inner: Arc<dyn Downloader>, stats: Arc<StatCollector>) -> Self {
        MeteredDownloader { inner, stats }
    }
}

#[async_trait]
impl Downloader for MeteredDownloader {
    async fn download(&self, request: Request) -> Result<Response, SpiderError> {
        StatCollector::increment(&self.stats.requests_sent);
        let response = self.inner.download(request).await?;
        trace!(
            "Downloaded {} ({}, {} bytes in {:?})",
            response.url,
            response.status,
            response.body.len(),
            response.elapsed
        );
        self.stats
            .record_response(response.status.as_u16(), response.body.len());
        Ok(response)
    }
}

/// Everything a download task needs, shared by all of them.
pub(crate) struct DownloadContext<S: Spider> {
    pub scheduler: Arc<Scheduler>,
    pub downloader: MeteredDownloader,
    pub middlewares: MiddlewareManager,
    pub spider: Arc<S>,
    pub state: Arc<CrawlerState>,
    pub res_tx: AsyncSender<Response>,
    pub stats: Arc<StatCollector>,
}

pub(crate) fn spawn_downloader_task<S: Spider>(
    context: DownloadContext<S>,
    max_concurrent_downloads: usize,
) -> tokio::task::JoinHandle<()> {
    let context = Arc::new(context);
    let permits = Arc::new(Semaphore::new(max_concurrent_downloads));

    tokio::spawn(async move {
        trace!(
            "Downloader task started with max_concurrent_downloads: {}",
            max_concurrent_downloads
        );
        let scheduler = Arc::clone(&context.scheduler);
        let mut tasks = JoinSet::new();

        loop {
            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    error!("A download task failed: {:?}", e);
                }
            }

            match scheduler.state() {
                SchedulerState::Stopped => break,
                SchedulerState::Running => {}
                _ => {
                    let _ = tokio::time::timeout(MAX_IDLE_BACKOFF, scheduler.notified()).await;
                    continue;
                }
            }

            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Download permits closed, stopping dispatch.");
                    break;
                }
            };

            let Some(request) = scheduler.next() else {
                drop(permit);
                let backoff = scheduler
                    .next_wakeup()
                    .unwrap_or(MAX_IDLE_BACKOFF)
                    .clamp(MIN_IDLE_BACKOFF, MAX_IDLE_BACKOFF);
                let _ = tokio::time::timeout(backoff, scheduler.notified()).await;
                continue;
            };

            let context = Arc::clone(&context);
            tasks.spawn(async move {
                process_request(&context, request).await;
                drop(permit);
            });
        }

        trace!("Waiting for {} active download tasks to complete", tasks.len());
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("A download task failed: {:?}", e);
            }
        }
        trace!("Downloader task finished");
    })
}

async fn process_request<S: Spider>(context: &DownloadContext<S>, request: Request) {
    let DownloadContext {
        scheduler,
        downloader,
        middlewares,
        spider,
        state,
        res_tx,
        stats,
    } = context;

    trace!("Processing request through middlewares: {}", request.url);
    match middlewares.execute(request.clone(), downloader).await {
        Ok(Disposition::Response(response)) => {
            StatCollector::increment(&stats.requests_succeeded);
            // Hand over to the parsing counter before the slot is released.
            CrawlerState::begin(&state.parsing_responses);
            scheduler.finish(&request);
            if res_tx.send(response).await.is_err() {
                error!("Response channel closed, dropping response for {}", request.url);
                CrawlerState::end(&state.parsing_responses);
            }
            return;
        }
        Ok(Disposition::Reschedule(next)) => {
            let url = next.url.clone();
            match scheduler.enqueue(next).await {
                Ok(EnqueueOutcome::Enqueued) => trace!("Rescheduled {} as {}", request.url, url),
                Ok(outcome) => debug!("Replacement {} for {} not queued: {:?}", url, request.url, outcome),
                Err(e) => error!("Failed to reschedule {} for {}: {}", url, request.url, e),
            }
        }
        Ok(Disposition::Dropped { by }) => {
            debug!("{} dropped {} {}", by, request.method, request.url);
            StatCollector::increment(&stats.requests_dropped);
        }
        Err(e) if e.is_fatal() => {
            error!("Halting crawl after {} {}: {}", request.method, request.url, e);
            stats.record_failure(e.label());
            scheduler.halt();
        }
        Err(e @ SpiderError::Middleware { .. }) => {
            error!("Aborted {} {}: {}", request.method, request.url, e);
            StatCollector::increment(&stats.requests_aborted);
        }
        Err(e) => {
            error!(
                "Gave up on {} {} (retried {} times): {}",
                request.method,
                request.url,
                request.meta_u64("retry_times").unwrap_or(0),
                e
            );
            stats.record_failure(e.label());
            spider.on_failure(&request, &e).await;
        }
    }
    scheduler.finish(&request);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dupefilter::MemoryDupeFilter;
    use crate::item::ParseOutput;
    use crate::middleware::{OffsitePolicy, RetryMiddleware};
    use crate::request::Headers;
    use crate::scheduler::SchedulerConfig;
    use parking_lot::Mutex;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers with a fixed status and counts calls.
    struct FixedStatus {
        status: u16,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Downloader for FixedStatus {
        async fn download(&self, request: Request) -> Result<Response, SpiderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Response::new(
                request,
                StatusCode::from_u16(self.status).unwrap(),
                Headers::new(),
                b"body".to_vec(),
            ))
        }
    }

    #[derive(Default)]
    struct FailureLog {
        failures: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Spider for FailureLog {
        type Item = String;

        fn name(&self) -> &str {
            "failures"
        }

        async fn parse(&self, _response: Response) -> Result<ParseOutput<String>, SpiderError> {
            Ok(ParseOutput::new())
        }

        async fn on_failure(&self, request: &Request, error: &SpiderError) {
            self.failures
                .lock()
                .push(format!("{} {}", request.url, error.label()));
        }
    }

    fn context(
        status: u16,
        middlewares: MiddlewareManager,
    ) -> (DownloadContext<FailureLog>, kanal::AsyncReceiver<Response>) {
        let stats = Arc::new(StatCollector::new());
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(MemoryDupeFilter::new()),
            Arc::new(OffsitePolicy::default()),
            Arc::clone(&stats),
        ));
        scheduler.start();
        let (res_tx, res_rx) = kanal::bounded_async(8);
        let inner = Arc::new(FixedStatus {
            status,
            calls: AtomicUsize::new(0),
        });
        (
            DownloadContext {
                scheduler,
                downloader: MeteredDownloader::new(inner, Arc::clone(&stats)),
                middlewares,
                spider: Arc::new(FailureLog::default()),
                state: CrawlerState::new(),
                res_tx,
                stats,
            },
            res_rx,
        )
    }

    #[tokio::test]
    async fn response_is_handed_to_parsers_before_slot_release() {
        let (ctx, res_rx) = context(200, MiddlewareManager::new());
        ctx.scheduler.enqueue(Request::get("http://a.com/").unwrap()).await.unwrap();
        let request = ctx.scheduler.next().unwrap();
        assert_eq!(ctx.scheduler.in_flight(), 1);

        process_request(&ctx, request).await;

        assert_eq!(ctx.scheduler.in_flight(), 0);
        assert_eq!(ctx.state.parsing_responses.load(Ordering::SeqCst), 1);
        let response = res_rx.recv().await.unwrap();
        assert_eq!(response.status.as_u16(), 200);
        let snapshot = ctx.stats.snapshot();
        assert_eq!(snapshot.requests_sent, 1);
        assert_eq!(snapshot.requests_succeeded, 1);
        assert_eq!(snapshot.responses_received, 1);
    }

    #[tokio::test]
    async fn retries_go_back_through_the_scheduler_then_fail() {
        let mut middlewares = MiddlewareManager::new();
        let stats_for_retry = Arc::new(StatCollector::new());
        middlewares.add(
            550,
            Box::new(RetryMiddleware::new(stats_for_retry).with_max_retry_times(1)),
        );
        let (ctx, _res_rx) = context(503, middlewares);
        ctx.scheduler.enqueue(Request::get("http://a.com/").unwrap()).await.unwrap();

        let first = ctx.scheduler.next().unwrap();
        process_request(&ctx, first).await;
        assert_eq!(ctx.scheduler.len(), 1);

        let retry = ctx.scheduler.next().unwrap();
        assert_eq!(retry.meta_u64("retry_times"), Some(1));
        process_request(&ctx, retry).await;

        assert!(ctx.scheduler.is_idle());
        let snapshot = ctx.stats.snapshot();
        assert_eq!(snapshot.requests_failed_permanently, 1);
        assert_eq!(snapshot.failure_kinds.get("permanent_rejection"), Some(&1));
        assert_eq!(snapshot.response_status_counts.get(&503), Some(&2));
        assert_eq!(
            ctx.spider.failures.lock().as_slice(),
            ["http://a.com/ permanent_rejection".to_string()]
        );
    }
}
