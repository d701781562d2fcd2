//! The `Crawler`: ties the scheduler, middleware chain, downloader, spider
//! and item pipelines together and drives a crawl from seeds to shutdown.
//!
//! Shutdown is cooperative. When the crawl goes idle, or on Ctrl-C or
//! `CrawlHandle::stop`, the scheduler moves to `Draining`: nothing new is
//! dispatched, in-flight requests finish, and requests discovered meanwhile
//! are salvaged for the checkpoint. Once nothing is in flight the scheduler
//! is `Stopped`, the channels close behind the last producers, the tasks are
//! joined, and the final checkpoint is written before pipelines close.

use crate::builder::CrawlerConfig;
use crate::checkpoint::save_checkpoint;
use crate::crawler::{
    spawn_downloader_task, spawn_item_processor_task, spawn_parser_task, DownloadContext,
    MeteredDownloader, MiddlewareManager,
};
use crate::downloader::Downloader;
use crate::error::SpiderError;
use crate::pipeline::Pipeline;
use crate::request::Request;
use crate::scheduler::{EnqueueOutcome, Scheduler, SchedulerState};
use crate::spider::Spider;
use crate::state::CrawlerState;
use crate::stats::StatCollector;
use futures_util::future::join_all;
use kanal::bounded_async;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const IDLE_POLL: Duration = Duration::from_millis(100);
const IDLE_CONFIRM: Duration = Duration::from_millis(50);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Controls a crawl from outside the engine. Cheap to clone.
#[derive(Clone)]
pub struct CrawlHandle {
    scheduler: Arc<Scheduler>,
}

impl CrawlHandle {
    /// Stops dispatching; in-flight requests still complete.
    pub fn pause(&self) -> bool {
        self.scheduler.pause()
    }

    pub fn resume(&self) -> bool {
        self.scheduler.resume()
    }

    /// Starts a graceful shutdown.
    pub fn stop(&self) -> bool {
        self.scheduler.request_stop()
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }
}

pub struct Crawler<S: Spider> {
    scheduler: Arc<Scheduler>,
    downloader: Arc<dyn Downloader>,
    middlewares: MiddlewareManager,
    spider: Arc<S>,
    extra_seeds: Vec<Request>,
    item_pipelines: Vec<Box<dyn Pipeline<S::Item>>>,
    config: CrawlerConfig,
    checkpoint_path: Option<PathBuf>,
    checkpoint_interval: Option<Duration>,
    stats: Arc<StatCollector>,
}

impl<S: Spider> Crawler<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        scheduler: Arc<Scheduler>,
        downloader: Arc<dyn Downloader>,
        middlewares: MiddlewareManager,
        spider: S,
        extra_seeds: Vec<Request>,
        item_pipelines: Vec<Box<dyn Pipeline<S::Item>>>,
        config: CrawlerConfig,
        checkpoint_path: Option<PathBuf>,
        checkpoint_interval: Option<Duration>,
        stats: Arc<StatCollector>,
    ) -> Self {
        Crawler {
            scheduler,
            downloader,
            middlewares,
            spider: Arc::new(spider),
            extra_seeds,
            item_pipelines,
            config,
            checkpoint_path,
            checkpoint_interval,
            stats,
        }
    }

    /// A handle that stays valid for the whole crawl.
    pub fn handle(&self) -> CrawlHandle {
        CrawlHandle {
            scheduler: Arc::clone(&self.scheduler),
        }
    }

    /// Returns a cloned Arc to the `StatCollector` instance used by this crawler.
    pub fn get_stats(&self) -> Arc<StatCollector> {
        Arc::clone(&self.stats)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Middleware names in request-side order.
    pub fn middleware_names(&self) -> Vec<String> {
        self.middlewares.names()
    }

    /// Runs the crawl to completion.
    pub async fn start_crawl(self) -> Result<(), SpiderError> {
        let Crawler {
            scheduler,
            downloader,
            middlewares,
            spider,
            extra_seeds,
            item_pipelines,
            config,
            checkpoint_path,
            checkpoint_interval,
            stats,
        } = self;

        info!(
            "Crawler '{}' starting: max_concurrent_downloads={}, parser_workers={}, max_concurrent_pipelines={}, middlewares=[{}]",
            spider.name(),
            config.max_concurrent_downloads,
            config.parser_workers,
            config.max_concurrent_pipelines,
            middlewares.names().join(", ")
        );

        seed(spider.as_ref(), extra_seeds, &scheduler).await?;
        if !scheduler.start() {
            return Err(SpiderError::GeneralError(format!(
                "crawl cannot start from scheduler state {}",
                scheduler.state()
            )));
        }

        let state = CrawlerState::new();
        let pipelines = Arc::new(item_pipelines);
        let capacity = std::cmp::max(
            config.max_concurrent_downloads * 3,
            config.parser_workers * config.max_concurrent_pipelines * 2,
        )
        .max(config.channel_capacity);
        trace!("Creating communication channels with capacity: {}", capacity);
        let (res_tx, res_rx) = bounded_async(capacity);
        let (item_tx, item_rx) = bounded_async(capacity);

        let downloader_task = spawn_downloader_task(
            DownloadContext {
                scheduler: Arc::clone(&scheduler),
                downloader: MeteredDownloader::new(downloader, Arc::clone(&stats)),
                middlewares,
                spider: Arc::clone(&spider),
                state: Arc::clone(&state),
                res_tx,
                stats: Arc::clone(&stats),
            },
            config.max_concurrent_downloads,
        );
        let parser_task = spawn_parser_task(
            Arc::clone(&scheduler),
            Arc::clone(&spider),
            Arc::clone(&state),
            res_rx,
            item_tx,
            config.parser_workers,
            Arc::clone(&stats),
        );
        let item_processor_task = spawn_item_processor_task(
            Arc::clone(&state),
            item_rx,
            Arc::clone(&pipelines),
            config.max_concurrent_pipelines,
            Arc::clone(&stats),
        );

        let checkpoint_task = match (&checkpoint_path, checkpoint_interval) {
            (Some(path), Some(interval)) => {
                let scheduler = Arc::clone(&scheduler);
                let pipelines = Arc::clone(&pipelines);
                let path = path.clone();
                trace!("Starting periodic checkpoint task with interval: {:?}", interval);
                Some(tokio::spawn(async move {
                    let mut timer = tokio::time::interval(interval);
                    timer.tick().await;
                    loop {
                        timer.tick().await;
                        if let Err(e) =
                            save_checkpoint(&path, scheduler.snapshot(), pipelines.as_slice()).await
                        {
                            error!("Periodic checkpoint save failed: {}", e);
                        }
                    }
                }))
            }
            _ => None,
        };

        wait_until_stopped(&scheduler, &state).await;

        let handles = vec![downloader_task, parser_task, item_processor_task];
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Task failed during shutdown: {}", e);
                    }
                }
                trace!("All tasks completed during shutdown");
            }
            Err(_) => {
                warn!(
                    "Tasks did not complete within timeout ({}s), aborting remaining tasks and continuing with shutdown...",
                    SHUTDOWN_TIMEOUT.as_secs()
                );
                aborts.iter().for_each(|a| a.abort());
            }
        }
        if let Some(task) = checkpoint_task {
            task.abort();
        }

        if let Some(path) = &checkpoint_path {
            debug!("Creating final checkpoint at {:?}", path);
            match save_checkpoint(path, scheduler.snapshot(), pipelines.as_slice()).await {
                Ok(()) => info!("Final checkpoint saved to {:?}", path),
                Err(e) => error!("Final checkpoint save failed: {}", e),
            }
        }

        info!("Closing item pipelines...");
        let closing: Vec<_> = pipelines.iter().map(|p| p.close()).collect();
        for (pipeline, result) in pipelines.iter().zip(join_all(closing).await) {
            if let Err(e) = result {
                error!("Pipeline '{}' failed to close: {}", pipeline.name(), e);
            }
        }

        info!("Crawl finished.\n{}", stats);
        if stats.snapshot().failure_kinds.contains_key("corrupted_state") {
            return Err(SpiderError::CorruptedState(
                "the crawl was halted after shared state became inconsistent".into(),
            ));
        }
        Ok(())
    }
}

/// Enqueues the spider's start requests, then `extra`, as one batch.
async fn seed<S: Spider>(
    spider: &S,
    extra: Vec<Request>,
    scheduler: &Scheduler,
) -> Result<(), SpiderError> {
    let mut requests = spider.start_requests()?;
    requests.extend(extra);
    for request in &mut requests {
        request.url.set_fragment(None);
    }
    let total = requests.len();
    let restored = scheduler.len();
    let outcomes = scheduler.enqueue_all(requests).await?;
    let seeded = outcomes
        .iter()
        .filter(|o| **o == EnqueueOutcome::Enqueued)
        .count();
    info!(
        "Seeded {} of {} start requests ({} restored from a checkpoint)",
        seeded, total, restored
    );
    Ok(())
}

/// Watches for idleness, Ctrl-C and drain completion until `Stopped`.
async fn wait_until_stopped(scheduler: &Scheduler, state: &CrawlerState) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        match scheduler.state() {
            SchedulerState::Stopped => break,
            SchedulerState::Draining => {
                if scheduler.try_finish() {
                    continue;
                }
            }
            SchedulerState::Running if scheduler.is_idle() && state.is_idle() => {
                tokio::time::sleep(IDLE_CONFIRM).await;
                if scheduler.is_idle() && state.is_idle() {
                    info!("Crawl has become idle, initiating shutdown.");
                    scheduler.request_stop();
                    continue;
                }
            }
            _ => {}
        }

        tokio::select! {
            result = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                match result {
                    Ok(()) => {
                        info!("Ctrl-C received, initiating graceful shutdown.");
                        scheduler.request_stop();
                    }
                    Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
                }
            }
            _ = tokio::time::sleep(IDLE_POLL) => {}
        }
    }
}
