//! # Builder Module
//!
//! Provides the `CrawlerBuilder`, a fluent API for assembling a `Crawler`
//! from a spider, [`Settings`], and any custom downloader, middlewares and
//! pipelines.
//!
//! `build()` wires the session-scoped state (stats, duplicate filter,
//! offsite policy, cookie jars, domain slots), registers the built-in
//! middlewares the settings enable at their default priorities, adds the
//! feed exporter when `FEED_URI` is set, and restores a checkpoint when one
//! exists at the checkpoint path.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! async fn run() -> Result<(), SpiderError> {
//!     let settings = Settings::from_pairs(["DOWNLOAD_DELAY=1", "FEED_URI=items.jl"])?;
//!     let crawler = CrawlerBuilder::new(MySpider)
//!         .settings(settings)
//!         .add_middleware(400, MyHeaderMiddleware)
//!         .build()
//!         .await?;
//!     crawler.start_crawl().await
//! }
//! ```

use crate::checkpoint::{checkpoint_path, load_checkpoint};
use crate::crawler::{Crawler, MiddlewareManager};
use crate::downloader::{Downloader, ReqwestClientDownloader};
use crate::dupefilter::{BoundedDupeFilter, DupeFilter, MemoryDupeFilter};
use crate::error::SpiderError;
use crate::fingerprint::Fingerprinter;
use crate::concurrency::DomainPolicy;
use crate::middleware::cookies::CookieJars;
use crate::middleware::{
    priorities, CookiesMiddleware, HttpAuthMiddleware, Middleware, OffsiteMiddleware,
    OffsitePolicy, ProxyMiddleware, RedirectMiddleware, RetryMiddleware,
};
use crate::pipeline::{FeedExportPipeline, FeedSettings, ItemSamplerPipeline, Pipeline};
use crate::request::Request;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::settings::Settings;
use crate::spider::Spider;
use crate::stats::StatCollector;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for the crawler's concurrency settings.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// The maximum number of concurrent downloads.
    pub max_concurrent_downloads: usize,
    /// The number of workers dedicated to parsing responses.
    pub parser_workers: usize,
    /// The maximum number of concurrent item processing pipelines.
    pub max_concurrent_pipelines: usize,
    /// The capacity of communication channels between components.
    pub channel_capacity: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        CrawlerConfig::from(&Settings::default())
    }
}

impl From<&Settings> for CrawlerConfig {
    fn from(settings: &Settings) -> Self {
        CrawlerConfig {
            max_concurrent_downloads: settings.concurrent_requests,
            parser_workers: settings.parser_workers,
            max_concurrent_pipelines: settings.concurrent_items,
            channel_capacity: 1000,
        }
    }
}

pub struct CrawlerBuilder<S: Spider> {
    crawler_config: CrawlerConfig,
    settings: Settings,
    downloader: Option<Arc<dyn Downloader>>,
    spider: Option<S>,
    middlewares: Vec<(i32, Box<dyn Middleware>)>,
    item_pipelines: Vec<Box<dyn Pipeline<S::Item>>>,
    checkpoint_path: Option<PathBuf>,
    checkpoint_interval: Option<Duration>,
}

impl<S: Spider> CrawlerBuilder<S> {
    /// Creates a new `CrawlerBuilder` for a given spider with default settings.
    pub fn new(spider: S) -> Self {
        CrawlerBuilder {
            crawler_config: CrawlerConfig::default(),
            settings: Settings::default(),
            downloader: None,
            spider: Some(spider),
            middlewares: Vec::new(),
            item_pipelines: Vec::new(),
            checkpoint_path: None,
            checkpoint_interval: None,
        }
    }

    /// Replaces the settings. Concurrency limits are taken from them, so call
    /// the concurrency setters afterwards to override individual values.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.crawler_config = CrawlerConfig::from(&settings);
        self.settings = settings;
        self
    }

    /// Sets the maximum number of concurrent downloads.
    pub fn max_concurrent_downloads(mut self, limit: usize) -> Self {
        self.crawler_config.max_concurrent_downloads = limit;
        self
    }

    /// Sets the number of parser workers.
    pub fn max_parser_workers(mut self, limit: usize) -> Self {
        self.crawler_config.parser_workers = limit;
        self
    }

    /// Sets the maximum number of items processed concurrently.
    pub fn max_concurrent_pipelines(mut self, limit: usize) -> Self {
        self.crawler_config.max_concurrent_pipelines = limit;
        self
    }

    /// Sets the capacity of communication channels between components.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.crawler_config.channel_capacity = capacity;
        self
    }

    /// Sets a custom downloader for the crawler.
    pub fn downloader<D: Downloader>(mut self, downloader: D) -> Self {
        self.downloader = Some(Arc::new(downloader));
        self
    }

    /// Adds a middleware at `priority`. Built-ins use the values in
    /// [`priorities`]; ties keep registration order, built-ins first.
    pub fn add_middleware<M: Middleware>(mut self, priority: i32, middleware: M) -> Self {
        self.middlewares.push((priority, Box::new(middleware)));
        self
    }

    /// Adds an item pipeline. The feed exporter, when configured, runs last.
    pub fn add_pipeline<P>(mut self, pipeline: P) -> Self
    where
        P: Pipeline<S::Item> + 'static,
    {
        self.item_pipelines.push(Box::new(pipeline));
        self
    }

    /// Enables checkpointing and sets the path for the checkpoint file.
    /// Takes precedence over `JOBDIR`.
    pub fn with_checkpoint_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.checkpoint_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the interval for periodic checkpointing.
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }

    /// Builds the `Crawler`, restoring checkpointed state if there is any.
    pub async fn build(mut self) -> Result<Crawler<S>, SpiderError> {
        let spider = self.validate_and_get_spider()?;
        let settings = std::mem::take(&mut self.settings);
        let stats = Arc::new(StatCollector::new());

        let extra_seeds = settings
            .start_urls
            .iter()
            .map(|u| Request::get(u))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SpiderError::ConfigurationError(format!("invalid START_URLS: {}", e)))?;
        let first_seed_host = spider
            .start_requests()?
            .first()
            .or(extra_seeds.first())
            .and_then(|r| r.url.host_str().map(str::to_string));

        let offsite = Arc::new(if !settings.offsite_enabled {
            OffsitePolicy::default()
        } else if !settings.allowed_domains.is_empty() {
            OffsitePolicy::new(&settings.allowed_domains)
        } else {
            OffsitePolicy::new(spider.allowed_domains())
        });
        let dupefilter: Arc<dyn DupeFilter> = match settings.dupefilter_capacity {
            Some(capacity) => {
                debug!("Using bounded duplicate filter with capacity {}", capacity);
                Arc::new(BoundedDupeFilter::new(capacity))
            }
            None => Arc::new(MemoryDupeFilter::new()),
        };
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig {
                order: settings.scheduler_order,
                max_pending: settings.scheduler_max_pending,
                overflow: settings.scheduler_overflow,
                block_timeout: settings.scheduler_block_timeout,
                domain_policy: DomainPolicy {
                    concurrency: settings.concurrent_requests_per_domain,
                    delay: settings.download_delay,
                    randomize_delay: settings.randomize_download_delay,
                },
                fingerprinter: Fingerprinter::with_ignored_headers(
                    &settings.fingerprint_ignored_headers,
                ),
            },
            dupefilter,
            Arc::clone(&offsite),
            Arc::clone(&stats),
        ));

        let middlewares = self.assemble_middlewares(
            &settings,
            &offsite,
            first_seed_host.as_deref(),
            &stats,
        )?;

        if let Some(path) = &settings.itemsampler_file {
            let sampler = ItemSamplerPipeline::<S::Item>::new(
                path.clone(),
                settings.itemsampler_count,
                spider.name(),
            );
            info!(
                "Sampling up to {} items into {}",
                settings.itemsampler_count,
                path.display()
            );
            self.item_pipelines.push(Box::new(sampler));
        }

        if let Some(uri) = &settings.feed_uri {
            let feed = FeedExportPipeline::<S::Item>::new(
                FeedSettings {
                    uri: uri.clone(),
                    format: settings.feed_format,
                    store_empty: settings.feed_store_empty,
                    fields: settings.feed_export_fields.clone(),
                },
                spider.name(),
            )?;
            info!("Exporting items as {} to {}", settings.feed_format, feed.uri());
            self.item_pipelines.push(Box::new(feed));
        }

        let downloader = match self.downloader.take() {
            Some(downloader) => downloader,
            None => Arc::new(ReqwestClientDownloader::new(
                &settings.user_agent,
                settings.download_timeout,
            )),
        };

        let checkpoint_path = self
            .checkpoint_path
            .take()
            .or_else(|| settings.jobdir.as_deref().map(checkpoint_path));
        let checkpoint_interval = self.checkpoint_interval.or(settings.checkpoint_interval);
        if let Some(path) = &checkpoint_path {
            self.restore_checkpoint(path, &scheduler).await?;
        }

        Ok(Crawler::new(
            scheduler,
            downloader,
            middlewares,
            spider,
            extra_seeds,
            self.item_pipelines,
            self.crawler_config,
            checkpoint_path,
            checkpoint_interval,
            stats,
        ))
    }

    fn assemble_middlewares(
        &mut self,
        settings: &Settings,
        offsite: &Arc<OffsitePolicy>,
        first_seed_host: Option<&str>,
        stats: &Arc<StatCollector>,
    ) -> Result<MiddlewareManager, SpiderError> {
        let mut manager = MiddlewareManager::new();

        if !offsite.is_unrestricted() {
            manager.add(
                priorities::OFFSITE,
                Box::new(OffsiteMiddleware::new(Arc::clone(offsite), Arc::clone(stats))),
            );
        }
        if let Some(user) = &settings.http_auth_user {
            let domain = settings
                .http_auth_domain
                .as_deref()
                .or(first_seed_host)
                .ok_or_else(|| {
                    SpiderError::ConfigurationError(
                        "HTTP_AUTH_DOMAIN must be set when the spider has no start URLs".into(),
                    )
                })?;
            let pass = settings.http_auth_pass.as_deref().unwrap_or_default();
            manager.add(
                priorities::HTTP_AUTH,
                Box::new(HttpAuthMiddleware::new(user, pass, domain)),
            );
        }
        if settings.retry_enabled {
            manager.add(
                priorities::RETRY,
                Box::new(
                    RetryMiddleware::new(Arc::clone(stats))
                        .with_max_retry_times(settings.retry_times)
                        .with_http_codes(settings.retry_http_codes.iter().copied())
                        .with_priority_adjust(settings.retry_priority_adjust),
                ),
            );
        }
        if settings.redirect_enabled {
            manager.add(
                priorities::REDIRECT,
                Box::new(
                    RedirectMiddleware::new(Arc::clone(stats))
                        .with_max_redirect_times(settings.redirect_max_times)
                        .with_priority_adjust(settings.redirect_priority_adjust),
                ),
            );
        }
        if settings.cookies_enabled {
            manager.add(
                priorities::COOKIES,
                Box::new(
                    CookiesMiddleware::new(Arc::new(CookieJars::new()))
                        .with_debug(settings.cookies_debug),
                ),
            );
        }
        let proxy = ProxyMiddleware::new(&settings.proxy_list)?.with_env_proxies();
        if !proxy.is_empty() {
            manager.add(priorities::PROXY, Box::new(proxy));
        }

        for (priority, middleware) in self.middlewares.drain(..) {
            manager.add(priority, middleware);
        }
        debug!("Middleware chain: [{}]", manager.names().join(", "));
        Ok(manager)
    }

    async fn restore_checkpoint(
        &self,
        path: &Path,
        scheduler: &Scheduler,
    ) -> Result<(), SpiderError> {
        debug!("Attempting to load checkpoint from {:?}", path);
        let Some(checkpoint) = load_checkpoint(path)? else {
            debug!("No checkpoint at {:?}; starting fresh", path);
            return Ok(());
        };
        scheduler.restore(checkpoint.scheduler)?;
        for (name, state) in checkpoint.pipelines {
            match self.item_pipelines.iter().find(|p| p.name() == name) {
                Some(pipeline) => pipeline.restore_state(state).await?,
                None => warn!("Checkpoint contains state for unknown pipeline: {}", name),
            }
        }
        Ok(())
    }

    fn validate_and_get_spider(&mut self) -> Result<S, SpiderError> {
        self.settings.validate()?;
        if self.crawler_config.max_concurrent_downloads == 0 {
            return Err(SpiderError::ConfigurationError(
                "max_concurrent_downloads must be greater than 0.".to_string(),
            ));
        }
        if self.crawler_config.parser_workers == 0 {
            return Err(SpiderError::ConfigurationError(
                "parser_workers must be greater than 0.".to_string(),
            ));
        }
        if self.crawler_config.max_concurrent_pipelines == 0 {
            return Err(SpiderError::ConfigurationError(
                "max_concurrent_pipelines must be greater than 0.".to_string(),
            ));
        }
        self.spider.take().ok_or_else(|| {
            SpiderError::ConfigurationError("Crawler must have a spider.".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ParseOutput;
    use crate::response::Response;
    use async_trait::async_trait;

    struct Quotes;

    #[async_trait]
    impl Spider for Quotes {
        type Item = String;

        fn name(&self) -> &str {
            "quotes"
        }

        fn start_urls(&self) -> Vec<String> {
            vec!["http://quotes.example/".into()]
        }

        fn allowed_domains(&self) -> Vec<String> {
            vec!["quotes.example".into()]
        }

        async fn parse(&self, _response: Response) -> Result<ParseOutput<String>, SpiderError> {
            Ok(ParseOutput::new())
        }
    }

    /// Chain entries without their `(priority)` suffix.
    fn bare_names(names: Vec<String>) -> Vec<String> {
        names
            .into_iter()
            .map(|n| n.split('(').next().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn default_chain_is_ordered_by_priority() {
        let settings = Settings::from_pairs(["HTTP_AUTH_USER=u", "HTTP_AUTH_PASS=p"]).unwrap();
        let crawler = CrawlerBuilder::new(Quotes).settings(settings).build().await.unwrap();
        let names = bare_names(crawler.middleware_names());
        let offsite = format!("OffsiteMiddleware({})", crate::middleware::priorities::OFFSITE);
        assert!(crawler.middleware_names().contains(&offsite));
        let expected = ["OffsiteMiddleware", "HttpAuthMiddleware", "RetryMiddleware", "RedirectMiddleware", "CookiesMiddleware"];
        let positions: Vec<usize> = expected
            .iter()
            .map(|n| names.iter().position(|m| m == n).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", names);
    }

    #[tokio::test]
    async fn disabled_middlewares_are_left_out() {
        let settings = Settings::from_pairs([
            "RETRY_ENABLED=false",
            "REDIRECT_ENABLED=false",
            "COOKIES_ENABLED=false",
            "OFFSITE_ENABLED=false",
        ])
        .unwrap();
        let crawler = CrawlerBuilder::new(Quotes).settings(settings).build().await.unwrap();
        let names = bare_names(crawler.middleware_names());
        assert!(!names.iter().any(|n| n == "RetryMiddleware" || n == "CookiesMiddleware"));
        assert!(!names.iter().any(|n| n == "OffsiteMiddleware" || n == "RedirectMiddleware"));

        let defaults = CrawlerBuilder::new(Quotes).build().await.unwrap();
        let names = bare_names(defaults.middleware_names());
        for expected in ["OffsiteMiddleware", "RetryMiddleware", "RedirectMiddleware", "CookiesMiddleware"] {
            assert!(names.iter().any(|n| n == expected), "{} missing from {:?}", expected, names);
        }
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let result = CrawlerBuilder::new(Quotes).max_parser_workers(0).build().await;
        assert!(matches!(result, Err(SpiderError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn bad_feed_uri_is_a_configuration_error() {
        let settings = Settings::from_pairs(["FEED_URI=ftp://host/items.jl"]).unwrap();
        let result = CrawlerBuilder::new(Quotes).settings(settings).build().await;
        assert!(matches!(result, Err(SpiderError::ConfigurationError(_))));
    }
}
