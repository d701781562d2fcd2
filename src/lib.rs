//! # spider-engine
//!
//! Crawl-control core: a politeness-aware scheduler with duplicate
//! filtering, an ordered downloader middleware chain, a bounded downloader
//! pool, and the engine that drives a [`Spider`] from its seed requests to a
//! clean shutdown.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! #[derive(Debug, Clone, serde::Serialize)]
//! struct Page {
//!     url: String,
//! }
//!
//! struct Pages;
//!
//! #[async_trait]
//! impl Spider for Pages {
//!     type Item = Page;
//!
//!     fn name(&self) -> &str {
//!         "pages"
//!     }
//!
//!     fn start_urls(&self) -> Vec<String> {
//!         vec!["https://example.com/".into()]
//!     }
//!
//!     async fn parse(&self, response: Response) -> Result<ParseOutput<Page>, SpiderError> {
//!         let mut output = ParseOutput::new();
//!         output.add_item(Page { url: response.url.to_string() });
//!         Ok(output)
//!     }
//! }
//!
//! async fn run() -> Result<(), SpiderError> {
//!     let crawler = CrawlerBuilder::new(Pages).build().await?;
//!     crawler.start_crawl().await
//! }
//! ```

pub mod builder;
pub mod checkpoint;
pub mod concurrency;
pub mod crawler;
pub mod downloader;
pub mod dupefilter;
pub mod error;
pub mod fingerprint;
pub mod item;
pub mod middleware;
pub mod pipeline;
pub mod prelude;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod settings;
pub mod spider;
pub mod state;
pub mod stats;

pub use checkpoint::{Checkpoint, SchedulerCheckpoint};
pub use downloader::{Downloader, ReqwestClientDownloader};
pub use error::{PipelineError, SpiderError};

pub use builder::CrawlerBuilder;
pub use crawler::{CrawlHandle, Crawler};
pub use scheduler::Scheduler;
pub use settings::Settings;

pub use async_trait::async_trait;
pub use spider::Spider;
pub use tokio;
